//! Shared plumbing for the canopy broker and its modules: error
//! classification, the job-id codec, journal event types, the broker
//! attribute dictionary, durations, POSIX wait-status helpers, JSON tree
//! utilities, and the collaborator contracts every module talks through.

pub mod attrs;
pub mod errno;
pub mod event;
pub mod fsd;
pub mod job;
pub mod jobid;
pub mod json;
pub mod rpc;
pub mod wait;

pub use errno::{Errno, Error};
pub use jobid::JobId;
