//! Job state engine: an indexed, restart-safe view of every job known
//! to the instance, fed by the job manager's event journal.
//!
//! Jobs live in one hashtable; four ordered id-lists (pending, running,
//! inactive, processing) reference into it for queries.  Transitions
//! into `depend` and `run` stall on asynchronous jobspec/R lookups; on
//! restart the same eventlogs replay synchronously from the KVS.

mod engine;
mod grudge;
mod job;
mod jobspec;
mod query;
mod restart;
mod rparse;
mod stats;

pub use engine::{Control, JobStateCtx, run};
pub use grudge::GrudgeSet;
pub use job::{ExceptionInfo, Job, JobResult};
pub use jobspec::JobspecInfo;
pub use query::job_to_json;
pub use restart::init_from_kvs;
pub use rparse::ResourceInfo;
pub use stats::Stats;
