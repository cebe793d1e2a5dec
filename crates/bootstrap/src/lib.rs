//! Overlay bootstrap: take N independently launched brokers sharing only
//! a process manager and assemble them into a wired tree.
//!
//! Each broker selects a topology, binds listeners for its children,
//! publishes a business card, rendezvouses, resolves its neighbors'
//! cards, and authorizes their keys.  Any failure before finalize aborts
//! the whole instance; a partially wired tree is not recoverable.

mod hostlist;
mod ipaddr;
mod overlay;
mod service;
mod taskmap;
mod topology;
mod wireup;

pub use hostlist::encode_hostlist;
pub use ipaddr::{local_hostname, primary_addr};
pub use overlay::Overlay;
pub use service::Bootstrap;
pub use taskmap::TaskMap;
pub use topology::Topology;
pub use wireup::wireup;
