//! Prolog/epilog execution for the job manager.
//!
//! Runs a configured command across the ranks of each job before the
//! allocation is handed to the job shell (prolog) and after the finish
//! event (epilog), with bounded execution time, cancellation on fatal
//! job exceptions, and draining of ranks where the command failed.

mod bulk;
mod config;
mod plugin;

pub use bulk::{BulkEvent, BulkExec, LocalExecutor, OutputLine, ProcEvent, RankExecutor, RankHandle, Stream};
pub use config::{PerilogConfig, PhaseConfig};
pub use plugin::Perilog;
