//! Collaborator contracts.
//!
//! The transport, KVS content store, and job manager live outside the
//! core; modules reach them through these traits.  Every error carries an
//! [`crate::Errno`] classification.

use std::sync::Arc;

use async_trait::async_trait;

use crate::errno::Error;
use crate::event::EventEntry;
use crate::job::JobState;
use crate::jobid::JobId;

/// A durable key-value store with directory semantics.
#[async_trait]
pub trait Kvs: Send + Sync {
    async fn lookup(&self, key: &str) -> Result<String, Error>;
    async fn readdir(&self, key: &str) -> Result<Vec<KvsDirEntry>, Error>;
}

#[derive(Debug, Clone)]
pub struct KvsDirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Per-job detail lookups issued by the state engine.
#[async_trait]
pub trait InfoLookup: Send + Sync {
    async fn jobspec(&self, id: JobId) -> Result<String, Error>;
    async fn resource_set(&self, id: JobId) -> Result<String, Error>;
}

/// Job manager control surface used by perilog and killbot: execution
/// barriers around prolog/epilog, exception raising, and node draining.
#[async_trait]
pub trait JobExecControl: Send + Sync {
    async fn prolog_start(&self, id: JobId, description: &str) -> Result<(), Error>;
    async fn prolog_finish(&self, id: JobId, description: &str, status: i32)
        -> Result<(), Error>;
    async fn epilog_start(&self, id: JobId, description: &str) -> Result<(), Error>;
    async fn epilog_finish(&self, id: JobId, description: &str, status: i32)
        -> Result<(), Error>;
    async fn raise_exception(
        &self,
        id: JobId,
        exc_type: &str,
        severity: i32,
        note: &str,
    ) -> Result<(), Error>;
    async fn drain(&self, targets: &str, reason: &str, mode: &str) -> Result<(), Error>;
}

/// State-transition notice broadcast by the state engine.
#[derive(Debug, Clone)]
pub struct JobNotice {
    pub id: JobId,
    pub state: JobState,
    pub timestamp: f64,
    pub userid: u32,
    /// Present once the submit-time lookup has completed.
    pub jobspec: Option<Arc<serde_json::Value>>,
    /// Present once the alloc-time lookup has completed.
    pub resources: Option<Arc<serde_json::Value>>,
}

/// Feed consumed by modules observing jobs (perilog, killbot).
#[derive(Debug, Clone)]
pub enum JobUpdate {
    /// The job entered `notice.state`.
    State(JobNotice),
    /// A raw journal event for a job (finish, exception, ...).
    Event { id: JobId, entry: Arc<EventEntry> },
}
