//! Loopback glue between the modules and the journal.
//!
//! In a full instance the job manager owns the eventlog and the
//! resource module owns draining; on a standalone broker the exceptions
//! raised by perilog and killbot loop back into the journal stream so
//! the state engine (and its observers) see them like any other event.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

use canopy_core::event::{EventEntry, JournalEvent};
use canopy_core::rpc::JobExecControl;
use canopy_core::{Error, JobId};

fn now_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Accepts events and streams them to the engine with per-job sequence
/// numbers.
pub struct JournalHub {
    tx: mpsc::Sender<Arc<Vec<JournalEvent>>>,
    seqs: Mutex<HashMap<JobId, i64>>,
}

impl JournalHub {
    pub fn new(tx: mpsc::Sender<Arc<Vec<JournalEvent>>>) -> Self {
        Self {
            tx,
            seqs: Mutex::new(HashMap::new()),
        }
    }

    /// Continue sequences for jobs recovered from the KVS.
    pub fn seed_seq(&self, id: JobId, last_seq: i64) {
        self.seqs.lock().unwrap().insert(id, last_seq);
    }

    pub async fn post(&self, id: JobId, entry: EventEntry) -> Result<(), Error> {
        let seq = {
            let mut seqs = self.seqs.lock().unwrap();
            let seq = seqs.entry(id).or_insert(-1);
            *seq += 1;
            *seq
        };
        self.tx
            .send(Arc::new(vec![JournalEvent {
                id,
                eventlog_seq: seq,
                entry,
            }]))
            .await
            .map_err(|_| Error::io("journal stream closed"))
    }
}

/// Posts control events back into the journal; drains are logged in
/// lieu of a resource module.
pub struct LoopbackControl {
    hub: Arc<JournalHub>,
}

impl LoopbackControl {
    pub fn new(hub: Arc<JournalHub>) -> Self {
        Self { hub }
    }

    async fn post_status(&self, id: JobId, name: &str, status: Option<i32>) -> Result<(), Error> {
        let context = status.map(|status| json!({ "status": status }));
        self.hub
            .post(id, EventEntry::new(now_timestamp(), name, context))
            .await
    }
}

#[async_trait]
impl JobExecControl for LoopbackControl {
    async fn prolog_start(&self, id: JobId, _description: &str) -> Result<(), Error> {
        self.post_status(id, "prolog-start", None).await
    }

    async fn prolog_finish(&self, id: JobId, _description: &str, status: i32) -> Result<(), Error> {
        self.post_status(id, "prolog-finish", Some(status)).await
    }

    async fn epilog_start(&self, id: JobId, _description: &str) -> Result<(), Error> {
        self.post_status(id, "epilog-start", None).await
    }

    async fn epilog_finish(&self, id: JobId, _description: &str, status: i32) -> Result<(), Error> {
        self.post_status(id, "epilog-finish", Some(status)).await
    }

    async fn raise_exception(
        &self,
        id: JobId,
        exc_type: &str,
        severity: i32,
        note: &str,
    ) -> Result<(), Error> {
        info!(%id, exc_type, severity, note, "raising exception");
        self.hub
            .post(
                id,
                EventEntry::new(
                    now_timestamp(),
                    "exception",
                    Some(json!({"type": exc_type, "severity": severity, "note": note})),
                ),
            )
            .await
    }

    async fn drain(&self, targets: &str, reason: &str, mode: &str) -> Result<(), Error> {
        // no resource module on a standalone broker
        warn!(targets, reason, mode, "drain requested");
        Ok(())
    }
}
