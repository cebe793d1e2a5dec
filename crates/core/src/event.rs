//! Journal and eventlog entry types.
//!
//! Every job's eventlog is an append-only sequence of entries, stored in
//! the KVS as newline-delimited JSON objects.  The live journal streams
//! the same entries wrapped with the job id and a per-job sequence
//! number.

use serde::{Deserialize, Serialize};

use crate::errno::Error;
use crate::jobid::JobId;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEntry {
    pub timestamp: f64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl EventEntry {
    pub fn new(timestamp: f64, name: impl Into<String>, context: Option<serde_json::Value>) -> Self {
        Self {
            timestamp,
            name: name.into(),
            context,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JournalEvent {
    pub id: JobId,
    pub eventlog_seq: i64,
    pub entry: EventEntry,
}

/// Decode a newline-delimited eventlog.
pub fn decode_eventlog(s: &str) -> Result<Vec<EventEntry>, Error> {
    let mut entries = Vec::new();
    for line in s.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let entry: EventEntry = serde_json::from_str(line)
            .map_err(|err| Error::protocol(format!("malformed eventlog entry: {err}")))?;
        entries.push(entry);
    }
    Ok(entries)
}

/// Encode entries to the newline-delimited eventlog form.
pub fn encode_eventlog(entries: &[EventEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        // EventEntry serialization cannot fail
        out.push_str(&serde_json::to_string(entry).unwrap_or_default());
        out.push('\n');
    }
    out
}
