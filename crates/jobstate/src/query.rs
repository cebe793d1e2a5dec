//! Render jobs to JSON, filtered by an attribute-select list.

use serde_json::{Map, Value, json};

use canopy_core::Error;
use canopy_core::job::JobState;

use crate::job::Job;

const ALL_ATTRS: &[&str] = &[
    "id",
    "userid",
    "urgency",
    "priority",
    "state",
    "name",
    "queue",
    "ntasks",
    "nnodes",
    "ranks",
    "nodelist",
    "t_submit",
    "t_run",
    "t_cleanup",
    "t_inactive",
    "expiration",
    "success",
    "result",
    "waitstatus",
    "exception_occurred",
    "exception_type",
    "exception_severity",
    "exception_note",
    "annotations",
    "dependencies",
];

fn attr_value(job: &Job, attr: &str) -> Result<Option<Value>, Error> {
    let v = match attr {
        "id" => Some(json!(job.id)),
        "userid" => Some(json!(job.userid)),
        "urgency" => Some(json!(job.urgency)),
        "priority" => Some(json!(job.priority)),
        "state" => Some(json!(job.state.name())),
        "name" => job.name.as_ref().map(|v| json!(v)),
        "queue" => job.queue.as_ref().map(|v| json!(v)),
        "ntasks" => Some(json!(job.ntasks)),
        "nnodes" => (job.states_mask & JobState::Run.mask() != 0).then(|| json!(job.nnodes)),
        "ranks" => job.ranks.as_ref().map(|v| json!(v)),
        "nodelist" => job.nodelist.as_ref().map(|v| json!(v)),
        "t_submit" => Some(json!(job.t_submit)),
        "t_run" => (job.states_mask & JobState::Run.mask() != 0).then(|| json!(job.t_run)),
        "t_cleanup" => {
            (job.states_mask & JobState::Cleanup.mask() != 0).then(|| json!(job.t_cleanup))
        }
        "t_inactive" => {
            (job.states_mask & JobState::Inactive.mask() != 0).then(|| json!(job.t_inactive))
        }
        "expiration" => (job.expiration > 0.0).then(|| json!(job.expiration)),
        "success" => (job.state == JobState::Inactive).then(|| json!(job.success)),
        "result" => (job.state == JobState::Inactive).then(|| json!(job.result.name())),
        "waitstatus" => job.wait_status.map(|v| json!(v)),
        "exception_occurred" => Some(json!(job.exception.is_some())),
        "exception_type" => job.exception.as_ref().map(|e| json!(e.exc_type)),
        "exception_severity" => job.exception.as_ref().map(|e| json!(e.severity)),
        "exception_note" => job
            .exception
            .as_ref()
            .and_then(|e| e.note.as_ref())
            .map(|n| json!(n)),
        "annotations" => job.annotations.clone(),
        "dependencies" => (!job.dependencies.is_empty()).then(|| job.dependencies.to_json()),
        _ => return Err(Error::invalid(format!("unknown attribute '{attr}'"))),
    };
    Ok(v)
}

/// Render `job` with the selected attributes; an empty list selects all
/// of them.  Attributes that do not apply to the job's history are
/// omitted rather than defaulted.
pub fn job_to_json(job: &Job, attrs: &[String]) -> Result<Value, Error> {
    let mut out = Map::new();
    if attrs.is_empty() {
        for attr in ALL_ATTRS {
            if let Some(v) = attr_value(job, attr)? {
                out.insert(attr.to_string(), v);
            }
        }
    } else {
        for attr in attrs {
            if let Some(v) = attr_value(job, attr)? {
                out.insert(attr.clone(), v);
            }
        }
    }
    Ok(Value::Object(out))
}
