//! Extract the job details the engine keeps from a jobspec.
//!
//! The jobspec grammar itself is out of scope; this reads the handful of
//! version-1 fields the views need.  Every defect here is non-fatal:
//! the job is listed with default values instead.

use std::sync::Arc;

use serde_json::Value;

use canopy_core::{Error, JobId};
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct JobspecInfo {
    pub name: Option<String>,
    pub queue: Option<String>,
    pub ntasks: i32,
    pub cores_per_slot: Option<i32>,
    pub job_dict: Option<Value>,
    pub value: Option<Arc<Value>>,
}

/// Basename of the command path.  A trailing slash is somebody's
/// mistake; fall back to the full path.
fn parse_job_name(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some((_, base)) if !base.is_empty() => base,
        _ => path,
    }
}

fn res_level(v: &Value) -> Option<(&str, i64, Option<&Value>)> {
    let entry = v.as_array()?.first()?;
    let typ = entry.get("type")?.as_str()?;
    let count = entry.get("count")?.as_i64()?;
    Some((typ, count, entry.get("with")))
}

/// Count tasks: `count.total` when given, else slots with one task per
/// slot, from the `node->slot->core` or `slot->core` shapes.
fn parse_ntasks(id: JobId, tasks: &Value, resources: &Value) -> (i32, Option<i32>) {
    let count = tasks
        .as_array()
        .and_then(|t| t.first())
        .and_then(|t| t.get("count"));
    if let Some(total) = count.and_then(|c| c.get("total")).and_then(Value::as_i64) {
        return (total as i32, None);
    }
    let per_slot = count.and_then(|c| c.get("per_slot")).and_then(Value::as_i64);
    if per_slot != Some(1) {
        warn!(%id, "unexpected per_slot task count");
        return (0, None);
    }
    let Some((t0, c0, w0)) = res_level(resources) else {
        warn!(%id, "malformed resource list");
        return (0, None);
    };
    match (t0, w0.and_then(res_level)) {
        ("slot", Some(("core", cores, None))) => (c0 as i32, Some(cores as i32)),
        ("node", Some(("slot", slots, Some(w1)))) => match res_level(w1) {
            Some(("core", cores, None)) => ((c0 * slots) as i32, Some(cores as i32)),
            _ => {
                warn!(%id, "unexpected resource shape");
                (0, None)
            }
        },
        _ => {
            warn!(%id, "unexpected resource shape");
            (0, None)
        }
    }
}

/// Parse what the engine keeps.  Returns defaults (never an error) for
/// any defect below the JSON syntax level.
pub fn parse(id: JobId, s: &str) -> Result<JobspecInfo, Error> {
    let jobspec: Value = serde_json::from_str(s)
        .map_err(|err| Error::invalid(format!("job {id} invalid jobspec: {err}")))?;

    let mut info = JobspecInfo::default();

    let job_dict = jobspec
        .pointer("/attributes/system/job")
        .filter(|v| v.is_object());
    if let Some(dict) = job_dict {
        info.name = dict.get("name").and_then(Value::as_str).map(str::to_string);
        info.job_dict = Some(dict.clone());
    }
    info.queue = jobspec
        .pointer("/attributes/system/queue")
        .and_then(Value::as_str)
        .map(str::to_string);

    let command = jobspec
        .pointer("/tasks/0/command")
        .and_then(Value::as_array);
    if info.name.is_none() {
        match command.and_then(|c| c.first()).and_then(Value::as_str) {
            Some(arg0) => info.name = Some(parse_job_name(arg0).to_string()),
            None => warn!(%id, "invalid job command"),
        }
    }

    match (jobspec.get("tasks"), jobspec.get("resources")) {
        (Some(tasks), Some(resources)) => {
            let (ntasks, cores_per_slot) = parse_ntasks(id, tasks, resources);
            info.ntasks = ntasks;
            info.cores_per_slot = cores_per_slot;
        }
        _ => warn!(%id, "jobspec lacks tasks or resources"),
    }

    info.value = Some(Arc::new(jobspec));
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(v: Value) -> String {
        v.to_string()
    }

    #[test]
    fn name_from_arg0() {
        let s = spec(json!({
            "tasks": [{"command": ["/bin/sleep", "60"], "count": {"total": 4}}],
            "resources": [],
            "attributes": {"system": {}},
        }));
        let info = parse(JobId(1), &s).unwrap();
        assert_eq!(info.name.as_deref(), Some("sleep"));
        assert_eq!(info.ntasks, 4);
    }

    #[test]
    fn name_override_and_queue() {
        let s = spec(json!({
            "tasks": [{"command": ["/bin/true"], "count": {"total": 1}}],
            "resources": [],
            "attributes": {"system": {"queue": "batch", "job": {"name": "myjob"}}},
        }));
        let info = parse(JobId(1), &s).unwrap();
        assert_eq!(info.name.as_deref(), Some("myjob"));
        assert_eq!(info.queue.as_deref(), Some("batch"));
        assert!(info.job_dict.is_some());
    }

    #[test]
    fn slot_shapes() {
        let s = spec(json!({
            "tasks": [{"command": ["a"], "count": {"per_slot": 1}}],
            "resources": [
                {"type": "slot", "count": 3, "with": [{"type": "core", "count": 2}]}
            ],
        }));
        let info = parse(JobId(1), &s).unwrap();
        assert_eq!(info.ntasks, 3);
        assert_eq!(info.cores_per_slot, Some(2));

        let s = spec(json!({
            "tasks": [{"command": ["a"], "count": {"per_slot": 1}}],
            "resources": [
                {"type": "node", "count": 2, "with": [
                    {"type": "slot", "count": 4, "with": [{"type": "core", "count": 1}]}
                ]}
            ],
        }));
        let info = parse(JobId(1), &s).unwrap();
        assert_eq!(info.ntasks, 8);
    }

    #[test]
    fn defects_yield_defaults() {
        // not JSON at all is an error
        assert!(parse(JobId(1), "nope").is_err());
        // structurally off jobspecs are tolerated
        let info = parse(JobId(1), "{}").unwrap();
        assert_eq!(info.name, None);
        assert_eq!(info.ntasks, 0);
    }
}
