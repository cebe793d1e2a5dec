//! Reconstitute engine state from the KVS after a broker restart.
//!
//! Jobs are discovered by walking the `job` directory three levels deep
//! (the dot-hex id scheme buckets by time), then each eventlog replays
//! through a dedicated path that advances state without asynchronous
//! stalls: jobspec and R are read synchronously instead.

use serde_json::Value;
use tracing::{debug, info};

use canopy_core::event::decode_eventlog;
use canopy_core::job::JobState;
use canopy_core::rpc::Kvs;
use canopy_core::{Errno, Error, JobId};

use crate::engine::{JobStateCtx, apply_dependency};
use crate::job::Job;
use crate::{jobspec, rparse};

fn restart_update_state(job: &mut Job, newstate: JobState, timestamp: f64) {
    job.state = newstate;
    match newstate {
        JobState::Depend => job.t_submit = timestamp,
        JobState::Run => job.t_run = timestamp,
        JobState::Cleanup => job.t_cleanup = timestamp,
        JobState::Inactive => job.t_inactive = timestamp,
        _ => {}
    }
    job.states_mask |= newstate.mask();
}

fn eventlog_restart_parse(id: JobId, eventlog: &str) -> Result<Job, Error> {
    let entries = decode_eventlog(eventlog)
        .map_err(|err| Error::protocol(format!("error parsing eventlog for {id}: {err}")))?;
    let mut job = Job::new(id);
    for entry in entries {
        job.eventlog_seq += 1;
        let timestamp = entry.timestamp;
        let context = entry.context.as_ref();
        match entry.name.as_str() {
            "submit" => {
                let context = context
                    .ok_or_else(|| Error::protocol(format!("submit context invalid: {id}")))?;
                let userid = context.get("userid").and_then(Value::as_i64);
                let urgency = context.get("urgency").and_then(Value::as_i64);
                let (Some(userid), Some(urgency)) = (userid, urgency) else {
                    return Err(Error::protocol(format!("submit context invalid: {id}")));
                };
                job.userid = userid as u32;
                job.urgency = urgency as i32;
                restart_update_state(&mut job, JobState::Depend, timestamp);
            }
            "depend" => restart_update_state(&mut job, JobState::Priority, timestamp),
            "priority" => {
                let priority = context
                    .and_then(|c| c.get("priority"))
                    .and_then(Value::as_i64)
                    .ok_or_else(|| Error::protocol(format!("priority context invalid: {id}")))?;
                job.priority = priority;
                if job.state == JobState::Priority {
                    restart_update_state(&mut job, JobState::Sched, timestamp);
                }
            }
            "urgency" => {
                let urgency = context
                    .and_then(|c| c.get("urgency"))
                    .and_then(Value::as_i64)
                    .ok_or_else(|| Error::protocol(format!("urgency context invalid: {id}")))?;
                job.urgency = urgency as i32;
            }
            "exception" => {
                let context = context
                    .ok_or_else(|| Error::protocol(format!("exception context invalid: {id}")))?;
                let severity = job.record_exception(context)?;
                if severity == 0 {
                    restart_update_state(&mut job, JobState::Cleanup, timestamp);
                }
            }
            "alloc" => {
                // the recorded alloc context carries the annotations
                // current at allocation time
                if let Some(context) = context {
                    let annotations = context.get("annotations").ok_or_else(|| {
                        Error::protocol(format!("alloc context for {id} invalid"))
                    })?;
                    if !annotations.is_null() {
                        job.annotations = Some(annotations.clone());
                    }
                }
                if job.state == JobState::Sched {
                    restart_update_state(&mut job, JobState::Run, timestamp);
                }
            }
            "finish" => {
                let status = context
                    .and_then(|c| c.get("status"))
                    .and_then(Value::as_i64)
                    .ok_or_else(|| Error::protocol(format!("finish context invalid: {id}")))?;
                job.wait_status = Some(status as i32);
                if status == 0 {
                    job.success = true;
                }
                if job.state == JobState::Run {
                    restart_update_state(&mut job, JobState::Cleanup, timestamp);
                }
            }
            "clean" => restart_update_state(&mut job, JobState::Inactive, timestamp),
            "flux-restart" => {
                // only the sched -> priority revert is defined
                if job.state == JobState::Sched {
                    job.states_mask &= !job.state.mask();
                    restart_update_state(&mut job, JobState::Priority, timestamp);
                }
            }
            "memo" => {
                let context = context
                    .ok_or_else(|| Error::protocol(format!("invalid memo context: {id}")))?;
                job.apply_memo(context);
            }
            name => {
                if let Some(cmd) = name.strip_prefix("dependency-") {
                    apply_dependency(&mut job, cmd, context)?;
                }
            }
        }
    }
    if job.state == JobState::New {
        return Err(Error::protocol(format!(
            "eventlog for {id} has no transition events"
        )));
    }
    Ok(job)
}

async fn map_one(ctx: &mut JobStateCtx, kvs: &dyn Kvs, key: &str) -> Result<(), Error> {
    let id = key
        .strip_prefix("job.")
        .ok_or_else(|| Error::invalid(format!("unexpected job key '{key}'")))
        .and_then(JobId::parse)?;
    if ctx.contains(id) {
        return Err(Error::exists(format!("job {id} discovered twice")));
    }

    let eventlog = kvs.lookup(&format!("{key}.eventlog")).await?;
    let mut job = eventlog_restart_parse(id, &eventlog)?;

    let spec = kvs.lookup(&format!("{key}.jobspec")).await?;
    let info = jobspec::parse(id, &spec)?;
    job.name = info.name;
    job.queue = info.queue;
    job.ntasks = info.ntasks;
    job.cores_per_slot = info.cores_per_slot;
    job.jobspec_job = info.job_dict;
    job.jobspec = info.value;

    if job.states_mask & JobState::Run.mask() != 0 {
        let r = kvs.lookup(&format!("{key}.R")).await?;
        let rinfo = rparse::parse(id, &r)?;
        job.ranks = Some(rinfo.ranks);
        job.nodelist = rinfo.nodelist;
        job.nnodes = rinfo.nnodes;
        job.expiration = rinfo.expiration;
        job.resources = Some(rinfo.value);
    }

    if job.states_mask & JobState::Inactive.mask() != 0 {
        job.compute_result();
        ctx.stats_record_result(job.result);
    }

    let state = job.state;
    debug!(%id, state = %state, "restart: recovered job");
    ctx.insert_job_bare(job);
    ctx.insert_list(id, state);
    ctx.stats_count_restarted(state);
    Ok(())
}

/// Read jobs present in the KVS at startup.  Returns the number of jobs
/// recovered; any failure aborts startup.
pub async fn init_from_kvs(ctx: &mut JobStateCtx, kvs: &dyn Kvs) -> Result<usize, Error> {
    let mut count = 0;
    let mut dirs = vec![("job".to_string(), 0u32)];
    while let Some((key, level)) = dirs.pop() {
        let entries = match kvs.readdir(&key).await {
            Ok(entries) => entries,
            // a fresh instance has no job directory at all
            Err(err) if err.class() == Errno::NotFound && level == 0 => return Ok(0),
            Err(err) => return Err(err),
        };
        for entry in entries {
            if !entry.is_dir {
                continue;
            }
            let child = format!("{key}.{}", entry.name);
            if level == 3 {
                map_one(ctx, kvs, &child).await?;
                count += 1;
            } else {
                dirs.push((child, level + 1));
            }
        }
    }
    ctx.sort_after_restart();
    info!(count, "restart: read jobs");
    Ok(count)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;

    use canopy_core::event::{EventEntry, JournalEvent, encode_eventlog};
    use canopy_core::rpc::KvsDirEntry;

    use super::*;
    use crate::engine::LookupKind;

    /// In-memory KVS with flux-style dotted directory keys.
    pub(crate) struct MemKvs {
        pub entries: HashMap<String, String>,
    }

    #[async_trait]
    impl Kvs for MemKvs {
        async fn lookup(&self, key: &str) -> Result<String, Error> {
            self.entries
                .get(key)
                .cloned()
                .ok_or_else(|| Error::notfound(format!("{key} not found")))
        }

        async fn readdir(&self, key: &str) -> Result<Vec<KvsDirEntry>, Error> {
            let prefix = format!("{key}.");
            let mut names: Vec<KvsDirEntry> = Vec::new();
            for full in self.entries.keys() {
                if let Some(rest) = full.strip_prefix(&prefix) {
                    let (name, is_dir) = match rest.split_once('.') {
                        Some((name, _)) => (name, true),
                        None => (rest, false),
                    };
                    if !names.iter().any(|e| e.name == name) {
                        names.push(KvsDirEntry {
                            name: name.to_string(),
                            is_dir,
                        });
                    }
                }
            }
            if names.is_empty() {
                return Err(Error::notfound(format!("{key} not found")));
            }
            Ok(names)
        }
    }

    pub(crate) fn jobspec_str() -> String {
        json!({
            "tasks": [{"command": ["/bin/hostname"], "count": {"total": 2}}],
            "resources": [],
            "attributes": {"system": {"queue": "batch", "job": {}}},
        })
        .to_string()
    }

    pub(crate) fn r_str() -> String {
        json!({
            "version": 1,
            "execution": {
                "R_lite": [{"rank": "0-1", "children": {"core": "0-1"}}],
                "nodelist": ["node[0-1]"],
                "expiration": 9999.0,
            }
        })
        .to_string()
    }

    /// Feed one journal event through the live path, servicing any
    /// lookup the transition stalls on.
    pub(crate) fn drive(ctx: &mut JobStateCtx, id: JobId, seq: i64, entry: EventEntry) {
        ctx.process_event(&JournalEvent {
            id,
            eventlog_seq: seq,
            entry,
        })
        .unwrap();
        for (id, kind) in ctx.take_lookup_requests() {
            let data = match kind {
                LookupKind::Jobspec => jobspec_str(),
                LookupKind::Resources => r_str(),
            };
            ctx.lookup_done(id, kind, Ok(data));
        }
    }

    pub(crate) fn lifecycle_entries() -> Vec<EventEntry> {
        vec![
            EventEntry::new(100.0, "submit", Some(json!({"userid": 1000, "urgency": 16, "flags": 0}))),
            EventEntry::new(101.0, "depend", None),
            EventEntry::new(102.0, "priority", Some(json!({"priority": 16}))),
            EventEntry::new(103.0, "alloc", Some(json!({"annotations": null}))),
            EventEntry::new(104.0, "finish", Some(json!({"status": 0}))),
            EventEntry::new(105.0, "clean", None),
        ]
    }

    fn kvs_for(id: JobId, entries: &[EventEntry], with_r: bool) -> MemKvs {
        let key = format!("job.{}", id.encode_dothex());
        let mut map = HashMap::new();
        map.insert(format!("{key}.eventlog"), encode_eventlog(entries));
        map.insert(format!("{key}.jobspec"), jobspec_str());
        if with_r {
            map.insert(format!("{key}.R"), r_str());
        }
        MemKvs { entries: map }
    }

    #[tokio::test]
    async fn recovers_completed_job() {
        let id = JobId(100);
        let kvs = kvs_for(id, &lifecycle_entries(), true);
        let mut ctx = JobStateCtx::new();
        assert_eq!(init_from_kvs(&mut ctx, &kvs).await.unwrap(), 1);

        let job = ctx.job(id).unwrap();
        assert_eq!(job.state, JobState::Inactive);
        assert_eq!(job.result.name(), "completed");
        assert_eq!(job.ranks.as_deref(), Some("[0-1]"));
        assert_eq!(job.nnodes, 2);
        assert!(job.success);
        assert_eq!(job.eventlog_seq, 5);
        assert_eq!(ctx.inactive_ids(), [id]);
        assert_eq!(ctx.stats().inactive, 1);
        assert_eq!(ctx.stats().successful, 1);
    }

    #[tokio::test]
    async fn empty_kvs_is_a_fresh_instance() {
        let kvs = MemKvs {
            entries: HashMap::new(),
        };
        let mut ctx = JobStateCtx::new();
        assert_eq!(init_from_kvs(&mut ctx, &kvs).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn eventlog_without_transitions_aborts() {
        let id = JobId(7);
        let entries = vec![EventEntry::new(1.0, "memo", Some(json!({"note": "hi"})))];
        let kvs = kvs_for(id, &entries, false);
        let mut ctx = JobStateCtx::new();
        let err = init_from_kvs(&mut ctx, &kvs).await.unwrap_err();
        assert_eq!(err.class(), Errno::Protocol);
    }

    /// Replaying a journal against an empty engine and replaying part of
    /// it, restarting from the KVS, then continuing, both land on the
    /// same per-job state.
    #[tokio::test]
    async fn reconstitution_matches_live_replay() {
        let id = JobId(100);
        let entries = lifecycle_entries();

        // live path, whole journal
        let mut live = JobStateCtx::new();
        for (seq, entry) in entries.iter().cloned().enumerate() {
            drive(&mut live, id, seq as i64, entry);
        }

        // restart after the first four events, then continue
        let kvs = kvs_for(id, &entries[..4], true);
        let mut restarted = JobStateCtx::new();
        init_from_kvs(&mut restarted, &kvs).await.unwrap();
        for (seq, entry) in entries.iter().cloned().enumerate() {
            // the journal replays from the start; dedup drops the
            // already-applied prefix
            drive(&mut restarted, id, seq as i64, entry);
        }

        let a = live.job(id).unwrap();
        let b = restarted.job(id).unwrap();
        assert_eq!(a.state, b.state);
        assert_eq!(a.states_mask, b.states_mask);
        assert_eq!(a.result.name(), b.result.name());
        assert_eq!(a.success, b.success);
        assert_eq!(a.wait_status, b.wait_status);
        assert_eq!(a.ranks, b.ranks);
        assert_eq!(a.nnodes, b.nnodes);
        assert_eq!(a.eventlog_seq, b.eventlog_seq);
        assert_eq!(a.t_inactive, b.t_inactive);
    }
}
