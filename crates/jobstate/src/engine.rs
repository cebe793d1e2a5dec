use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{error, info, warn};

use canopy_core::event::JournalEvent;
use canopy_core::job::{JobState, PENDING_MASK, URGENCY_MAX, URGENCY_MIN};
use canopy_core::rpc::{InfoLookup, JobNotice, JobUpdate};
use canopy_core::{Errno, Error, JobId};

use crate::job::{Job, StateTransition, TRANSITION_CONDITIONAL, TRANSITION_REVERT};
use crate::query::job_to_json;
use crate::stats::Stats;

/// Apply a `dependency-add`/`dependency-remove` event to a job's grudge
/// set.  Re-adding a used value and removing a non-member are dropped,
/// not errors.
pub(crate) fn apply_dependency(
    job: &mut Job,
    cmd: &str,
    context: Option<&Value>,
) -> Result<(), Error> {
    let id = job.id;
    let description = context
        .and_then(|c| c.get("description"))
        .and_then(Value::as_str)
        .ok_or_else(|| Error::protocol(format!("dependency-{cmd} context invalid: {id}")))?;
    match cmd {
        "add" => {
            if let Err(err) = job.dependencies.add(description) {
                if err.class() != Errno::Exists {
                    error!(%id, %err, "dependency-add");
                }
            }
            Ok(())
        }
        "remove" => {
            if job.dependencies.remove(description).is_err() {
                info!(%id, description, "dependency-remove: not found");
            }
            Ok(())
        }
        _ => Err(Error::protocol(format!(
            "invalid dependency event: dependency-{cmd}"
        ))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    Jobspec,
    Resources,
}

/// Which index list holds a job in a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListKind {
    Processing,
    Pending,
    Running,
    Inactive,
}

fn list_kind(state: JobState) -> ListKind {
    match state {
        JobState::New => ListKind::Processing,
        JobState::Depend | JobState::Priority | JobState::Sched => ListKind::Pending,
        JobState::Run | JobState::Cleanup => ListKind::Running,
        JobState::Inactive => ListKind::Inactive,
    }
}

fn list_remove(list: &mut Vec<JobId>, id: JobId) {
    if let Some(pos) = list.iter().position(|&j| j == id) {
        list.remove(pos);
    }
}

/// Record the latest journal sequence for a job.  Returns true when the
/// event is a duplicate that has already been applied (for instance via
/// restart from the KVS).
fn update_eventlog_seq(job: &mut Job, latest: i64) -> bool {
    if latest < 0 {
        return false;
    }
    if latest <= job.eventlog_seq {
        info!(
            id = %job.id,
            last = job.eventlog_seq,
            latest,
            "duplicate event"
        );
        return true;
    }
    if latest > job.eventlog_seq + 1 {
        info!(id = %job.id, last = job.eventlog_seq, latest, "missed event");
    }
    job.eventlog_seq = latest;
    false
}

type IdSyncWaiter = (Vec<String>, oneshot::Sender<Result<Value, Error>>);

/// The engine state: one owning hashtable and four ordered id-lists
/// referencing into it.
pub struct JobStateCtx {
    jobs: HashMap<JobId, Job>,
    pending: Vec<JobId>,
    running: Vec<JobId>,
    inactive: Vec<JobId>,
    processing: Vec<JobId>,
    paused: bool,
    backlog: VecDeque<Arc<Vec<JournalEvent>>>,
    idsync: HashMap<JobId, Vec<IdSyncWaiter>>,
    lookup_requests: Vec<(JobId, LookupKind)>,
    stats: Stats,
    updates: broadcast::Sender<JobUpdate>,
}

impl Default for JobStateCtx {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStateCtx {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(1024);
        Self {
            jobs: HashMap::new(),
            pending: Vec::new(),
            running: Vec::new(),
            inactive: Vec::new(),
            processing: Vec::new(),
            paused: false,
            backlog: VecDeque::new(),
            idsync: HashMap::new(),
            lookup_requests: Vec::new(),
            stats: Stats::default(),
            updates,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobUpdate> {
        self.updates.subscribe()
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn pending_ids(&self) -> &[JobId] {
        &self.pending
    }

    pub fn running_ids(&self) -> &[JobId] {
        &self.running
    }

    pub fn inactive_ids(&self) -> &[JobId] {
        &self.inactive
    }

    pub fn processing_ids(&self) -> &[JobId] {
        &self.processing
    }

    pub(crate) fn take_lookup_requests(&mut self) -> Vec<(JobId, LookupKind)> {
        std::mem::take(&mut self.lookup_requests)
    }

    fn list_mut(&mut self, kind: ListKind) -> &mut Vec<JobId> {
        match kind {
            ListKind::Processing => &mut self.processing,
            ListKind::Pending => &mut self.pending,
            ListKind::Running => &mut self.running,
            ListKind::Inactive => &mut self.inactive,
        }
    }

    /// Insert into the pending list, which orders by priority descending
    /// then id ascending.  Scan from whichever end is likely nearer.
    fn pending_insert(&mut self, id: JobId) {
        let (priority, from_head) = {
            let job = &self.jobs[&id];
            (job.priority, job.search_from_head())
        };
        let sorts_before = |jobs: &HashMap<JobId, Job>, other: JobId| {
            let o = &jobs[&other];
            o.priority > priority || (o.priority == priority && o.id < id)
        };
        let pos = if from_head {
            let mut pos = 0;
            while pos < self.pending.len() && sorts_before(&self.jobs, self.pending[pos]) {
                pos += 1;
            }
            pos
        } else {
            let mut pos = self.pending.len();
            while pos > 0 && !sorts_before(&self.jobs, self.pending[pos - 1]) {
                pos -= 1;
            }
            pos
        };
        self.pending.insert(pos, id);
    }

    pub(crate) fn insert_list(&mut self, id: JobId, newstate: JobState) {
        match list_kind(newstate) {
            ListKind::Pending => self.pending_insert(id),
            // live additions lead; both lists order newest first
            ListKind::Running => self.running.insert(0, id),
            ListKind::Inactive => self.inactive.insert(0, id),
            ListKind::Processing => self.processing.push(id),
        }
    }

    pub(crate) fn update_job_state(&mut self, id: JobId, newstate: JobState, timestamp: f64) {
        let old_state = self.jobs[&id].state;
        self.stats.update(old_state, newstate);
        let job = self.jobs.get_mut(&id).unwrap();
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

    fn emit_state_notice(&self, id: JobId) {
        let job = &self.jobs[&id];
        let _ = self.updates.send(JobUpdate::State(JobNotice {
            id,
            state: job.state,
            timestamp: match job.state {
                JobState::Run => job.t_run,
                JobState::Cleanup => job.t_cleanup,
                JobState::Inactive => job.t_inactive,
                _ => job.t_submit,
            },
            userid: job.userid,
            jobspec: job.jobspec.clone(),
            resources: job.resources.clone(),
        }));
    }

    fn update_job_state_and_list(&mut self, id: JobId, newstate: JobState, timestamp: f64) {
        let old_state = self.jobs[&id].state;
        // timestamps must be in place before any ordering decisions
        self.update_job_state(id, newstate, timestamp);
        let old_kind = list_kind(old_state);
        let new_kind = list_kind(newstate);
        if old_kind != new_kind {
            list_remove(self.list_mut(old_kind), id);
            self.insert_list(id, newstate);
        } else if new_kind == ListKind::Pending && newstate == JobState::Sched {
            // the queue priority is now known; sort among peers
            list_remove(&mut self.pending, id);
            self.pending_insert(id);
        }
        self.emit_state_notice(id);
    }

    pub(crate) fn complete_inactive(&mut self, id: JobId) {
        let result = {
            let job = self.jobs.get_mut(&id).unwrap();
            job.compute_result();
            job.result
        };
        self.stats.record_result(result);
    }

    fn process_next_state(&mut self, id: JobId) {
        loop {
            let Some(st) = self.jobs[&id].next_states.front().cloned() else {
                break;
            };
            if st.processed {
                break;
            }
            if st.flags & TRANSITION_REVERT != 0 {
                let job = self.jobs.get_mut(&id).unwrap();
                // only revert when the current state is the expected one
                if job.state != st.expected_state {
                    job.next_states.pop_front();
                    continue;
                }
                let cur = job.state.mask();
                job.states_mask &= !cur;
                job.states_mask &= !st.state.mask();
            } else if st.flags & TRANSITION_CONDITIONAL != 0
                && self.jobs[&id].state != st.expected_state
            {
                self.jobs.get_mut(&id).unwrap().next_states.pop_front();
                continue;
            }

            if st.state == JobState::Depend || st.state == JobState::Run {
                // stall the transition on an asynchronous detail fetch
                let kind = if st.state == JobState::Depend {
                    LookupKind::Jobspec
                } else {
                    LookupKind::Resources
                };
                self.lookup_requests.push((id, kind));
                self.jobs
                    .get_mut(&id)
                    .unwrap()
                    .next_states
                    .front_mut()
                    .unwrap()
                    .processed = true;
                break;
            }

            if st.state == JobState::Inactive {
                self.complete_inactive(id);
            }
            self.update_job_state_and_list(id, st.state, st.timestamp);
            self.jobs.get_mut(&id).unwrap().next_states.pop_front();
        }
    }

    fn transition(
        &mut self,
        id: JobId,
        newstate: JobState,
        timestamp: f64,
        flags: u32,
        expected_state: JobState,
    ) {
        {
            let job = self.jobs.get_mut(&id).unwrap();
            // unflagged transitions an event already targeted are noise
            if flags == 0 && newstate.mask() & job.states_events_mask != 0 {
                return;
            }
            job.next_states.push_back(StateTransition {
                state: newstate,
                processed: false,
                timestamp,
                flags,
                expected_state,
            });
            job.states_events_mask |= newstate.mask();
        }
        self.process_next_state(id);
    }

    /// Feed one asynchronous lookup result back to the stalled
    /// transition.  Fetch or parse failures keep default values; the
    /// transition still completes.
    pub(crate) fn lookup_done(&mut self, id: JobId, kind: LookupKind, result: Result<String, Error>) {
        if !self.jobs.contains_key(&id) {
            return;
        }
        match kind {
            LookupKind::Jobspec => match result.and_then(|s| crate::jobspec::parse(id, &s)) {
                Ok(info) => {
                    let job = self.jobs.get_mut(&id).unwrap();
                    job.name = info.name;
                    job.queue = info.queue;
                    job.ntasks = info.ntasks;
                    job.cores_per_slot = info.cores_per_slot;
                    job.jobspec_job = info.job_dict;
                    job.jobspec = info.value;
                }
                Err(err) => warn!(%id, %err, "jobspec lookup failed"),
            },
            LookupKind::Resources => match result.and_then(|s| crate::rparse::parse(id, &s)) {
                Ok(info) => {
                    let job = self.jobs.get_mut(&id).unwrap();
                    job.ranks = Some(info.ranks);
                    job.nodelist = info.nodelist;
                    job.nnodes = info.nnodes;
                    job.expiration = info.expiration;
                    job.resources = Some(info.value);
                }
                Err(err) => warn!(%id, %err, "R lookup failed"),
            },
        }
        let Some(st) = self.jobs[&id].next_states.front().cloned() else {
            return;
        };
        debug_assert!(st.processed);
        self.update_job_state_and_list(id, st.state, st.timestamp);
        if kind == LookupKind::Jobspec {
            self.check_waiting_id(id);
        }
        self.jobs.get_mut(&id).unwrap().next_states.pop_front();
        self.process_next_state(id);
    }

    fn submit_event(&mut self, ev: &JournalEvent) -> Result<(), Error> {
        if !self.jobs.contains_key(&ev.id) {
            let mut job = Job::new(ev.id);
            let dup = update_eventlog_seq(&mut job, ev.eventlog_seq);
            self.jobs.insert(ev.id, job);
            // jobs always start on the processing list
            self.processing.push(ev.id);
            if dup {
                return Ok(());
            }
        }
        let context = ev
            .entry
            .context
            .as_ref()
            .ok_or_else(|| Error::protocol(format!("submit context invalid: {}", ev.id)))?;
        let userid = context.get("userid").and_then(Value::as_i64);
        let urgency = context.get("urgency").and_then(Value::as_i64);
        let flags = context.get("flags").and_then(Value::as_i64);
        let (Some(userid), Some(urgency), Some(_flags)) = (userid, urgency, flags) else {
            return Err(Error::protocol(format!("submit context invalid: {}", ev.id)));
        };
        {
            let job = self.jobs.get_mut(&ev.id).unwrap();
            job.userid = userid as u32;
            job.urgency = urgency as i32;
        }
        self.transition(ev.id, JobState::Depend, ev.entry.timestamp, 0, JobState::New);
        Ok(())
    }

    fn priority_event(
        &mut self,
        id: JobId,
        timestamp: f64,
        context: Option<&Value>,
    ) -> Result<(), Error> {
        let priority = context
            .and_then(|c| c.get("priority"))
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::protocol(format!("priority context invalid: {id}")))?;
        let (orig, in_pending) = {
            let job = self.jobs.get_mut(&id).unwrap();
            let orig = job.priority;
            job.priority = priority;
            (orig, job.state.mask() & PENDING_MASK != 0)
        };
        if in_pending && orig != priority {
            list_remove(&mut self.pending, id);
            self.pending_insert(id);
        }
        self.transition(
            id,
            JobState::Sched,
            timestamp,
            TRANSITION_CONDITIONAL,
            JobState::Priority,
        );
        Ok(())
    }

    fn finish_event(
        &mut self,
        id: JobId,
        timestamp: f64,
        context: Option<&Value>,
    ) -> Result<(), Error> {
        let status = context
            .and_then(|c| c.get("status"))
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::protocol(format!("finish context invalid: {id}")))?;
        {
            let job = self.jobs.get_mut(&id).unwrap();
            job.wait_status = Some(status as i32);
            // success is only ever set here; exceptions need not be
            // consulted
            if status == 0 {
                job.success = true;
            }
        }
        self.transition(id, JobState::Cleanup, timestamp, 0, JobState::New);
        Ok(())
    }

    fn urgency_event(&mut self, id: JobId, context: Option<&Value>) -> Result<(), Error> {
        let urgency = context
            .and_then(|c| c.get("urgency"))
            .and_then(Value::as_i64)
            .filter(|&u| (URGENCY_MIN as i64..=URGENCY_MAX as i64).contains(&u))
            .ok_or_else(|| Error::protocol(format!("urgency context invalid: {id}")))?;
        self.jobs.get_mut(&id).unwrap().urgency = urgency as i32;
        Ok(())
    }

    fn exception_event(
        &mut self,
        id: JobId,
        timestamp: f64,
        context: Option<&Value>,
    ) -> Result<(), Error> {
        let context = context
            .ok_or_else(|| Error::protocol(format!("exception context invalid: {id}")))?;
        let severity = self.jobs.get_mut(&id).unwrap().record_exception(context)?;
        if severity == 0 {
            self.transition(id, JobState::Cleanup, timestamp, 0, JobState::New);
        }
        Ok(())
    }

    fn annotations_event(&mut self, id: JobId, context: Option<&Value>) -> Result<(), Error> {
        let annotations = context
            .and_then(|c| c.get("annotations"))
            .ok_or_else(|| Error::protocol(format!("annotations event context invalid: {id}")))?;
        let job = self.jobs.get_mut(&id).unwrap();
        job.annotations = if annotations.is_null() {
            None
        } else {
            Some(annotations.clone())
        };
        Ok(())
    }

    fn memo_event(&mut self, id: JobId, context: Option<&Value>) -> Result<(), Error> {
        let context =
            context.ok_or_else(|| Error::protocol(format!("invalid memo context: {id}")))?;
        self.jobs.get_mut(&id).unwrap().apply_memo(context);
        Ok(())
    }

    fn dependency_event(
        &mut self,
        id: JobId,
        cmd: &str,
        context: Option<&Value>,
    ) -> Result<(), Error> {
        let job = self.jobs.get_mut(&id).unwrap();
        apply_dependency(job, cmd, context)
    }

    /// Apply one journal event.  Protocol errors are fatal to the
    /// engine; everything else is tolerated.
    pub fn process_event(&mut self, ev: &JournalEvent) -> Result<(), Error> {
        let name = ev.entry.name.as_str();
        if let Some(job) = self.jobs.get_mut(&ev.id) {
            // the sequence check is overridden for memo events since
            // annotations may overwrite them on re-subscription
            if update_eventlog_seq(job, ev.eventlog_seq) && name != "memo" {
                return Ok(());
            }
        } else if name != "submit" {
            error!(id = %ev.id, event = name, "event for unknown job");
            return Ok(());
        }

        let timestamp = ev.entry.timestamp;
        let context = ev.entry.context.as_ref();
        match name {
            "submit" => self.submit_event(ev)?,
            "depend" => self.transition(ev.id, JobState::Priority, timestamp, 0, JobState::New),
            "priority" => self.priority_event(ev.id, timestamp, context)?,
            // the alloc context carries annotations, but only explicit
            // annotations events mutate them
            "alloc" => self.transition(ev.id, JobState::Run, timestamp, 0, JobState::New),
            "finish" => self.finish_event(ev.id, timestamp, context)?,
            "clean" => self.transition(ev.id, JobState::Inactive, timestamp, 0, JobState::New),
            "urgency" => self.urgency_event(ev.id, context)?,
            "exception" => self.exception_event(ev.id, timestamp, context)?,
            "annotations" => self.annotations_event(ev.id, context)?,
            "memo" => self.memo_event(ev.id, context)?,
            "flux-restart" => self.transition(
                ev.id,
                JobState::Priority,
                timestamp,
                TRANSITION_REVERT,
                JobState::Sched,
            ),
            name => {
                if let Some(cmd) = name.strip_prefix("dependency-") {
                    self.dependency_event(ev.id, cmd, context)?;
                }
                // other events are not ours to interpret
            }
        }
        let _ = self.updates.send(JobUpdate::Event {
            id: ev.id,
            entry: Arc::new(ev.entry.clone()),
        });
        Ok(())
    }

    /// Apply a journal batch, or park it while paused.
    pub fn handle_batch(&mut self, batch: Arc<Vec<JournalEvent>>) -> Result<(), Error> {
        if self.paused {
            self.backlog.push_back(batch);
            return Ok(());
        }
        for ev in batch.iter() {
            self.process_event(ev)?;
        }
        Ok(())
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Drain the backlog in order, then resume streaming.
    pub fn unpause(&mut self) -> Result<(), Error> {
        while let Some(batch) = self.backlog.pop_front() {
            for ev in batch.iter() {
                self.process_event(ev)?;
            }
        }
        self.paused = false;
        Ok(())
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Render jobs whose current state is in `mask`, walking pending,
    /// running, then inactive in index order.
    pub fn list_jobs(&self, mask: u32, attrs: &[String]) -> Result<Vec<Value>, Error> {
        let mut out = Vec::new();
        for id in self
            .pending
            .iter()
            .chain(self.running.iter())
            .chain(self.inactive.iter())
        {
            let job = &self.jobs[id];
            if job.state.mask() & mask != 0 {
                out.push(job_to_json(job, attrs)?);
            }
        }
        Ok(out)
    }

    /// Answer a by-id query, or park it until the id is known.
    pub fn lookup_id(
        &mut self,
        id: JobId,
        attrs: Vec<String>,
        reply: oneshot::Sender<Result<Value, Error>>,
    ) {
        match self.jobs.get(&id) {
            Some(job) if job.state != JobState::New => {
                let _ = reply.send(job_to_json(job, &attrs));
            }
            _ => self.idsync.entry(id).or_default().push((attrs, reply)),
        }
    }

    fn check_waiting_id(&mut self, id: JobId) {
        if let Some(waiters) = self.idsync.remove(&id) {
            let job = &self.jobs[&id];
            for (attrs, reply) in waiters {
                let _ = reply.send(job_to_json(job, &attrs));
            }
        }
    }

    // restart support: see restart.rs
    pub(crate) fn insert_job_bare(&mut self, job: Job) {
        self.jobs.insert(job.id, job);
    }

    pub(crate) fn remove_job_bare(&mut self, id: JobId) {
        self.jobs.remove(&id);
    }

    pub(crate) fn contains(&self, id: JobId) -> bool {
        self.jobs.contains_key(&id)
    }

    pub(crate) fn stats_count_restarted(&mut self, state: JobState) {
        self.stats.update(JobState::New, state);
    }

    pub(crate) fn stats_record_result(&mut self, result: crate::job::JobResult) {
        self.stats.record_result(result);
    }

    pub(crate) fn job_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.get_mut(&id)
    }

    /// One sort after restart; live insertions keep order from then on.
    pub(crate) fn sort_after_restart(&mut self) {
        let jobs = &self.jobs;
        self.running.sort_by(|a, b| {
            jobs[b]
                .t_run
                .partial_cmp(&jobs[a].t_run)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        self.inactive.sort_by(|a, b| {
            jobs[b]
                .t_inactive
                .partial_cmp(&jobs[a].t_inactive)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }
}

/// Control surface for a running engine.
pub enum Control {
    Pause(oneshot::Sender<()>),
    Unpause(oneshot::Sender<Result<(), Error>>),
    /// Stop the engine and hand back its state.
    Shutdown,
    List {
        mask: u32,
        attrs: Vec<String>,
        reply: oneshot::Sender<Result<Vec<Value>, Error>>,
    },
    LookupId {
        id: JobId,
        attrs: Vec<String>,
        reply: oneshot::Sender<Result<Value, Error>>,
    },
}

/// Drive the engine: consume journal batches, service the asynchronous
/// jobspec/R lookups, and answer control requests.  Returns the final
/// context when the journal closes; protocol errors stop the engine.
pub async fn run(
    mut ctx: JobStateCtx,
    mut journal: mpsc::Receiver<Arc<Vec<JournalEvent>>>,
    lookup: Arc<dyn InfoLookup>,
    mut control: mpsc::Receiver<Control>,
) -> Result<JobStateCtx, Error> {
    let (done_tx, mut done_rx) =
        mpsc::unbounded_channel::<(JobId, LookupKind, Result<String, Error>)>();
    let mut control_open = true;
    loop {
        for (id, kind) in ctx.take_lookup_requests() {
            let lookup = lookup.clone();
            let done_tx = done_tx.clone();
            tokio::spawn(async move {
                let result = match kind {
                    LookupKind::Jobspec => lookup.jobspec(id).await,
                    LookupKind::Resources => lookup.resource_set(id).await,
                };
                let _ = done_tx.send((id, kind, result));
            });
        }
        tokio::select! {
            batch = journal.recv() => match batch {
                Some(batch) => ctx.handle_batch(batch)?,
                None => break,
            },
            Some((id, kind, result)) = done_rx.recv() => {
                ctx.lookup_done(id, kind, result);
            }
            cmd = control.recv(), if control_open => match cmd {
                Some(Control::Pause(reply)) => {
                    ctx.pause();
                    let _ = reply.send(());
                }
                Some(Control::Unpause(reply)) => {
                    let _ = reply.send(ctx.unpause());
                }
                Some(Control::List { mask, attrs, reply }) => {
                    let _ = reply.send(ctx.list_jobs(mask, &attrs));
                }
                Some(Control::LookupId { id, attrs, reply }) => {
                    ctx.lookup_id(id, attrs, reply);
                }
                Some(Control::Shutdown) => break,
                None => control_open = false,
            },
        }
    }
    Ok(ctx)
}
