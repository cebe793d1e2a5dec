use std::collections::VecDeque;
use std::sync::Arc;

use canopy_core::JobId;
use canopy_core::job::{JobState, PRIORITY_MAX, PRIORITY_MIN};

use crate::grudge::GrudgeSet;

/// Final disposition computed when a job reaches inactive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobResult {
    Completed,
    Failed,
    Canceled,
    Timeout,
}

impl JobResult {
    pub fn name(self) -> &'static str {
        match self {
            JobResult::Completed => "completed",
            JobResult::Failed => "failed",
            JobResult::Canceled => "canceled",
            JobResult::Timeout => "timeout",
        }
    }
}

/// First and lowest-severity exception observed for a job.
#[derive(Debug, Clone)]
pub struct ExceptionInfo {
    pub exc_type: String,
    pub severity: i32,
    pub note: Option<String>,
    pub context: serde_json::Value,
}

pub(crate) const TRANSITION_REVERT: u32 = 1;
pub(crate) const TRANSITION_CONDITIONAL: u32 = 2;

#[derive(Debug, Clone)]
pub(crate) struct StateTransition {
    pub state: JobState,
    pub processed: bool,
    pub timestamp: f64,
    pub flags: u32,
    pub expected_state: JobState,
}

#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub userid: u32,
    pub urgency: i32,
    pub priority: i64,
    pub state: JobState,
    /// Every state this job has ever occupied.
    pub states_mask: u32,
    /// Every state an event has targeted, processed or queued.
    pub(crate) states_events_mask: u32,

    pub name: Option<String>,
    pub queue: Option<String>,
    pub ntasks: i32,
    pub cores_per_slot: Option<i32>,
    /// The `attributes.system.job` dictionary from the jobspec.
    pub jobspec_job: Option<serde_json::Value>,
    /// The full jobspec, shared with state-change observers.
    pub jobspec: Option<Arc<serde_json::Value>>,
    /// The full R object, shared with state-change observers.
    pub resources: Option<Arc<serde_json::Value>>,

    pub t_submit: f64,
    pub t_run: f64,
    pub t_cleanup: f64,
    pub t_inactive: f64,

    pub ranks: Option<String>,
    pub nodelist: Option<String>,
    pub nnodes: i32,
    pub expiration: f64,

    pub wait_status: Option<i32>,
    pub success: bool,
    pub result: JobResult,
    pub exception: Option<ExceptionInfo>,
    pub dependencies: GrudgeSet,
    pub annotations: Option<serde_json::Value>,

    pub eventlog_seq: i64,
    pub(crate) next_states: VecDeque<StateTransition>,
}

impl Job {
    pub(crate) fn new(id: JobId) -> Self {
        Self {
            id,
            userid: u32::MAX,
            urgency: -1,
            // jobs not yet assigned a priority list after those that
            // have one
            priority: PRIORITY_MIN,
            state: JobState::New,
            states_mask: JobState::New.mask(),
            states_events_mask: JobState::New.mask(),
            name: None,
            queue: None,
            ntasks: 0,
            cores_per_slot: None,
            jobspec_job: None,
            jobspec: None,
            resources: None,
            t_submit: 0.0,
            t_run: 0.0,
            t_cleanup: 0.0,
            t_inactive: 0.0,
            ranks: None,
            nodelist: None,
            nnodes: 0,
            expiration: 0.0,
            wait_status: None,
            success: false,
            result: JobResult::Failed,
            exception: None,
            dependencies: GrudgeSet::new(),
            annotations: None,
            eventlog_seq: -1,
            next_states: VecDeque::new(),
        }
    }

    /// Which end of the pending list to scan from: high-priority jobs
    /// from the head, the rest from the tail.
    pub(crate) fn search_from_head(&self) -> bool {
        self.priority > PRIORITY_MAX / 2
    }

    /// Record an exception if it is the first, or outranks (lower
    /// severity than) the one already held.  Returns the severity.
    pub(crate) fn record_exception(
        &mut self,
        context: &serde_json::Value,
    ) -> Result<i32, canopy_core::Error> {
        use serde_json::Value;

        let exc_type = context.get("type").and_then(Value::as_str);
        let severity = context.get("severity").and_then(Value::as_i64);
        let (Some(exc_type), Some(severity)) = (exc_type, severity) else {
            return Err(canopy_core::Error::protocol(format!(
                "exception context invalid: {}",
                self.id
            )));
        };
        let note = context
            .get("note")
            .and_then(Value::as_str)
            .map(str::to_string);
        let keep = match &self.exception {
            None => true,
            Some(prior) => (severity as i32) < prior.severity,
        };
        if keep {
            self.exception = Some(ExceptionInfo {
                exc_type: exc_type.to_string(),
                severity: severity as i32,
                note,
                context: context.clone(),
            });
        }
        Ok(severity as i32)
    }

    /// Deep-merge a memo under the `user` annotation key, dropping null
    /// leaves.
    pub(crate) fn apply_memo(&mut self, context: &serde_json::Value) {
        use serde_json::Value;

        let mut annotations = self
            .annotations
            .take()
            .unwrap_or_else(|| Value::Object(Default::default()));
        canopy_core::json::path_update(&mut annotations, "user", context);
        canopy_core::json::clear_null(&mut annotations);
        self.annotations = match &annotations {
            Value::Object(map) if map.is_empty() => None,
            _ => Some(annotations),
        };
    }

    /// Compute the final disposition once the job is inactive.
    pub(crate) fn compute_result(&mut self) {
        self.result = if self.success {
            JobResult::Completed
        } else {
            match &self.exception {
                Some(exc) if exc.exc_type == "cancel" => JobResult::Canceled,
                Some(exc) if exc.exc_type == "timeout" => JobResult::Timeout,
                _ => JobResult::Failed,
            }
        };
    }
}
