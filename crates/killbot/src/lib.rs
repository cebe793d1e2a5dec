//! Clear out preemptible jobs under job pressure.
//!
//! A workaround for schedulers that don't do preemption, and necessarily
//! dumber than a scheduler could be: it cannot know the impact on the
//! schedule when it guesses which jobs to preempt.
//!
//! Two sets of jobs are maintained:
//! - *victims*: jobs in the run state with `preemptible-after` set.
//!   Candidate victims, though not all may be eligible yet.
//! - *victors*: jobs in the sched state with `preemptible-after` unset
//!   or positive.  These should run in preference to eligible victims.
//!
//! Kill mode is active while both sets are non-empty and at least one
//! victim is eligible; a kill handler then runs periodically,
//! dispatching eligible victims so that victors can run.  The intent is
//! that this module grows by improving handlers while the timer and
//! tracking framework stays put.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, Sleep};
use tracing::{debug, error, warn};

use canopy_core::job::JobState;
use canopy_core::rpc::{JobExecControl, JobNotice, JobUpdate};
use canopy_core::{Error, JobId};

const DEFAULT_KILL_AFTER: f64 = 30.0;
const DEFAULT_KILL_REPEAT: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    /// All eligible victims are dispatched on each invocation.
    Overkill,
    /// One victim is dispatched on each invocation.
    Onekill,
}

impl Handler {
    fn parse(name: &str) -> Option<Handler> {
        match name {
            "overkill" => Some(Handler::Overkill),
            "onekill" => Some(Handler::Onekill),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Handler::Overkill => "overkill",
            Handler::Onekill => "onekill",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KillbotConfig {
    pub handler: Handler,
    /// Longest tolerable victor wait before the first kill (seconds).
    pub kill_after: f64,
    /// Time between kill handler invocations under sustained pressure.
    pub kill_repeat: f64,
}

impl Default for KillbotConfig {
    fn default() -> Self {
        Self {
            handler: Handler::Overkill,
            kill_after: DEFAULT_KILL_AFTER,
            kill_repeat: DEFAULT_KILL_REPEAT,
        }
    }
}

impl KillbotConfig {
    /// Parse the `[job-manager.killbot]` table; missing keys keep their
    /// defaults.
    pub fn from_value(conf: &Value) -> Result<Self, Error> {
        let mut config = KillbotConfig::default();
        let Some(table) = conf.pointer("/job-manager/killbot") else {
            return Ok(config);
        };
        let table = table
            .as_object()
            .ok_or_else(|| Error::invalid("killbot config must be a table"))?;
        for key in table.keys() {
            if !["handler", "kill-after", "kill-repeat"].contains(&key.as_str()) {
                return Err(Error::invalid(format!("killbot: unknown key '{key}'")));
            }
        }
        if let Some(v) = table.get("kill-after") {
            let kill_after = v
                .as_f64()
                .filter(|v| *v >= 0.0)
                .ok_or_else(|| Error::invalid("kill-after must be >= 0"))?;
            config.kill_after = kill_after;
        }
        if let Some(v) = table.get("kill-repeat") {
            let kill_repeat = v
                .as_f64()
                .filter(|v| *v > 0.0)
                .ok_or_else(|| Error::invalid("kill-repeat must be > 0"))?;
            config.kill_repeat = kill_repeat;
        }
        if let Some(v) = table.get("handler") {
            let name = v
                .as_str()
                .ok_or_else(|| Error::invalid("handler must be a string"))?;
            config.handler = Handler::parse(name)
                .ok_or_else(|| Error::invalid(format!("unknown handler '{name}'")))?;
        }
        Ok(config)
    }
}

/// Tracking entry for one victim or victor.
#[derive(Debug, Clone)]
struct JobEntry {
    preemptible_after: Option<f64>,
    t_run: Instant,
    queue: Option<String>,
    /// Requested node count; zero means underspecified, assume one.
    nnodes: i64,
}

fn parse_sysattr_f64(jobspec: Option<&Arc<Value>>, key: &str) -> Option<f64> {
    jobspec?
        .pointer(&format!("/attributes/system/{key}"))
        .and_then(Value::as_f64)
}

fn parse_sysattr_str(jobspec: Option<&Arc<Value>>, key: &str) -> Option<String> {
    jobspec?
        .pointer(&format!("/attributes/system/{key}"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Requested node count from the jobspec resource list; zero when the
/// request does not lead with nodes.
fn parse_nnodes(jobspec: Option<&Arc<Value>>) -> i64 {
    let Some(jobspec) = jobspec else { return 0 };
    let Some(first) = jobspec.pointer("/resources/0") else {
        return 0;
    };
    if first.get("type").and_then(Value::as_str) == Some("node") {
        return first.get("count").and_then(Value::as_i64).unwrap_or(0);
    }
    0
}

/// Control surface for a running killbot.
pub enum KillbotControl {
    Query(oneshot::Sender<Value>),
    Reconfigure(Value, oneshot::Sender<Result<(), Error>>),
}

pub struct Killbot {
    config: KillbotConfig,
    jobmgr: Arc<dyn JobExecControl>,
    victims: HashMap<JobId, JobEntry>,
    victors: HashMap<JobId, JobEntry>,
    kills: u64,
}

impl Killbot {
    pub fn new(config: KillbotConfig, jobmgr: Arc<dyn JobExecControl>) -> Self {
        Self {
            config,
            jobmgr,
            victims: HashMap::new(),
            victors: HashMap::new(),
            kills: 0,
        }
    }

    fn entry_for(&self, notice: &JobNotice, pa: Option<f64>, now: Instant) -> JobEntry {
        let queue = parse_sysattr_str(notice.jobspec.as_ref(), "queue");
        let nnodes = parse_nnodes(notice.jobspec.as_ref());
        if notice.jobspec.is_none() {
            // heuristics only; track the job anyway
            warn!(id = %notice.id, "no jobspec attached to state notice");
        }
        JobEntry {
            preemptible_after: pa,
            t_run: now,
            queue,
            nnodes,
        }
    }

    fn handle_notice(&mut self, notice: &JobNotice) {
        let now = Instant::now();
        let pa = parse_sysattr_f64(notice.jobspec.as_ref(), "preemptible-after");
        match notice.state {
            JobState::Sched => {
                // jobs declaring themselves immediately preemptible are
                // not victors
                if pa.is_none() || pa.unwrap_or(0.0) > 0.0 {
                    let entry = self.entry_for(notice, pa, now);
                    self.victors.insert(notice.id, entry);
                }
            }
            JobState::Run => {
                self.victors.remove(&notice.id);
                if let Some(pa) = pa {
                    if pa >= 0.0 {
                        let entry = self.entry_for(notice, Some(pa), now);
                        self.victims.insert(notice.id, entry);
                    }
                }
            }
            JobState::Cleanup => {
                self.victors.remove(&notice.id);
                self.victims.remove(&notice.id);
            }
            _ => {}
        }
    }

    fn is_eligible(entry: &JobEntry, now: Instant) -> bool {
        let run_time = now.saturating_duration_since(entry.t_run).as_secs_f64();
        entry.preemptible_after.unwrap_or(0.0) <= run_time
    }

    /// Count eligible victims; when none, report the time until the
    /// first becomes eligible.
    fn count_eligible(&self, now: Instant) -> (usize, Option<Duration>) {
        let mut count = 0;
        let mut min_wait: Option<f64> = None;
        for entry in self.victims.values() {
            let run_time = now.saturating_duration_since(entry.t_run).as_secs_f64();
            let wait = entry.preemptible_after.unwrap_or(0.0) - run_time;
            if wait <= 0.0 {
                count += 1;
            } else if min_wait.is_none_or(|w| wait < w) {
                min_wait = Some(wait);
            }
        }
        if count == 0 {
            (0, min_wait.map(Duration::from_secs_f64))
        } else {
            (count, None)
        }
    }

    /// Aggregate requested nodes of victors in `queue`; `None` is the
    /// anonymous queue.  A backlog on one queue must not kill victims
    /// of another.
    fn count_nodes_byqueue(&self, queue: Option<&str>) -> i64 {
        self.victors
            .values()
            .filter(|v| v.queue.as_deref() == queue)
            .map(|v| if v.nnodes > 0 { v.nnodes } else { 1 })
            .sum()
    }

    /// Snapshot the eligible, pressured victim ids before killing:
    /// raising an exception may synchronously feed state changes back
    /// into the tracker, so never kill while iterating the hash.
    fn eligible_victims(&self, now: Instant) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self
            .victims
            .iter()
            .filter(|(_, entry)| Self::is_eligible(entry, now))
            .filter(|(_, entry)| self.count_nodes_byqueue(entry.queue.as_deref()) > 0)
            .map(|(&id, _)| id)
            .collect();
        ids.sort();
        ids
    }

    async fn preempt(&mut self, id: JobId) {
        if let Err(err) = self
            .jobmgr
            .raise_exception(
                id,
                "preempt",
                0,
                &format!("killbot/{}", self.config.handler.name()),
            )
            .await
        {
            error!(%id, %err, "killbot: raise_exception");
        }
        self.kills += 1;
    }

    /// Run the configured handler; returns the number of victims
    /// dispatched.
    async fn dispatch(&mut self) -> usize {
        let now = Instant::now();
        let mut ids = self.eligible_victims(now);
        if self.config.handler == Handler::Onekill {
            ids.truncate(1);
        }
        let count = ids.len();
        for id in ids {
            self.preempt(id).await;
        }
        count
    }

    fn query(&self, kill_active: bool, age_active: bool) -> Value {
        let (eligible, _) = self.count_eligible(Instant::now());
        json!({
            "eligible-victims": eligible,
            "kill-active": kill_active,
            "age-active": age_active,
            "kill-after": self.config.kill_after,
            "kill-repeat": self.config.kill_repeat,
            "handler": self.config.handler.name(),
            "kills": self.kills,
        })
    }

    fn update_timers(
        &self,
        kill_timer: &mut Option<Pin<Box<Sleep>>>,
        age_timer: &mut Option<Pin<Box<Sleep>>>,
    ) {
        let (eligible, min_wait) = self.count_eligible(Instant::now());
        let victor_count = self.victors.len();

        if kill_timer.is_some() {
            if victor_count == 0 || eligible == 0 {
                *kill_timer = None;
            }
        } else if victor_count > 0 && eligible > 0 {
            *kill_timer = Some(Box::pin(tokio::time::sleep(Duration::from_secs_f64(
                self.config.kill_after,
            ))));
        }

        if age_timer.is_some() {
            if kill_timer.is_some() {
                *age_timer = None;
            }
        } else if kill_timer.is_none() {
            if let Some(wait) = min_wait {
                *age_timer = Some(Box::pin(tokio::time::sleep(wait)));
            }
        }
    }

    /// Consume the job feed until it closes, dispatching eligible
    /// victims while queued victors wait.
    pub async fn run(
        mut self,
        mut updates: broadcast::Receiver<JobUpdate>,
        mut control: mpsc::Receiver<KillbotControl>,
    ) {
        let mut kill_timer: Option<Pin<Box<Sleep>>> = None;
        let mut age_timer: Option<Pin<Box<Sleep>>> = None;
        let mut control_open = true;
        loop {
            tokio::select! {
                update = updates.recv() => match update {
                    Ok(JobUpdate::State(notice)) => {
                        self.handle_notice(&notice);
                        self.update_timers(&mut kill_timer, &mut age_timer);
                    }
                    Ok(JobUpdate::Event { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "job feed lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = async { kill_timer.as_mut().unwrap().await }, if kill_timer.is_some() => {
                    let count = self.dispatch().await;
                    debug!(
                        handler = self.config.handler.name(),
                        count,
                        "killbot dispatched victims"
                    );
                    // periodic until pressure clears
                    kill_timer = Some(Box::pin(tokio::time::sleep(
                        Duration::from_secs_f64(self.config.kill_repeat),
                    )));
                    self.update_timers(&mut kill_timer, &mut age_timer);
                }
                _ = async { age_timer.as_mut().unwrap().await }, if age_timer.is_some() => {
                    age_timer = None;
                    self.update_timers(&mut kill_timer, &mut age_timer);
                }
                cmd = control.recv(), if control_open => match cmd {
                    Some(KillbotControl::Query(reply)) => {
                        let _ = reply.send(self.query(kill_timer.is_some(), age_timer.is_some()));
                    }
                    Some(KillbotControl::Reconfigure(conf, reply)) => {
                        let result = KillbotConfig::from_value(&conf).map(|config| {
                            self.config = config;
                        });
                        let _ = reply.send(result);
                        self.update_timers(&mut kill_timer, &mut age_timer);
                    }
                    None => control_open = false,
                },
            }
        }
    }
}
