//! The perilog controller: watches the job feed and runs the configured
//! prolog at run-state entry and the epilog at the finish event.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Sleep;
use tracing::{error, info, warn};

use canopy_core::rpc::{JobExecControl, JobNotice, JobUpdate};
use canopy_core::job::JobState;
use canopy_core::{Error, JobId, wait};
use canopy_idset::{IdSet, RANGE};

use crate::bulk::{BulkEvent, BulkExec, RankExecutor, Stream};
use crate::config::{PerilogConfig, PhaseConfig};

const PROLOG_SERVICE: &str = "job-manager.prolog";
const EPILOG_SERVICE: &str = "job-manager.epilog";

/// Union of the ranks in R's R_lite entries.
fn ranks_from_r(r: &Value) -> Option<IdSet> {
    let rlite = r.pointer("/execution/R_lite")?.as_array()?;
    let mut ids = IdSet::new();
    for entry in rlite {
        let ranks = entry.get("rank")?.as_str()?;
        ids.add(&IdSet::decode(ranks).ok()?).ok()?;
    }
    Some(ids)
}

struct JobInfo {
    userid: u32,
    resources: Option<Arc<Value>>,
}

struct ProcCtl {
    prolog: bool,
    cancel: mpsc::UnboundedSender<()>,
}

pub struct Perilog {
    config: Arc<PerilogConfig>,
    executor: Arc<dyn RankExecutor>,
    jobmgr: Arc<dyn JobExecControl>,
    /// At most one prolog or epilog in flight per job.
    procs: HashMap<JobId, ProcCtl>,
    /// Userid and R captured at run-state entry, for the epilog.
    jobs: HashMap<JobId, JobInfo>,
    done_tx: mpsc::UnboundedSender<JobId>,
    done_rx: mpsc::UnboundedReceiver<JobId>,
    shutting_down: bool,
}

impl Perilog {
    pub fn new(
        config: PerilogConfig,
        executor: Arc<dyn RankExecutor>,
        jobmgr: Arc<dyn JobExecControl>,
    ) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            config: Arc::new(config),
            executor,
            jobmgr,
            procs: HashMap::new(),
            jobs: HashMap::new(),
            done_tx,
            done_rx,
            shutting_down: false,
        }
    }

    /// Consume the job feed until it closes.  `shutdown` reports true
    /// once the broker has entered cleanup; from then on no new epilog
    /// is started.
    pub async fn run(
        mut self,
        mut updates: broadcast::Receiver<JobUpdate>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.shutting_down = *shutdown.borrow();
        loop {
            tokio::select! {
                update = updates.recv() => match update {
                    Ok(update) => self.handle_update(update).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "job feed lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some(id) = self.done_rx.recv() => {
                    self.procs.remove(&id);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *shutdown.borrow() {
                        self.shutting_down = true;
                    }
                }
            }
        }
        // in-flight phases are already running; let them complete
        while !self.procs.is_empty() {
            match self.done_rx.recv().await {
                Some(id) => {
                    self.procs.remove(&id);
                }
                None => break,
            }
        }
    }

    async fn handle_update(&mut self, update: JobUpdate) {
        match update {
            JobUpdate::State(notice) if notice.state == JobState::Run => {
                self.jobs.insert(
                    notice.id,
                    JobInfo {
                        userid: notice.userid,
                        resources: notice.resources.clone(),
                    },
                );
                self.start_prolog(&notice).await;
            }
            JobUpdate::State(notice) if notice.state == JobState::Inactive => {
                self.jobs.remove(&notice.id);
            }
            JobUpdate::State(_) => {}
            JobUpdate::Event { id, entry } => match entry.name.as_str() {
                "finish" => self.start_epilog(id).await,
                "exception" => {
                    let severity = entry
                        .context
                        .as_ref()
                        .and_then(|c| c.get("severity"))
                        .and_then(Value::as_i64);
                    if severity == Some(0) {
                        self.cancel_prolog(id);
                    }
                }
                _ => {}
            },
        }
    }

    fn phase_ranks(&self, phase: &PhaseConfig, resources: Option<&Arc<Value>>) -> Option<IdSet> {
        if phase.per_rank {
            ranks_from_r(resources?)
        } else {
            IdSet::decode("0").ok()
        }
    }

    async fn start_prolog(&mut self, notice: &JobNotice) {
        let Some(phase) = self.config.prolog.clone() else {
            return;
        };
        let id = notice.id;
        let Some(ranks) = self.phase_ranks(&phase, notice.resources.as_ref()) else {
            error!(%id, "prolog: failed to decode ranks from R");
            self.raise(id, "prolog", "failed to start job prolog").await;
            return;
        };
        if self.procs.contains_key(&id) {
            error!(%id, "prolog: phase already in flight");
            return;
        }
        if let Err(err) = self.jobmgr.prolog_start(id, PROLOG_SERVICE).await {
            error!(%id, %err, "prolog_start");
        }
        self.spawn_phase(id, notice.userid, true, phase, ranks);
    }

    async fn start_epilog(&mut self, id: JobId) {
        let Some(phase) = self.config.epilog.clone() else {
            return;
        };
        // Starting new epilogs during shutdown risks overrunning the
        // shutdown deadline; skip them until jobs can survive a
        // restart.  TODO: drop this gate when restart with running
        // jobs lands.
        if self.shutting_down {
            info!(%id, "skipping epilog: broker is shutting down");
            return;
        }
        let Some(info) = self.jobs.get(&id) else {
            // no run state was observed (e.g. canceled before alloc)
            return;
        };
        let userid = info.userid;
        let Some(ranks) = self.phase_ranks(&phase, info.resources.as_ref()) else {
            error!(%id, "epilog: failed to decode ranks from R");
            self.raise(id, "epilog", "failed to start job epilog").await;
            return;
        };
        if self.procs.contains_key(&id) {
            error!(%id, "epilog: phase already in flight");
            return;
        }
        if let Err(err) = self.jobmgr.epilog_start(id, EPILOG_SERVICE).await {
            error!(%id, %err, "epilog_start");
        }
        self.spawn_phase(id, userid, false, phase, ranks);
    }

    fn cancel_prolog(&mut self, id: JobId) {
        if let Some(ctl) = self.procs.get(&id) {
            if ctl.prolog {
                let _ = ctl.cancel.send(());
            }
        }
    }

    async fn raise(&self, id: JobId, exc_type: &str, note: &str) {
        if let Err(err) = self.jobmgr.raise_exception(id, exc_type, 0, note).await {
            error!(%id, %err, "raise_exception");
        }
    }

    fn spawn_phase(&mut self, id: JobId, userid: u32, prolog: bool, phase: PhaseConfig, ranks: IdSet) {
        let (cancel_tx, cancel_rx) = mpsc::unbounded_channel();
        self.procs.insert(
            id,
            ProcCtl {
                prolog,
                cancel: cancel_tx,
            },
        );
        tokio::spawn(run_phase(
            id,
            userid,
            prolog,
            phase,
            ranks,
            self.config.clone(),
            self.executor.clone(),
            self.jobmgr.clone(),
            cancel_rx,
            self.done_tx.clone(),
        ));
    }
}

fn phase_name(prolog: bool) -> &'static str {
    if prolog { "prolog" } else { "epilog" }
}

fn arm(timer: &mut Option<Pin<Box<Sleep>>>, secs: f64) {
    if timer.is_none() {
        *timer = Some(Box::pin(tokio::time::sleep(Duration::from_secs_f64(secs))));
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_phase(
    id: JobId,
    userid: u32,
    prolog: bool,
    phase: PhaseConfig,
    ranks: IdSet,
    config: Arc<PerilogConfig>,
    executor: Arc<dyn RankExecutor>,
    jobmgr: Arc<dyn JobExecControl>,
    mut cancel_rx: mpsc::UnboundedReceiver<()>,
    done_tx: mpsc::UnboundedSender<JobId>,
) {
    let name = phase_name(prolog);
    let env = vec![
        ("FLUX_JOB_ID".to_string(), id.encode_f58()),
        ("FLUX_JOB_USERID".to_string(), userid.to_string()),
    ];

    let rc = match BulkExec::start(executor.as_ref(), &ranks, &phase.command, &env).await {
        Ok(mut bulk) => {
            let mut canceled = false;
            let mut timeout: Option<Pin<Box<Sleep>>> = None;
            let mut kill_timer: Option<Pin<Box<Sleep>>> = None;
            if phase.timeout > 0.0 {
                arm(&mut timeout, phase.timeout);
            }
            let rc = loop {
                tokio::select! {
                    ev = bulk.next_event() => match ev {
                        BulkEvent::Output(line) => {
                            if !config.log_ignored(&line.line) {
                                match line.stream {
                                    Stream::Stdout => {
                                        info!(id = %id.encode_f58(), phase = name, stream = line.stream.name(), "{}", line.line);
                                    }
                                    Stream::Stderr => {
                                        error!(id = %id.encode_f58(), phase = name, stream = line.stream.name(), "{}", line.line);
                                    }
                                }
                            }
                        }
                        BulkEvent::Finished { rc } => break rc,
                    },
                    _ = async { timeout.as_mut().unwrap().await }, if timeout.is_some() => {
                        timeout = None;
                        bulk.kill(libc::SIGTERM);
                        arm(&mut kill_timer, config.prolog_kill_timeout);
                    }
                    _ = async { kill_timer.as_mut().unwrap().await }, if kill_timer.is_some() => {
                        kill_timer = None;
                        bulk.kill(libc::SIGKILL);
                    }
                    Some(()) = cancel_rx.recv() => {
                        if prolog && !canceled && bulk.active_count() > 0 {
                            // disable draining; the failure is induced
                            canceled = true;
                            bulk.kill(libc::SIGTERM);
                            arm(&mut kill_timer, config.prolog_kill_timeout);
                        }
                    }
                }
            };

            // Drain the ranks that failed the phase before the finish
            // event; otherwise their resources could be handed to a
            // new job first.
            if phase.per_rank && !canceled && rc != 0 {
                let failed = bulk.failed_ranks();
                if !failed.is_empty() {
                    let targets = failed.encode(RANGE).unwrap_or_default();
                    let reason = format!("{name} failed for job {}", id.encode_f58());
                    if let Err(err) = jobmgr.drain(&targets, &reason, "update").await {
                        error!(%id, %err, targets, "failed to drain ranks");
                    }
                }
            }
            if prolog && rc != 0 && !canceled {
                raise_prolog_exception(id, rc, jobmgr.as_ref()).await;
            }
            rc
        }
        Err(err) => {
            error!(%id, %err, "failed to create {name} bulk exec");
            if let Err(err) = jobmgr
                .raise_exception(id, name, 0, &format!("failed to start job {name}"))
                .await
            {
                error!(%id, %err, "raise_exception");
            }
            wait::exit_status(1)
        }
    };

    let result = if prolog {
        jobmgr.prolog_finish(id, PROLOG_SERVICE, rc).await
    } else {
        jobmgr.epilog_finish(id, EPILOG_SERVICE, rc).await
    };
    if let Err(err) = result {
        error!(%id, %err, status = rc, "{}_finish", name);
    }
    let _ = done_tx.send(id);
}

/// Raise the job exception before prolog-finish is emitted, so the job
/// is not halfway started before the exception lands.
async fn raise_prolog_exception(id: JobId, status: i32, jobmgr: &dyn JobExecControl) {
    let code = if wait::exited(status) {
        wait::exit_code(status)
    } else {
        -1
    };
    let msg = if wait::signaled(status) || code > 128 {
        let sig = if wait::signaled(status) {
            wait::term_sig(status)
        } else {
            code - 128
        };
        let hint = if sig == libc::SIGTERM {
            " (timeout or job canceled)"
        } else {
            ""
        };
        format!("prolog killed by signal {sig}{hint}")
    } else {
        format!("prolog exited with exit code={code}")
    };
    if let Err(err) = jobmgr.raise_exception(id, "prolog", 0, &msg).await {
        error!(%id, %err, "prolog-finish: raise_exception");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use canopy_core::event::EventEntry;

    use super::*;
    use crate::bulk::LocalExecutor;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        PrologStart(JobId),
        PrologFinish(JobId, i32),
        EpilogStart(JobId),
        EpilogFinish(JobId, i32),
        Exception(JobId, String, i32, String),
        Drain(String, String),
    }

    struct Recorder {
        tx: Mutex<mpsc::UnboundedSender<Call>>,
    }

    impl Recorder {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Call>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    tx: Mutex::new(tx),
                }),
                rx,
            )
        }

        fn record(&self, call: Call) {
            let _ = self.tx.lock().unwrap().send(call);
        }
    }

    #[async_trait]
    impl JobExecControl for Recorder {
        async fn prolog_start(&self, id: JobId, _description: &str) -> Result<(), Error> {
            self.record(Call::PrologStart(id));
            Ok(())
        }
        async fn prolog_finish(
            &self,
            id: JobId,
            _description: &str,
            status: i32,
        ) -> Result<(), Error> {
            self.record(Call::PrologFinish(id, status));
            Ok(())
        }
        async fn epilog_start(&self, id: JobId, _description: &str) -> Result<(), Error> {
            self.record(Call::EpilogStart(id));
            Ok(())
        }
        async fn epilog_finish(
            &self,
            id: JobId,
            _description: &str,
            status: i32,
        ) -> Result<(), Error> {
            self.record(Call::EpilogFinish(id, status));
            Ok(())
        }
        async fn raise_exception(
            &self,
            id: JobId,
            exc_type: &str,
            severity: i32,
            note: &str,
        ) -> Result<(), Error> {
            self.record(Call::Exception(
                id,
                exc_type.to_string(),
                severity,
                note.to_string(),
            ));
            Ok(())
        }
        async fn drain(&self, targets: &str, reason: &str, _mode: &str) -> Result<(), Error> {
            self.record(Call::Drain(targets.to_string(), reason.to_string()));
            Ok(())
        }
    }

    fn r_value() -> Arc<Value> {
        Arc::new(json!({
            "version": 1,
            "execution": {"R_lite": [{"rank": "0-1", "children": {"core": "0"}}]},
        }))
    }

    fn run_notice(id: u64) -> JobUpdate {
        JobUpdate::State(JobNotice {
            id: JobId(id),
            state: JobState::Run,
            timestamp: 1.0,
            userid: 1000,
            jobspec: None,
            resources: Some(r_value()),
        })
    }

    fn finish_event(id: u64) -> JobUpdate {
        JobUpdate::Event {
            id: JobId(id),
            entry: Arc::new(EventEntry::new(2.0, "finish", Some(json!({"status": 0})))),
        }
    }

    fn cancel_event(id: u64) -> JobUpdate {
        JobUpdate::Event {
            id: JobId(id),
            entry: Arc::new(EventEntry::new(
                2.0,
                "exception",
                Some(json!({"type": "cancel", "severity": 0, "note": "bye"})),
            )),
        }
    }

    fn config(v: Value) -> PerilogConfig {
        PerilogConfig::from_value(&v).unwrap()
    }

    struct Harness {
        updates: broadcast::Sender<JobUpdate>,
        shutdown: watch::Sender<bool>,
        calls: mpsc::UnboundedReceiver<Call>,
    }

    fn start(config: PerilogConfig) -> Harness {
        let (recorder, calls) = Recorder::new();
        let (updates, updates_rx) = broadcast::channel(64);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let perilog = Perilog::new(config, Arc::new(LocalExecutor), recorder);
        tokio::spawn(perilog.run(updates_rx, shutdown_rx));
        Harness {
            updates,
            shutdown,
            calls,
        }
    }

    async fn next_call(h: &mut Harness) -> Call {
        tokio::time::timeout(Duration::from_secs(10), h.calls.recv())
            .await
            .expect("timed out waiting for a call")
            .expect("recorder closed")
    }

    #[tokio::test]
    async fn prolog_start_finish_pairing_on_success() {
        let mut h = start(config(json!({
            "job-manager": {"prolog": {"command": ["/bin/true"]}}
        })));
        h.updates.send(run_notice(1)).unwrap();
        assert_eq!(next_call(&mut h).await, Call::PrologStart(JobId(1)));
        assert_eq!(next_call(&mut h).await, Call::PrologFinish(JobId(1), 0));
    }

    #[tokio::test]
    async fn prolog_timeout_kills_and_still_finishes() {
        let mut h = start(config(json!({
            "job-manager": {"prolog": {
                "command": ["/bin/sleep", "3600"],
                "timeout": "500ms",
                "kill-timeout": 0.1,
            }}
        })));
        h.updates.send(run_notice(2)).unwrap();
        assert_eq!(next_call(&mut h).await, Call::PrologStart(JobId(2)));

        match next_call(&mut h).await {
            Call::Exception(id, exc_type, severity, note) => {
                assert_eq!(id, JobId(2));
                assert_eq!(exc_type, "prolog");
                assert_eq!(severity, 0);
                assert!(note.contains("killed by signal 15"), "{note}");
                assert!(note.contains("timeout or job canceled"), "{note}");
            }
            other => panic!("expected exception, got {other:?}"),
        }
        match next_call(&mut h).await {
            Call::PrologFinish(id, status) => {
                assert_eq!(id, JobId(2));
                assert!(wait::signaled(status));
            }
            other => panic!("expected prolog finish, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn canceled_prolog_finishes_without_drain_or_exception() {
        let mut h = start(config(json!({
            "job-manager": {"prolog": {
                "command": ["/bin/sleep", "3600"],
                "per-rank": true,
                "kill-timeout": 0.1,
            }}
        })));
        h.updates.send(run_notice(3)).unwrap();
        assert_eq!(next_call(&mut h).await, Call::PrologStart(JobId(3)));
        h.updates.send(cancel_event(3)).unwrap();

        // the induced failure neither drains nor raises
        match next_call(&mut h).await {
            Call::PrologFinish(id, status) => {
                assert_eq!(id, JobId(3));
                assert!(wait::signaled(status));
            }
            other => panic!("expected prolog finish, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_per_rank_prolog_drains_before_finish() {
        let mut h = start(config(json!({
            "job-manager": {"prolog": {
                "command": ["/bin/false"],
                "per-rank": true,
            }}
        })));
        h.updates.send(run_notice(4)).unwrap();
        assert_eq!(next_call(&mut h).await, Call::PrologStart(JobId(4)));
        match next_call(&mut h).await {
            Call::Drain(targets, reason) => {
                assert_eq!(targets, "0-1");
                assert!(reason.contains("prolog failed for job"), "{reason}");
            }
            other => panic!("expected drain, got {other:?}"),
        }
        match next_call(&mut h).await {
            Call::Exception(_, exc_type, _, note) => {
                assert_eq!(exc_type, "prolog");
                assert!(note.contains("exit code=1"), "{note}");
            }
            other => panic!("expected exception, got {other:?}"),
        }
        match next_call(&mut h).await {
            Call::PrologFinish(id, status) => {
                assert_eq!(id, JobId(4));
                assert_eq!(wait::exit_code(status), 1);
            }
            other => panic!("expected prolog finish, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn spawn_failure_still_raises_and_finishes() {
        let mut h = start(config(json!({
            "job-manager": {"prolog": {"command": ["/no/such/binary"]}}
        })));
        h.updates.send(run_notice(5)).unwrap();
        assert_eq!(next_call(&mut h).await, Call::PrologStart(JobId(5)));
        match next_call(&mut h).await {
            Call::Exception(_, exc_type, _, note) => {
                assert_eq!(exc_type, "prolog");
                assert!(note.contains("exit code=127"), "{note}");
            }
            other => panic!("expected exception, got {other:?}"),
        }
        match next_call(&mut h).await {
            Call::PrologFinish(id, status) => {
                assert_eq!(id, JobId(5));
                assert_eq!(wait::exit_code(status), 127);
            }
            other => panic!("expected prolog finish, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn epilog_runs_at_finish_without_exceptions() {
        let mut h = start(config(json!({
            "job-manager": {"epilog": {"command": ["/bin/false"]}}
        })));
        h.updates.send(run_notice(6)).unwrap();
        h.updates.send(finish_event(6)).unwrap();
        assert_eq!(next_call(&mut h).await, Call::EpilogStart(JobId(6)));
        // epilog failure: finish only, no exception
        match next_call(&mut h).await {
            Call::EpilogFinish(id, status) => {
                assert_eq!(id, JobId(6));
                assert_eq!(wait::exit_code(status), 1);
            }
            other => panic!("expected epilog finish, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn epilog_is_skipped_during_shutdown() {
        let mut h = start(config(json!({
            "job-manager": {
                "prolog": {"command": ["/bin/true"]},
                "epilog": {"command": ["/bin/true"]},
            }
        })));
        h.updates.send(run_notice(7)).unwrap();
        assert_eq!(next_call(&mut h).await, Call::PrologStart(JobId(7)));
        assert_eq!(next_call(&mut h).await, Call::PrologFinish(JobId(7), 0));

        h.shutdown.send(true).unwrap();
        // give the watch update a chance to land before the finish event
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.updates.send(finish_event(7)).unwrap();

        // no epilog calls arrive
        let res = tokio::time::timeout(Duration::from_millis(500), h.calls.recv()).await;
        assert!(res.is_err(), "unexpected call during shutdown: {res:?}");
    }
}
