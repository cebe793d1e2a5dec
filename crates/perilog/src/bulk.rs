//! Bulk execution of one command across a set of ranks.
//!
//! The actual launch goes through the [`RankExecutor`] contract; the
//! bundled [`LocalExecutor`] runs every rank's copy on the local host
//! via tokio, which is what a single-node instance (and the test suite)
//! needs.  Spawn failures synthesize shell-style wait statuses so a
//! failed phase still drains and finishes.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

use canopy_core::wait;
use canopy_core::{Errno, Error};
use canopy_idset::IdSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn name(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutputLine {
    pub rank: u32,
    pub stream: Stream,
    pub line: String,
}

/// Raised by executors into the shared event channel.
#[derive(Debug)]
pub enum ProcEvent {
    Output(OutputLine),
    Exit { rank: u32, status: i32 },
}

/// Handle to one rank's process: a signal lane.  Exit and output arrive
/// over the event channel given at spawn.
pub struct RankHandle {
    pub rank: u32,
    signal: mpsc::UnboundedSender<i32>,
}

impl RankHandle {
    pub fn new(rank: u32, signal: mpsc::UnboundedSender<i32>) -> Self {
        Self { rank, signal }
    }

    pub fn kill(&self, sig: i32) {
        let _ = self.signal.send(sig);
    }
}

/// The process execution facility: launch one command instance on one
/// rank.  All output lines and the final wait status must be delivered
/// through `events`, output strictly before exit.
#[async_trait]
pub trait RankExecutor: Send + Sync {
    async fn spawn(
        &self,
        rank: u32,
        argv: Vec<String>,
        env: Vec<(String, String)>,
        events: mpsc::UnboundedSender<ProcEvent>,
    ) -> Result<RankHandle, Error>;
}

/// Runs every rank's copy as a local child process.
pub struct LocalExecutor;

async fn read_lines<R: tokio::io::AsyncRead + Unpin>(
    reader: R,
    rank: u32,
    stream: Stream,
    events: mpsc::UnboundedSender<ProcEvent>,
) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let _ = events.send(ProcEvent::Output(OutputLine { rank, stream, line }));
    }
}

#[async_trait]
impl RankExecutor for LocalExecutor {
    async fn spawn(
        &self,
        rank: u32,
        argv: Vec<String>,
        env: Vec<(String, String)>,
        events: mpsc::UnboundedSender<ProcEvent>,
    ) -> Result<RankHandle, Error> {
        let mut cmd = tokio::process::Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(Error::from)?;
        let pid = child.id();

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<i32>();

        let proc_events = events.clone();
        tokio::spawn(async move {
            let out_task = stdout.map(|out| {
                tokio::spawn(read_lines(out, rank, Stream::Stdout, proc_events.clone()))
            });
            let err_task = stderr.map(|err| {
                tokio::spawn(read_lines(err, rank, Stream::Stderr, proc_events.clone()))
            });
            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    Some(sig) = signal_rx.recv() => {
                        if let Some(pid) = pid {
                            unsafe { libc::kill(pid as i32, sig) };
                        }
                    }
                }
            };
            // let the readers drain to EOF so output precedes exit
            if let Some(task) = out_task {
                let _ = task.await;
            }
            if let Some(task) = err_task {
                let _ = task.await;
            }
            let status = match status {
                Ok(es) => wait::from_exit_status(es),
                Err(_) => wait::exit_status(1),
            };
            let _ = proc_events.send(ProcEvent::Exit { rank, status });
        });

        Ok(RankHandle::new(rank, signal_tx))
    }
}

/// Wait status standing in for a process that could not be spawned:
/// 126 permission, 127 not found, 68 host unreachable, 1 otherwise.
fn spawn_failure_status(err: &Error) -> i32 {
    let code = match err.class() {
        Errno::Permission => 126,
        Errno::NotFound => 127,
        Errno::Io => 68,
        _ => 1,
    };
    wait::exit_status(code)
}

/// Event stream of a bulk run.
#[derive(Debug)]
pub enum BulkEvent {
    Output(OutputLine),
    /// Every rank has exited; `rc` is the worst wait status.
    Finished { rc: i32 },
}

pub struct BulkExec {
    handles: Vec<RankHandle>,
    events_rx: mpsc::UnboundedReceiver<ProcEvent>,
    statuses: HashMap<u32, i32>,
    remaining: usize,
}

impl BulkExec {
    /// Launch `argv` on every rank of `ranks`.  Per-rank spawn failures
    /// are recorded as synthetic exit statuses, not errors.
    pub async fn start(
        executor: &dyn RankExecutor,
        ranks: &IdSet,
        argv: &[String],
        env: &[(String, String)],
    ) -> Result<BulkExec, Error> {
        if argv.is_empty() || ranks.is_empty() {
            return Err(Error::invalid("nothing to execute"));
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut handles = Vec::new();
        let mut statuses = HashMap::new();
        let mut remaining = 0;
        for rank in ranks.iter() {
            match executor
                .spawn(rank, argv.to_vec(), env.to_vec(), events_tx.clone())
                .await
            {
                Ok(handle) => {
                    handles.push(handle);
                    remaining += 1;
                }
                Err(err) => {
                    let status = spawn_failure_status(&err);
                    debug!(rank, %err, status, "spawn failed");
                    statuses.insert(rank, status);
                }
            }
        }
        Ok(BulkExec {
            handles,
            events_rx,
            statuses,
            remaining,
        })
    }

    /// Next output line, or completion once every rank has exited.
    pub async fn next_event(&mut self) -> BulkEvent {
        loop {
            if self.remaining == 0 {
                return BulkEvent::Finished { rc: self.rc() };
            }
            match self.events_rx.recv().await {
                Some(ProcEvent::Output(line)) => return BulkEvent::Output(line),
                Some(ProcEvent::Exit { rank, status }) => {
                    self.statuses.insert(rank, status);
                    self.remaining -= 1;
                }
                None => self.remaining = 0,
            }
        }
    }

    /// Worst wait status across the ranks.
    pub fn rc(&self) -> i32 {
        self.statuses.values().copied().max().unwrap_or(0)
    }

    pub fn active_count(&self) -> usize {
        self.remaining
    }

    /// Fan a signal out to every still-running rank.
    pub fn kill(&self, sig: i32) {
        for handle in &self.handles {
            handle.kill(sig);
        }
    }

    /// Ranks whose process failed or exited nonzero.
    pub fn failed_ranks(&self) -> IdSet {
        let mut failed = IdSet::new();
        for (&rank, &status) in &self.statuses {
            if status != 0 {
                let _ = failed.set(rank);
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranks(s: &str) -> IdSet {
        IdSet::decode(s).unwrap()
    }

    async fn run_to_completion(bulk: &mut BulkExec) -> (Vec<OutputLine>, i32) {
        let mut lines = Vec::new();
        loop {
            match bulk.next_event().await {
                BulkEvent::Output(line) => lines.push(line),
                BulkEvent::Finished { rc } => return (lines, rc),
            }
        }
    }

    #[tokio::test]
    async fn runs_on_every_rank_and_captures_output() {
        let argv = vec!["/bin/echo".to_string(), "hello".to_string()];
        let mut bulk = BulkExec::start(&LocalExecutor, &ranks("0-2"), &argv, &[])
            .await
            .unwrap();
        let (lines, rc) = run_to_completion(&mut bulk).await;
        assert_eq!(rc, 0);
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().all(|l| l.line == "hello"));
        assert!(lines.iter().all(|l| l.stream == Stream::Stdout));
        assert!(bulk.failed_ranks().is_empty());
    }

    #[tokio::test]
    async fn nonzero_exits_are_collected() {
        let argv = vec!["/bin/false".to_string()];
        let mut bulk = BulkExec::start(&LocalExecutor, &ranks("0-1"), &argv, &[])
            .await
            .unwrap();
        let (_, rc) = run_to_completion(&mut bulk).await;
        assert_ne!(rc, 0);
        assert!(wait::exited(rc));
        assert_eq!(wait::exit_code(rc), 1);
        assert_eq!(bulk.failed_ranks().encode(canopy_idset::RANGE).unwrap(), "0-1");
    }

    #[tokio::test]
    async fn spawn_failure_synthesizes_status() {
        let argv = vec!["/definitely/not/a/real/command".to_string()];
        let mut bulk = BulkExec::start(&LocalExecutor, &ranks("0"), &argv, &[])
            .await
            .unwrap();
        let (_, rc) = run_to_completion(&mut bulk).await;
        assert_eq!(wait::exit_code(rc), 127);
        assert_eq!(bulk.failed_ranks().count(), 1);
    }

    #[tokio::test]
    async fn sigterm_interrupts_a_sleeper() {
        let argv = vec!["/bin/sleep".to_string(), "3600".to_string()];
        let mut bulk = BulkExec::start(&LocalExecutor, &ranks("0"), &argv, &[])
            .await
            .unwrap();
        assert_eq!(bulk.active_count(), 1);
        bulk.kill(libc::SIGTERM);
        let (_, rc) = run_to_completion(&mut bulk).await;
        assert!(wait::signaled(rc));
        assert_eq!(wait::term_sig(rc), libc::SIGTERM);
    }

    #[tokio::test]
    async fn environment_reaches_the_command() {
        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), "echo $FLUX_JOB_ID".to_string()];
        let env = vec![("FLUX_JOB_ID".to_string(), "f3Qp6".to_string())];
        let mut bulk = BulkExec::start(&LocalExecutor, &ranks("0"), &argv, &env)
            .await
            .unwrap();
        let (lines, rc) = run_to_completion(&mut bulk).await;
        assert_eq!(rc, 0);
        assert_eq!(lines[0].line, "f3Qp6");
    }
}
