mod cli;
mod control;
mod kvs;
mod report;

use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use clap::Parser;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use canopy_bootstrap::{Bootstrap, Overlay, wireup};
use canopy_core::attrs::AttrDict;
use canopy_core::event::JournalEvent;
use canopy_jobstate::{Control, JobStateCtx, init_from_kvs};
use canopy_killbot::{Killbot, KillbotConfig};
use canopy_perilog::{LocalExecutor, Perilog, PerilogConfig};
use canopy_pmi::SinglePm;

use crate::cli::Cli;
use crate::control::{JournalHub, LoopbackControl};
use crate::kvs::{FileKvs, KvsInfoLookup};

fn init_logging(cli: &Cli) {
    let filter = cli
        .log
        .clone()
        .or_else(|| std::env::var("CANOPY_LOG").ok())
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<Value> {
    match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
        }
        None => Ok(Value::Object(Default::default())),
    }
}

async fn replay_journal_file(
    path: &std::path::Path,
    hub: &JournalHub,
    journal_tx: &mpsc::Sender<Arc<Vec<JournalEvent>>>,
) -> anyhow::Result<usize> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let mut count = 0;
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let event: JournalEvent =
            serde_json::from_str(line).with_context(|| format!("parsing journal line: {line}"))?;
        hub.seed_seq(event.id, event.eventlog_seq);
        journal_tx
            .send(Arc::new(vec![event]))
            .await
            .context("journal stream closed")?;
        count += 1;
    }
    Ok(count)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);
    let started = chrono::Local::now();

    std::fs::create_dir_all(&cli.rundir)
        .with_context(|| format!("creating rundir {}", cli.rundir.display()))?;
    let conf = load_config(&cli)?;

    let attrs = Arc::new(Mutex::new(AttrDict::new()));
    {
        let mut a = attrs.lock().unwrap();
        a.set("tbon.topo", &cli.topo)?;
        a.set("tbon.interface-hint", &cli.interface_hint)?;
        a.set("rundir", cli.rundir.display().to_string())?;
        if cli.recovery_mode {
            a.set("broker.recovery-mode", "1")?;
        }
    }

    // Bootstrap.  A standalone broker is its own process manager; a
    // cluster launch would hand us a real one.
    let host = canopy_bootstrap::local_hostname()
        .map_err(|err| anyhow::anyhow!("hostname: {err}"))?;
    let pm = Arc::new(SinglePm::new(""));
    let boot = Bootstrap::create(pm, attrs.clone(), host)
        .await
        .map_err(|err| anyhow::anyhow!("bootstrap: {err}"))?;
    let mut overlay = Overlay::new().map_err(|err| anyhow::anyhow!("overlay: {err}"))?;
    wireup(&boot, &mut overlay)
        .await
        .map_err(|err| anyhow::anyhow!("wireup: {err}"))?;
    {
        let mut a = attrs.lock().unwrap();
        a.set("size", boot.info().size.to_string())?;
        a.set("rank", boot.info().rank.to_string())?;
    }
    info!(
        rank = boot.info().rank,
        size = boot.info().size,
        method = boot.method(),
        "bootstrap complete"
    );

    // State engine, restarted from any KVS content left behind.
    let kvs_root = cli.rundir.join("kvs");
    let mut ctx = JobStateCtx::new();
    let recovered = init_from_kvs(&mut ctx, &FileKvs::new(kvs_root.clone()))
        .await
        .map_err(|err| anyhow::anyhow!("restart from kvs: {err}"))?;
    if recovered > 0 {
        info!(recovered, "recovered jobs from kvs");
    }

    let (journal_tx, journal_rx) = mpsc::channel(64);
    let hub = Arc::new(JournalHub::new(journal_tx.clone()));
    for job in ctx.jobs() {
        hub.seed_seq(job.id, job.eventlog_seq);
    }

    let exec_control = Arc::new(LoopbackControl::new(hub.clone()));
    let lookup = Arc::new(KvsInfoLookup::new(kvs_root));

    let perilog_updates = ctx.subscribe();
    let killbot_updates = ctx.subscribe();

    let (engine_control_tx, engine_control_rx) = mpsc::channel(16);
    let engine = tokio::spawn(canopy_jobstate::run(
        ctx,
        journal_rx,
        lookup,
        engine_control_rx,
    ));

    // Broker lifecycle flag consumed by perilog's epilog gate.
    let (state_tx, state_rx) = watch::channel(false);

    let perilog_config =
        PerilogConfig::from_value(&conf).map_err(|err| anyhow::anyhow!("config: {err}"))?;
    let perilog = Perilog::new(perilog_config, Arc::new(LocalExecutor), exec_control.clone());
    let perilog_task = tokio::spawn(perilog.run(perilog_updates, state_rx));

    let killbot_config =
        KillbotConfig::from_value(&conf).map_err(|err| anyhow::anyhow!("config: {err}"))?;
    let (_killbot_control_tx, killbot_control_rx) = mpsc::channel(8);
    let killbot_task = tokio::spawn(
        Killbot::new(killbot_config, exec_control.clone()).run(killbot_updates, killbot_control_rx),
    );

    if let Some(path) = &cli.journal {
        let count = replay_journal_file(path, &hub, &journal_tx).await?;
        info!(count, path = %path.display(), "replayed journal file");
    }

    println!(
        "canopyd {} rank={} size={}",
        env!("CARGO_PKG_VERSION"),
        boot.info().rank,
        boot.info().size
    );

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested");

    // Entering cleanup: no new epilogs start, running phases finish.
    let _ = state_tx.send(true);
    drop(journal_tx);
    if engine_control_tx.send(Control::Shutdown).await.is_err() {
        warn!("engine already stopped");
    }

    let ctx = match engine.await.context("engine task")? {
        Ok(ctx) => ctx,
        Err(err) => return Err(anyhow::anyhow!("engine failed: {err}")),
    };
    let stats = *ctx.stats();
    // closing the update feed lets perilog and killbot run down
    drop(ctx);
    let _ = perilog_task.await;
    let _ = killbot_task.await;

    let attrs = attrs.lock().unwrap().clone();
    println!("{}", report::summary(&attrs, &stats, started, "shutdown"));
    Ok(())
}
