use std::path::PathBuf;

use clap::Parser;

/// One broker of a canopy instance.
#[derive(Debug, Parser)]
#[command(name = "canopyd", version, about = "canopy workload manager broker")]
pub struct Cli {
    /// Broker configuration file (JSON).
    #[arg(long, env = "CANOPY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Runtime directory for sockets and local KVS content.
    #[arg(long, default_value = "/tmp/canopy")]
    pub rundir: PathBuf,

    /// Overlay topology URI.
    #[arg(long, default_value = "kary:2")]
    pub topo: String,

    /// Interface hint for the tcp bind address
    /// (hostname, default-route, or an interface name).
    #[arg(long, default_value = "default-route")]
    pub interface_hint: String,

    /// Single-node recovery mode: skip child binds.
    #[arg(long)]
    pub recovery_mode: bool,

    /// Replay a journal file (JSON lines) into the state engine.
    #[arg(long)]
    pub journal: Option<PathBuf>,

    /// Log filter (overrides CANOPY_LOG).
    #[arg(long)]
    pub log: Option<String>,
}
