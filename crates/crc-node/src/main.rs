//! CRC Node -- relay chat server.
//!
//! Usage:
//!   crc-node --config node.toml
//!   crc-node --id 2 --servername s2 --port 9002 --connect-to-host 127.0.0.1 --connect-to-port 9001

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use crc_node::{expand_tilde, NodeConfig, Server};
use crc_protocol::HostId;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "crc-node", about = "CRC relay chat server node")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.crc/node.toml")]
    config: PathBuf,

    /// Host ID of this server (non-zero)
    #[arg(long)]
    id: Option<HostId>,

    #[arg(long)]
    servername: Option<String>,

    /// Listen port, on the configured interface
    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    info: Option<String>,

    /// Bootstrap server to dial at startup
    #[arg(long, alias = "connect_to_host", requires = "connect_to_port")]
    connect_to_host: Option<String>,

    #[arg(long, alias = "connect_to_port", requires = "connect_to_host")]
    connect_to_port: Option<u16>,

    /// Write logs here instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Write the final node snapshot here as JSON on exit
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

impl Cli {
    /// Command-line flags win over the config file.
    fn apply(&self, cfg: &mut NodeConfig) {
        if let Some(id) = self.id {
            cfg.node.id = id;
        }
        if let Some(name) = &self.servername {
            cfg.node.name = name.clone();
        }
        if let Some(info) = &self.info {
            cfg.node.info = info.clone();
        }
        if let Some(port) = self.port {
            cfg.set_listen_port(port);
        }
        if let (Some(host), Some(port)) = (&self.connect_to_host, self.connect_to_port) {
            cfg.network.connect_to = Some(format!("{host}:{port}"));
        }
        if let Some(path) = &self.snapshot {
            cfg.node.snapshot_path = Some(path.clone());
        }
    }
}

fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "crc_node=info,crc_protocol=info".into());

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_file.as_deref())?;

    let mut cfg = NodeConfig::load_or_default(&expand_tilde(&cli.config))?;
    cli.apply(&mut cfg);

    tracing::info!(
        id = cfg.node.id,
        name = %cfg.node.name,
        version = env!("CARGO_PKG_VERSION"),
        "starting crc-node"
    );
    tracing::info!(
        listen = %cfg.network.listen_addr,
        connect_to = cfg.network.connect_to.as_deref().unwrap_or("-"),
        poll_interval_ms = cfg.network.poll_interval_ms,
        "network config"
    );

    let mut server = Server::bind(cfg.clone()).await?;

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("received ctrl-c, shutting down");
                on_signal.cancel();
            }
            Err(e) => tracing::warn!(error = %e, "cannot listen for ctrl-c"),
        }
    });

    let snapshot = server.run(shutdown).await;
    tracing::info!(
        hosts = snapshot.hosts.len(),
        status_messages = snapshot.status_log.len(),
        chat_messages = snapshot.chat_log.len(),
        "node stopped"
    );

    if let Some(path) = &cfg.node.snapshot_path {
        let path = expand_tilde(path);
        snapshot.write_to(&path)?;
        tracing::info!(path = %path.display(), "snapshot written");
    }
    Ok(())
}
