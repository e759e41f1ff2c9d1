mod logging;
mod paths;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use mesh_network::{MeshNode, Message, MessageKind, NetworkConfig};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "mesh-node", version, about = "Peer-to-peer mesh messenger node")]
struct Cli {
    /// Path to the JSON config file [default: ~/.mesh/config.json]
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the config file
    #[arg(long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Bootstrap peer (`host:port`); may be repeated
    #[arg(long = "peer", value_name = "ADDR")]
    peers: Vec<String>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info", value_name = "FILTER")]
    log_level: String,

    /// Directory for rotated log files [default: ~/.mesh/logs]
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Write the effective config to the config path and exit
    #[arg(long)]
    save_config: bool,
}

impl Cli {
    /// Layer command-line overrides on top of the file config.
    fn apply(&self, mut config: NetworkConfig) -> NetworkConfig {
        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        for peer in &self.peers {
            if !config.known_peers.contains(peer) {
                config.known_peers.push(peer.clone());
            }
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let logs_dir = match &cli.log_dir {
        Some(dir) => dir.clone(),
        None => paths::logs_dir()?,
    };
    let _log_guard = logging::init_logging(&logs_dir, &cli.log_level)?;
    info!("Starting mesh-node v{}", env!("CARGO_PKG_VERSION"));

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => paths::config_path()?,
    };
    let config = cli.apply(NetworkConfig::load_or_default(&config_path));

    if cli.save_config {
        config
            .save_to_file(&config_path)
            .context("Failed to write config file")?;
        println!("Config written to {}", config_path.display());
        return Ok(());
    }

    let mut node = MeshNode::new(config);
    let inbox = node.take_inbox().context("Inbox already taken")?;
    node.start().await.context("Failed to start mesh node")?;
    println!("Node started with ID: {}", node.id());

    let printer = tokio::spawn(print_inbox(inbox));

    shutdown_signal().await;
    info!("Shutdown requested");
    node.stop().await;
    printer.abort();

    Ok(())
}

/// Print every message delivered to this node.
async fn print_inbox(mut inbox: mpsc::Receiver<Message>) {
    while let Some(message) = inbox.recv().await {
        println!("{}", render(&message));
    }
}

fn render(message: &Message) -> String {
    let time = message.timestamp().format("%H:%M:%S");
    let body = message.payload_str().unwrap_or("<binary payload>");
    match message.kind() {
        MessageKind::Text => format!("[{time}] {}: {body}", message.from()),
        kind => format!("[{time}] {} ({}): {body}", message.from(), kind.as_str()),
    }
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
