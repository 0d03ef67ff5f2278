//! HYPERDESK CLI
//!
//! LAN peer-to-peer file sharing with paired sessions.

mod peer;

use anyhow::Context;
use clap::{Parser, Subcommand};
use hyperdesk_core::state::{AppState, StateEvent};
use hyperdesk_daemon::{Controller, ControllerConfig};
use std::path::PathBuf;
use std::sync::Arc;

/// HYPERDESK - LAN file sharing with paired sessions
#[derive(Parser)]
#[command(name = "hyperdesk")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sharing daemon
    Daemon {
        /// Control-plane bind host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Control-plane bind port
        #[arg(long, default_value_t = hyperdesk_core::CONTROL_PORT)]
        port: u16,

        /// Hyperbox root directory (default: ./hyperbox)
        #[arg(long)]
        root: Option<PathBuf>,

        /// Create a pairing immediately and print its code
        #[arg(long)]
        pair: bool,
    },

    /// Connect to a daemon as the reference peer client
    Peer {
        /// Daemon host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Daemon control port
        #[arg(long, default_value_t = hyperdesk_core::CONTROL_PORT)]
        port: u16,

        /// Pairing code shown by the host
        #[arg(long, required = true)]
        pair_code: String,

        /// Remote path to request after pairing
        #[arg(long)]
        request: Option<String>,

        /// Directory where received files land
        #[arg(long, default_value = "peer_inbox")]
        inbox: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(if cli.verbose { "debug" } else { "info" })
        .init();

    match cli.command {
        Commands::Daemon {
            host,
            port,
            root,
            pair,
        } => run_daemon(host, port, root, pair).await?,
        Commands::Peer {
            host,
            port,
            pair_code,
            request,
            inbox,
        } => peer::run_peer(&host, port, &pair_code, request.as_deref(), &inbox).await?,
    }

    Ok(())
}

/// Run the daemon until Ctrl-C.
async fn run_daemon(
    host: String,
    port: u16,
    root: Option<PathBuf>,
    pair: bool,
) -> anyhow::Result<()> {
    let state = Arc::new(AppState::new());
    let mut events = state.subscribe();

    let config = ControllerConfig {
        control_host: host.clone(),
        control_port: port,
        hyperbox_root: root,
        ..ControllerConfig::default()
    };
    let controller = Controller::start(config, Arc::clone(&state))
        .await
        .context("daemon startup failed")?;

    println!("HYPERDESK daemon");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Control: ws://{host}:{}/", controller.control_port());
    println!("Hyperbox: {}", controller.hyperbox().root().display());
    println!("Device: {}", controller.local_device().name);

    controller.scan().await;
    if pair {
        controller.start_pairing();
        let code = state.pairing_code();
        if !code.is_empty() {
            println!("\nPairing code: {code}");
        }
    }

    // Mirror pairing-code changes to stdout so a headless host can read
    // codes created later (e.g. after a disconnect).
    let watcher = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let StateEvent::PairingChanged(code) = event {
                if !code.is_empty() {
                    println!("Pairing code: {code}");
                }
            }
        }
    });

    tracing::info!("daemon ready");
    println!("\nPress Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    watcher.abort();
    controller.shutdown().await;
    Ok(())
}
