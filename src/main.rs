//! Session Relay
//!
//! Keeps long-running interactive programs alive inside a terminal
//! multiplexer and relays their output to any number of WebSocket observers,
//! with scrollback replay on attach and a derived activity status.

mod backend;
mod catalog;
mod client;
mod config;
mod git;
mod pty;
mod relay;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use backend::TmuxBackend;
use catalog::FileCatalog;
use client::{ControlClient, ObserverClient};
use config::{RelayConfig, CONFIG_FILE};
use relay::{
    BridgeSettings, BroadcastHub, ProcessBridge, RegistrySettings, SessionRegistry, StatusSweeper,
};
use server::{ServerConfig, StreamFrame, WebSocketServer};

/// Session Relay
///
/// WebSocket relay for persistent terminal sessions
#[derive(Parser, Debug)]
#[command(name = "session-relay")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, global = true, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Bind address (overrides the config file)
    #[arg(long, global = true)]
    bind: Option<String>,

    /// Port (overrides the config file)
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay server (default)
    Serve,
    /// Observe a session in this terminal
    Attach {
        session_id: String,
    },
    /// List sessions
    List {
        /// Include archived sessions
        #[arg(long)]
        archived: bool,
    },
    /// Create a session
    Create {
        name: String,
        #[arg(long)]
        group: Option<String>,
        /// Working directory (defaults to the relay's)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Delete a session and kill its process
    Delete {
        session_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --verbose
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str()));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let mut config = RelayConfig::load(&args.config)?;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    let base_url = format!("ws://{}", config.socket_addr());

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Attach { session_id } => attach(&base_url, session_id).await,
        Command::List { archived } => {
            let mut client = ControlClient::connect(&base_url).await?;
            for session in client.list_sessions(archived).await? {
                let status = session.status.map_or("-", |s| s.as_str());
                println!(
                    "{}  {:<8} {}{}  {}",
                    session.id,
                    status,
                    if session.pinned { "* " } else { "" },
                    session.name,
                    session.group.unwrap_or_default()
                );
            }
            client.close().await
        }
        Command::Create { name, group, dir } => {
            let mut client = ControlClient::connect(&base_url).await?;
            let dir = dir
                .map(std::path::absolute)
                .transpose()?
                .map(|d| d.to_string_lossy().into_owned());
            let session = client.create_session(name, group, dir).await?;
            println!("{}", session.id);
            client.close().await
        }
        Command::Delete { session_id } => {
            let mut client = ControlClient::connect(&base_url).await?;
            client.delete_session(&session_id).await?;
            client.close().await
        }
    }
}

async fn serve(config: RelayConfig) -> anyhow::Result<()> {
    info!("Session Relay v{}", env!("CARGO_PKG_VERSION"));

    let backend = Arc::new(TmuxBackend::from_settings(&config.backend));
    let catalog = Arc::new(FileCatalog::new(config.catalog_path()));
    let bridge = Arc::new(ProcessBridge::new(
        backend,
        BridgeSettings::from_config(&config),
    ));
    let registry = Arc::new(SessionRegistry::new(
        catalog,
        bridge,
        RegistrySettings::from_config(&config),
    ));
    let hub = Arc::new(BroadcastHub::new(
        Arc::clone(&registry),
        config.observer_queue_frames,
    ));

    let server_config = ServerConfig::from_relay(&config)
        .with_server_id(Some(format!("session-relay/{}", env!("CARGO_PKG_VERSION"))));
    let server = Arc::new(WebSocketServer::new(server_config, hub));
    let sweeper = StatusSweeper::new(Arc::clone(&registry), config.sweep_interval())
        .spawn(server.shutdown_signal());

    // Spawn shutdown signal handler
    let server_handle = Arc::clone(&server);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    server.run().await?;
    if let Err(e) = sweeper.await {
        warn!("Status sweeper ended abnormally: {}", e);
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Pipe stdin to the session and its output to stdout until stdin closes
async fn attach(base_url: &str, session_id: String) -> anyhow::Result<()> {
    let (input_tx, input_rx) = mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = vec![0u8; 4096];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if input_tx
                        .send(StreamFrame::Input(buf[..n].to_vec()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    });

    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(());
    });

    let mut stdout = tokio::io::stdout();
    ObserverClient::new(base_url, session_id)
        .run(input_rx, &mut stdout, shutdown_rx)
        .await
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
