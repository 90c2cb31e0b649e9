//! Millview server binary
//!
//! Loads the camera inventory from YAML, starts one capture pipeline per
//! camera, and serves WebRTC signaling over WebSocket. The first
//! SIGINT/SIGTERM triggers a graceful shutdown bounded at 5 seconds; a
//! second signal at any point exits immediately.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use millview::{AppConfig, CaptureSource, PeerManager, ServerSignal, Shutdown, Signaling};

/// Ceiling on the whole graceful-shutdown sequence
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
/// Period of the status line logged by the main loop
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "millview-server", version, about = "Multi-camera WebRTC streaming server")]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Directory for log files
    #[arg(long, default_value = "./logs")]
    log_dir: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let file_appender = tracing_appender::rolling::daily(&cli.log_dir, "millview.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    let default_directive = if cli.verbose {
        "millview=debug"
    } else {
        "millview=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_directive.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    info!("==========================================");
    info!("  millview camera server v{}", env!("CARGO_PKG_VERSION"));
    info!("==========================================");

    gstreamer::init().context("failed to initialize GStreamer")?;
    info!("GStreamer initialized: {}", gstreamer::version_string());

    let config = Arc::new(AppConfig::load(&cli.config)?);

    let sources: Vec<Arc<CaptureSource>> = config
        .cameras
        .iter()
        .cloned()
        .map(|cam| Arc::new(CaptureSource::new(cam)))
        .collect();

    let peers = PeerManager::new(Arc::clone(&config), sources.clone());
    let signaling = Signaling::new(Arc::clone(&config), Arc::clone(&peers));

    let listener = TcpListener::bind((config.server.bind.as_str(), config.server.port))
        .await
        .with_context(|| {
            format!(
                "failed to bind signaling socket {}:{}",
                config.server.bind, config.server.port
            )
        })?;
    let server_task = tokio::spawn(signaling.clone().serve(listener));

    let mut started = 0;
    for source in &sources {
        if source.start() {
            started += 1;
        } else {
            error!(camera = %source.id(), "failed to start camera");
        }
    }
    if started == 0 {
        anyhow::bail!("no cameras started successfully");
    }

    info!("------------------------------------------");
    info!("  server is running");
    info!("  signaling:   ws://{}:{}/ws", config.server.bind, config.server.port);
    info!("  cameras:     {}/{} active", started, sources.len());
    info!("  max clients: {}", config.webrtc.max_clients);
    info!("------------------------------------------");

    let shutdown = Shutdown::install();
    let mut status = tokio::time::interval(STATUS_INTERVAL);
    status.tick().await; // first tick fires immediately
    loop {
        tokio::select! {
            _ = shutdown.requested() => break,
            _ = status.tick() => {
                let active = sources.iter().filter(|s| s.is_running()).count();
                info!(
                    "[status] cameras: {}/{} | clients: {}",
                    active,
                    sources.len(),
                    peers.peer_count().await
                );
            }
        }
    }

    info!("shutting down...");
    signaling
        .broadcast(ServerSignal::Error {
            message: "server shutting down".to_string(),
        })
        .await;

    let stop_sources = sources.clone();
    let shutdown_sequence = async {
        tokio::task::spawn_blocking(move || {
            for source in &stop_sources {
                source.stop();
            }
        })
        .await
        .context("capture shutdown task panicked")?;
        peers.remove_all().await;
        server_task.abort();
        anyhow::Ok(())
    };
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, shutdown_sequence).await {
        Ok(result) => result?,
        Err(_) => {
            error!("shutdown did not complete within {SHUTDOWN_TIMEOUT:?}, exiting");
            std::process::exit(1);
        }
    }

    info!("server stopped cleanly");
    Ok(())
}
