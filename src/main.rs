use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use padremap::config::RemapperConfig;
use padremap::device::TransportRegistry;
use padremap::remap::{
    BackendRegistry, NativeRegistry, RemapEvent, RemapEventKind, RemapManager,
};
use padremap::scanner::ScanLoop;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Liest Controller, fusioniert Bewegungsdaten und remappt sie pro Gerät
#[derive(Debug, Parser)]
#[command(name = "padremap", version, about)]
struct Args {
    /// Pfad zur config.toml
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup()?;

    let config = RemapperConfig::load(args.config.as_deref()).await?;

    let (event_tx, event_rx) = mpsc::channel(config.scheduler.event_buffer);
    let event_pump = tokio::spawn(pump_events(event_rx));

    let backends = BackendRegistry::with_defaults(NativeRegistry::with_builtins());
    info!("Backends: {:?}", backends);
    let manager = Arc::new(RemapManager::new(&config, backends, event_tx));

    let scanners = TransportRegistry::with_defaults().build_enabled(&config);
    if scanners.is_empty() {
        warn!("No transport enabled, nothing will be attached");
    }

    let cancel = CancellationToken::new();
    let scan_loop = ScanLoop::new(scanners, manager.clone(), config.scheduler.scan_interval());
    let mut scan_task = tokio::spawn(scan_loop.run(cancel.clone()));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Ctrl-C received, shutting down");
        }
        result = &mut scan_task => {
            error!("Scan loop ended unexpectedly: {:?}", result);
        }
    }

    cancel.cancel();
    if !scan_task.is_finished() {
        match scan_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Scan loop failed: {}", e),
            Err(e) => error!("Scan loop panicked: {}", e),
        }
    }

    manager.shutdown().await;
    drop(manager);
    event_pump
        .await
        .map_err(|e| eyre!("Event pump failed: {}", e))?;

    info!("Shutdown complete");
    Ok(())
}

/// Leitet Worker-Events auf tracing um
async fn pump_events(mut events: mpsc::Receiver<RemapEvent>) {
    while let Some(event) = events.recv().await {
        match &event.kind {
            RemapEventKind::BackendError(_) | RemapEventKind::ConnectionFailed(_) => {
                error!(target: "remap", "{}", event)
            }
            RemapEventKind::Warning(_) => warn!(target: "remap", "{}", event),
            _ => info!(target: "remap", "{}", event),
        }
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}
