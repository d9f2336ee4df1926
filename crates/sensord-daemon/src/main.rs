//! Daemon entry point.
//!
//! Wires the pieces together and runs the manager event loop on a
//! current-thread runtime: the facade, the sample pump consumer, control
//! dispatch and the operational-state handler all execute on this one
//! thread, while sensor producer threads only ever touch the pump's writer
//! handle.

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use sensord_daemon::{
    config::Settings, control, events, mock, pump::sample_pump, LocalBus, SensorManager,
    SocketHandler,
};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Parser)]
#[command(name = "sensord", about = "Local sensor-multiplexing daemon", long_about = None)]
struct Cli {
    /// Path to the daemon configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    // RUST_LOG wins over the configured level.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let (command_tx, command_rx) = mpsc::channel(settings.command_channel_capacity);
    let (event_tx, event_rx) = mpsc::channel(settings.event_channel_capacity);
    let (pump_writer, pump_drain) = sample_pump(settings.pump_capacity);

    let socket = SocketHandler::new();
    socket
        .listen(&settings.socket_path, event_tx.clone())
        .with_context(|| format!("failed to listen on {}", settings.socket_path.display()))?;

    let mut manager = SensorManager::new(Box::new(LocalBus::new()), socket, pump_writer);
    mock::register_builtin_factories(&mut manager);
    for decl in &settings.adaptors {
        manager.register_adaptor(&decl.id, &decl.type_name, decl.properties.clone());
    }
    for decl in &settings.chains {
        manager.register_chain(&decl.id, &decl.type_name);
    }
    for decl in &settings.sensors {
        manager.register_sensor(&decl.id, &decl.type_name);
    }
    info!(
        sensors = settings.sensors.len(),
        chains = settings.chains.len(),
        adaptors = settings.adaptors.len(),
        "registry loaded"
    );

    if !manager.register_service() {
        bail!("control service registration failed: {}", manager.last_error());
    }

    let control_task = tokio::spawn(control::serve(
        settings.control_socket_path.clone(),
        command_tx.clone(),
    ));
    let manager_task = tokio::spawn(events::run(manager, command_rx, event_rx, pump_drain));

    info!("sensord running");
    signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown signal received");

    // Closing the command channel stops the manager loop; the manager's drop
    // reports any entries still instantiated.
    control_task.abort();
    drop(command_tx);
    let _ = manager_task.await;

    let _ = std::fs::remove_file(&settings.socket_path);
    let _ = std::fs::remove_file(&settings.control_socket_path);
    info!("sensord shutdown complete");
    Ok(())
}
