use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use procclamp::common::ipc::{BUS_NAME, OBJECT_PATH};
use procclamp::common::{AuditLog, ConfigStore, SupervisorService, logging};
use procclamp::service::privilege::Privilege;
use procclamp::service::{ProcfsInspector, StatusBoard, Supervisor};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};

#[derive(Parser, Debug)]
#[command(name = "procclamp-sys", version, about = "procclamp system daemon")]
struct Args {
    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serve on the session bus, without asking for root
    #[arg(long)]
    session: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose).context("Failed to initialize logging")?;

    info!("Starting procclamp system daemon");

    if !args.session {
        if let Err(e) = Privilege::elevate() {
            warn!(
                "Running unprivileged ({}), only processes owned by this user can be adjusted",
                e
            );
        }
    }

    let store = match &args.config {
        Some(path) => ConfigStore::load(path),
        None => ConfigStore::load_default().context("Failed to load configuration")?,
    };

    let audit = AuditLog::default_path()
        .map(AuditLog::new)
        .unwrap_or_else(AuditLog::disabled);

    let supervisor = Arc::new(Supervisor::new(
        Arc::new(ProcfsInspector::new()),
        Arc::new(store),
        audit,
    ));
    let service = SupervisorService::new(Arc::clone(&supervisor), Arc::new(StatusBoard::new()));

    let builder = if args.session {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };

    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("Failed to register on D-Bus")?;

    info!(
        "D-Bus service started on {} bus",
        if args.session { "session" } else { "system" }
    );
    info!("Waiting for requests...");

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("Received SIGINT, shutting down"),
    }

    supervisor.stop().await;
    info!("Shutdown complete");

    Ok(())
}
