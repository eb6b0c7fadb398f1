//! tally-sync - background sync agent for a Tally local store.
//!
//! Drains the local write queue to the server and keeps displayed queries
//! fresh, until interrupted.
//!
//! ```text
//! tally-sync                 run until ctrl-c
//! tally-sync --once          run a single pass and exit
//! tally-sync --export FILE   write a snapshot of the local store
//! tally-sync --import FILE   merge a snapshot into the local store
//! ```

use std::sync::Arc;

use tally_client::store::{export_snapshot, import_snapshot};
use tally_client::{
    Config, HttpTransport, NetworkMonitor, PassOutcome, SqliteStore, SyncCoordinator, SyncEvent,
    SyncTrigger,
};
use tally_engine::{RecordSchema, StoreSnapshot};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

enum Command {
    Run,
    Once,
    Export(String),
    Import(String),
}

impl Command {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self, String> {
        let command = match args.next().as_deref() {
            None => Command::Run,
            Some("--once") => Command::Once,
            Some("--export") => Command::Export(args.next().ok_or("--export needs a file")?),
            Some("--import") => Command::Import(args.next().ok_or("--import needs a file")?),
            Some(other) => return Err(format!("unknown argument: {other}")),
        };
        match args.next() {
            None => Ok(command),
            Some(extra) => Err(format!("unexpected argument: {extra}")),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tally_client=debug,tally_sync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let command = Command::parse(std::env::args().skip(1))?;

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Opening local store at {}", config.database_url);
    let store = Arc::new(SqliteStore::open(&config.database_url).await?);

    match command {
        Command::Export(path) => {
            let snapshot = export_snapshot(store.as_ref()).await?;
            tokio::fs::write(&path, snapshot.to_json_pretty()?).await?;
            tracing::info!(pending = snapshot.pending_count(), "Snapshot written to {}", path);
            return Ok(());
        }
        Command::Import(path) => {
            let json = tokio::fs::read_to_string(&path).await?;
            let snapshot = StoreSnapshot::from_json(&json)?;
            let summary = import_snapshot(store.as_ref(), &snapshot).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            return Ok(());
        }
        Command::Run | Command::Once => {}
    }

    let transport = Arc::new(HttpTransport::new(
        config.require_server_url()?,
        config.request_timeout,
        config.auth_token.clone(),
    )?);
    tracing::info!("Syncing with {}", transport.base_url());

    // the agent only runs where the platform already reported connectivity
    let monitor = NetworkMonitor::shared(true);
    let coordinator = SyncCoordinator::new(
        store,
        transport,
        monitor,
        RecordSchema::default(),
        config.sync_config(),
    );

    let events = coordinator.subscribe();
    tokio::spawn(log_events(events));

    if matches!(command, Command::Once) {
        match coordinator.request_sync(SyncTrigger::Manual).await {
            PassOutcome::Completed(report) => {
                println!(
                    "submitted {} synced {} rejected {} pending {} refreshed {}",
                    report.submitted,
                    report.synced,
                    report.rejected,
                    report.remaining_pending,
                    report.refreshed
                );
            }
            other => tracing::warn!(outcome = ?other, "No pass ran"),
        }
        return Ok(());
    }

    let handle = coordinator.start();
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    handle.shutdown().await;

    Ok(())
}

async fn log_events(mut events: tokio::sync::broadcast::Receiver<SyncEvent>) {
    loop {
        match events.recv().await {
            Ok(SyncEvent::Rejected { client_id, reason }) => {
                tracing::warn!(client_id = %client_id, reason = %reason, "Record rejected by server");
            }
            Ok(SyncEvent::TransportFailed(error)) => {
                tracing::warn!(error = %error, "Server unreachable, will retry");
            }
            Ok(SyncEvent::RefreshFailed { key, error }) => {
                tracing::warn!(cache_key = %key, error = %error, "Refresh failed");
            }
            Ok(SyncEvent::StorageFailed(error)) => {
                tracing::error!(error = %error, "Local store failed during sync");
            }
            Ok(event) => tracing::debug!(?event, "Sync event"),
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Event logger fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
