//! # Comanda Agent
//!
//! Background daemon for the store server: drains the fiscal outbox and
//! pulls delivery orders into the sale ledger.
//!
//! ## Startup Sequence
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Agent Startup                                    │
//! │                                                                         │
//! │  1. tracing (RUST_LOG, default "info,comanda=debug,sqlx=warn")          │
//! │  2. EngineConfig::load(argv[1] | COMANDA_CONFIG | platform default)     │
//! │  3. Database::new (migrations run on open)                              │
//! │  4. fiscal.enabled  ──► spawn FiscalWorker(HttpFiscalEmitter)           │
//! │     intake.enabled  ──► spawn DeliveryIntake(HttpDeliveryChannel)       │
//! │  5. wait for Ctrl+C / SIGTERM ──► shutdown handles ──► join tasks       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod adapters;
mod error;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use comanda_db::{Database, DbConfig};
use comanda_engine::{ChangeFeed, DeliveryIntake, EngineConfig, FiscalWorker};

use crate::adapters::{HttpDeliveryChannel, HttpFiscalEmitter};
use crate::error::{AgentError, AgentResult};

#[tokio::main]
async fn main() -> AgentResult<()> {
    init_tracing();

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Arc::new(EngineConfig::load(config_path)?);
    info!(
        tenant_id = config.tenant_id(),
        database = %config.database.path.display(),
        fiscal = config.fiscal.enabled,
        intake = config.intake.enabled,
        "Configuration loaded"
    );

    let db = Database::new(
        DbConfig::new(config.database.path.clone())
            .max_connections(config.database.max_connections),
    )
    .await?;
    info!("Database ready");

    let feed = ChangeFeed::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let fiscal = if config.fiscal.enabled {
        let emitter = Arc::new(HttpFiscalEmitter::new(&config.fiscal)?);
        let (worker, handle) = FiscalWorker::new(db.clone(), emitter, config.fiscal.clone());
        tasks.push(tokio::spawn(worker.run()));
        Some(handle)
    } else {
        info!("Fiscal emission disabled");
        None
    };

    let intake = if config.intake.enabled {
        let channel = Arc::new(HttpDeliveryChannel::new(&config.intake)?);
        let (intake, handle) =
            DeliveryIntake::new(db.clone(), config.clone(), channel, feed.clone());
        tasks.push(tokio::spawn(intake.run()));
        Some(handle)
    } else {
        info!("Delivery intake disabled");
        None
    };

    tasks.push(tokio::spawn(log_changes(feed.clone())));

    shutdown_signal().await;

    if let Some(handle) = &fiscal {
        if let Err(e) = handle.shutdown().await {
            warn!(error = %e, "Fiscal worker already stopped");
        }
    }
    if let Some(handle) = &intake {
        if let Err(e) = handle.shutdown().await {
            warn!(error = %e, "Delivery intake already stopped");
        }
    }
    drop(feed);

    for task in tasks {
        task.await.map_err(|e| AgentError::Task(e.to_string()))?;
    }

    db.close().await;
    info!("Agent stopped");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,comanda=debug,sqlx=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Mirrors committed changes into the log until every sender is gone.
async fn log_changes(feed: ChangeFeed) {
    let mut events = feed.subscribe();
    drop(feed);

    loop {
        match events.recv().await {
            Ok(event) => debug!(?event, "Change published"),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Change log lagging");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
