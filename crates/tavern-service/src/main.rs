//! tavern-sync - operator maintenance for the tavern store
//!
//! Drains the offline purchase queue and, with `--prune-backups <days>`,
//! deletes old document backups. Remote providers are wired by the bot
//! process; this binary reconciles against local state only.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tavern_service::{ServiceConfig, StoreService};
use tavern_store::{LocalStore, LocalStoreConfig};

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tavern_service=debug,tavern_store=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse arguments
    let mut prune_days: Option<u64> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--prune-backups" => {
                let days = args
                    .next()
                    .and_then(|v| v.parse().ok())
                    .ok_or("--prune-backups expects a number of days")?;
                prune_days = Some(days);
            }
            other => {
                return Err(format!("unknown argument: {other}").into());
            }
        }
    }

    tracing::info!("Starting tavern-sync");

    // Load configuration from environment
    let store_config = LocalStoreConfig::from_env();
    let service_config = ServiceConfig::from_env();
    tracing::info!(
        data_dir = %store_config.data_dir.display(),
        queue_file = %service_config.queue_file.display(),
        "Configuration loaded"
    );

    let local = Arc::new(LocalStore::new(store_config)?);
    let service = StoreService::new(Arc::clone(&local), None, service_config).await?;

    // Drain the offline queue
    let report = service.sync_pending_transactions().await?;
    tracing::info!(
        applied = report.applied,
        failed = report.failed,
        conflicts = report.conflicts,
        "Queue reconciliation finished"
    );
    for line in &report.errors {
        tracing::warn!(entry = %line, "Unresolved queue entry");
    }

    if let Some(days) = prune_days {
        let removed = local
            .prune_backups(Duration::from_secs(days * 86_400))
            .await?;
        tracing::info!(removed, days, "Pruned old backups");
    }

    if report.is_clean() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
