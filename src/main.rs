use std::sync::Arc;

use tokio_cron_scheduler::JobScheduler;
use trade_sync::database::repositories::TradeRepositoryImpl;
use trade_sync::logging::init_logging;
use trade_sync::{AppConfig, HuobiClient, StorageRouter, TradeSyncJob};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file (if present)
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env();

    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = init_logging(&config.log)?;

    tracing::info!("Starting Huobi trade sync");

    let router = Arc::new(StorageRouter::connect(&config.storage.connections, config.storage.pool_size).await);
    let Some(default_client) = router.default_client() else {
        tracing::error!("No storage connection available, set STORAGE_CONNECTIONS or DATABASE_URL");
        return Err("no storage connection".into());
    };
    tracing::info!("Writing trades through storage connection '{}'", default_client);

    let client = Arc::new(HuobiClient::new(&config.market)?);
    let repository = Arc::new(TradeRepositoryImpl::new(router.clone(), config.sync.database_base.clone()));
    let job = TradeSyncJob::new(client, repository, config.sync.clone());

    let mut scheduler = JobScheduler::new().await?;
    job.register(&scheduler).await?;
    scheduler.start().await?;
    tracing::info!("Scheduler started");

    if config.sync.run_on_start {
        job.run_cycle().await;
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    if let Err(e) = scheduler.shutdown().await {
        tracing::error!("Failed to stop scheduler: {}", e);
    }
    router.close_all().await;

    Ok(())
}
