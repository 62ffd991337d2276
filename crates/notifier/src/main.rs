//! Beacon notifier binary: runs one delivery worker pass per invocation
//! request popped from the bus, plus periodic sweep passes so failed rows
//! are retried even when nothing new is queued.

use beacon_common::bus::InvocationBus;
use beacon_common::config::AppConfig;
use beacon_common::db;
use beacon_common::redis_pool;

use beacon_notifier::telegram::TelegramClient;
use beacon_notifier::worker::{DeliveryWorker, WorkerSettings};

/// How long one bus pop waits before falling back to a sweep pass.
const POP_TIMEOUT_SECS: f64 = 30.0;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon_notifier=info,beacon_common=info".into()),
        )
        .json()
        .init();

    tracing::info!("Beacon notifier starting...");

    let config = AppConfig::from_env()?;

    let token = config
        .telegram_bot_token
        .clone()
        .ok_or_else(|| anyhow::anyhow!("TELEGRAM_BOT_TOKEN environment variable is required"))?;

    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    let redis = redis_pool::create_redis_pool(&config.redis_url).await?;
    let bus = InvocationBus::new(redis);

    let telegram = TelegramClient::new(token, config.telegram_api_base.clone())?;
    let worker = DeliveryWorker::new(
        pool,
        bus.clone(),
        telegram,
        WorkerSettings::from_config(&config),
    );

    tokio::select! {
        result = run_loop(&worker, &bus) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Notifier loop exited with error");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
        }
    }

    tracing::info!("Beacon notifier stopped.");
    Ok(())
}

async fn run_loop(worker: &DeliveryWorker, bus: &InvocationBus) -> anyhow::Result<()> {
    loop {
        let (instance_id, reason) = match bus.pop_delivery(POP_TIMEOUT_SECS).await? {
            Some(request) => (
                format!("notifier-{}", request.invocation_id),
                request.reason,
            ),
            // No invocation arrived: run a sweep so failed rows converge
            // to a terminal state without an external trigger.
            None => (
                format!("notifier-sweep-{}", uuid::Uuid::new_v4()),
                "periodic sweep".to_string(),
            ),
        };

        tracing::info!(instance_id, reason, "Starting delivery worker pass");
        if let Err(e) = worker.run(&instance_id).await {
            // The next pass retries anything this one left behind.
            tracing::error!(instance_id, error = %e, "Delivery worker pass failed");
        }
    }
}
