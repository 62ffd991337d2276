//! Beacon engine binary: polls the change log and fans detected changes
//! out into the pending-notification queue.

use std::time::Duration;

use beacon_common::bus::InvocationBus;
use beacon_common::config::AppConfig;
use beacon_common::db;
use beacon_common::redis_pool;

use beacon_engine::pipeline::ChangePipeline;

const FETCH_BATCH: i64 = 20;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon_engine=info,beacon_common=info".into()),
        )
        .json()
        .init();

    tracing::info!("Beacon engine starting...");

    let config = AppConfig::from_env()?;

    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;

    sqlx::migrate!("../../migrations").run(&pool).await?;
    tracing::info!("Database migrations applied");

    let redis = redis_pool::create_redis_pool(&config.redis_url).await?;
    let bus = InvocationBus::new(redis);

    let pipeline = ChangePipeline::new(
        config.forum_topic_url.clone(),
        config.freshness_window_hours,
    );
    let poll_interval = Duration::from_millis(config.poll_interval_ms);
    let claim_timeout = chrono::Duration::seconds(config.claim_timeout_secs);

    tokio::select! {
        result = run_loop(&pipeline, &pool, &bus, poll_interval, claim_timeout) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Pipeline loop exited with error");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
        }
    }

    tracing::info!("Beacon engine stopped.");
    Ok(())
}

async fn run_loop(
    pipeline: &ChangePipeline,
    pool: &sqlx::PgPool,
    bus: &InvocationBus,
    poll_interval: Duration,
    claim_timeout: chrono::Duration,
) -> anyhow::Result<()> {
    loop {
        pipeline.reclaim_stale(pool, claim_timeout).await?;
        let events = pipeline.fetch_unprocessed(pool, FETCH_BATCH).await?;

        let mut total_queued = 0u32;
        for event in &events {
            if !pipeline.claim(pool, event.id).await? {
                continue;
            }

            match pipeline.process_event(event, pool).await {
                Ok(queued) => total_queued += queued,
                Err(e) => {
                    // One bad event must not stall the rest of the batch;
                    // the stale-claim reclaim returns it to the queue.
                    tracing::error!(
                        change_event_id = event.id,
                        error = %e,
                        "Failed to process change event"
                    );
                }
            }
        }

        if total_queued > 0 {
            bus.publish_delivery("change-log fan-out").await?;
        }

        tokio::time::sleep(poll_interval).await;
    }
}
