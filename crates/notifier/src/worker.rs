//! Delivery worker — one invocation drains the pending-notification queue
//! through the Telegram client.
//!
//! State machine per invocation: Idle → Leasing → Draining →
//! (Overflow-Handoff | Self-Reschedule | Idle). The lease is advisory; two
//! invocations racing inside the lease window are corrected by the
//! doubling guard before every send, never strictly prevented. Status
//! updates are single-row, single-statement UPDATEs so concurrent workers
//! only contend at row level.

use std::time::{Duration, Instant};

use chrono::Utc;
use sqlx::PgPool;

use beacon_common::bus::InvocationBus;
use beacon_common::config::AppConfig;
use beacon_common::types::{MessageParams, NotificationKind, PendingNotification};

use crate::telegram::{SendOutcome, TelegramClient};

/// Tunables for one worker invocation.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Soft wall-clock budget; an in-flight send is allowed to finish.
    pub time_budget: Duration,
    /// Failed sends after which the pass gives up.
    pub error_budget: u32,
    /// Backlog size above which helper invocations are requested.
    pub high_water: i64,
    /// Trailing window in which another unfinished lease defers this pass.
    pub lease_window: chrono::Duration,
    /// A failed row is not retried until this much time has passed.
    pub failed_cooldown: chrono::Duration,
    /// Fixed in-loop backoff after flood control.
    pub rate_limit_backoff: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            time_budget: Duration::from_secs(config.worker_time_budget_secs),
            error_budget: config.worker_error_budget,
            high_water: config.backlog_high_water,
            lease_window: chrono::Duration::seconds(config.lease_window_secs),
            failed_cooldown: chrono::Duration::seconds(config.failed_cooldown_secs),
            rate_limit_backoff: Duration::from_millis(config.rate_limit_backoff_ms),
        }
    }
}

/// Counters for one drain pass.
#[derive(Debug, Default, Clone)]
pub struct DrainStats {
    pub sent: u32,
    pub cancelled: u32,
    pub failed: u32,
    pub doubling_cancelled: u32,
    /// Completions lost to a concurrent worker (UPDATE matched no row).
    pub raced: u32,
    pub send_ms_total: u128,
    pub time_budget_hit: bool,
}

impl DrainStats {
    pub fn avg_send_ms(&self) -> u128 {
        let attempts = (self.sent + self.cancelled + self.failed + self.raced) as u128;
        if attempts == 0 { 0 } else { self.send_ms_total / attempts }
    }
}

/// Result of one worker invocation.
#[derive(Debug)]
pub enum RunOutcome {
    Drained(DrainStats),
    /// Another instance holds an unfinished lease inside the window.
    LeaseBusy,
}

/// How many helper invocations a backlog warrants before draining.
pub fn helper_count(backlog: i64, high_water: i64) -> u32 {
    if high_water <= 0 || backlog <= high_water {
        0
    } else if backlog <= high_water * 2 {
        1
    } else {
        2
    }
}

pub struct DeliveryWorker {
    pool: PgPool,
    bus: InvocationBus,
    telegram: TelegramClient,
    settings: WorkerSettings,
}

impl DeliveryWorker {
    pub fn new(
        pool: PgPool,
        bus: InvocationBus,
        telegram: TelegramClient,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            pool,
            bus,
            telegram,
            settings,
        }
    }

    /// Run one invocation end to end.
    pub async fn run(&self, instance_id: &str) -> anyhow::Result<RunOutcome> {
        let Some(lease_id) = self.acquire_lease(instance_id).await? else {
            tracing::info!(instance_id, "Another worker holds the lease, exiting");
            return Ok(RunOutcome::LeaseBusy);
        };

        let backlog = self.backlog_size().await?;
        for n in 0..helper_count(backlog, self.settings.high_water) {
            self.bus.publish_delivery("overflow hand-off").await?;
            tracing::info!(backlog, helper = n + 1, "Requested helper worker");
        }

        let stats = self.drain().await?;

        if stats.time_budget_hit && self.backlog_size().await? > 0 {
            self.bus.publish_delivery("self-reschedule").await?;
            tracing::info!("Time budget exceeded with backlog remaining, rescheduled");
        }

        self.finish_lease(lease_id).await?;

        tracing::info!(
            instance_id,
            sent = stats.sent,
            cancelled = stats.cancelled,
            failed = stats.failed,
            doubling_cancelled = stats.doubling_cancelled,
            raced = stats.raced,
            avg_send_ms = stats.avg_send_ms() as u64,
            "Drain pass finished"
        );

        Ok(RunOutcome::Drained(stats))
    }

    /// Record this instance's lease. Returns `None` when another instance
    /// started inside the trailing window and has not finished — the
    /// window expiry keeps a crashed instance from blocking forever.
    async fn acquire_lease(&self, instance_id: &str) -> anyhow::Result<Option<i64>> {
        let cutoff = Utc::now() - self.settings.lease_window;

        let (busy,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM worker_lease
                WHERE finished_at IS NULL AND started_at > $1 AND instance_id <> $2
            )
            "#,
        )
        .bind(cutoff)
        .bind(instance_id)
        .fetch_one(&self.pool)
        .await?;

        if busy {
            sqlx::query("INSERT INTO worker_lease (instance_id, finished_at) VALUES ($1, NOW())")
                .bind(instance_id)
                .execute(&self.pool)
                .await?;
            return Ok(None);
        }

        let (lease_id,): (i64,) =
            sqlx::query_as("INSERT INTO worker_lease (instance_id) VALUES ($1) RETURNING id")
                .bind(instance_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(Some(lease_id))
    }

    async fn finish_lease(&self, lease_id: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE worker_lease SET finished_at = NOW() WHERE id = $1")
            .bind(lease_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Count currently eligible queue rows.
    async fn backlog_size(&self) -> anyhow::Result<i64> {
        let cutoff = Utc::now() - self.settings.failed_cooldown;
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM pending_notifications
            WHERE completed_at IS NULL AND cancelled_at IS NULL
              AND (failed_at IS NULL OR failed_at < $1)
            "#,
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// The drain loop. Stops when the queue is empty, the soft time
    /// budget is exceeded, or the error budget is exhausted.
    async fn drain(&self) -> anyhow::Result<DrainStats> {
        let started = Instant::now();
        let mut stats = DrainStats::default();
        let mut failures = 0u32;

        loop {
            if started.elapsed() >= self.settings.time_budget {
                stats.time_budget_hit = true;
                break;
            }
            if failures >= self.settings.error_budget {
                tracing::warn!(failures, "Error budget exhausted, ending pass early");
                break;
            }

            let Some(row) = self.pop_next().await? else {
                break;
            };

            if self.doubling_guard(&row).await? {
                self.mark_cancelled(row.message_id, "doubling", None).await?;
                stats.doubling_cancelled += 1;
                continue;
            }

            let send_started = Instant::now();
            let outcome = self.send_row(&row).await;
            stats.send_ms_total += send_started.elapsed().as_millis();

            match outcome {
                SendOutcome::Delivered => {
                    if self.mark_completed(row.message_id).await? {
                        stats.sent += 1;
                    } else {
                        // Another worker finished this row while we were
                        // sending; the completed guard keeps it at-most-once.
                        stats.raced += 1;
                    }
                }
                SendOutcome::Blocked => {
                    self.mark_cancelled(row.message_id, "recipient_blocked", None)
                        .await?;
                    self.deactivate_subscriber(row.user_id).await?;
                    stats.cancelled += 1;
                }
                SendOutcome::BadRequest(detail) => {
                    tracing::warn!(
                        message_id = row.message_id,
                        detail,
                        "Unsendable notification, cancelling"
                    );
                    self.mark_cancelled(row.message_id, "bad_request", Some(&detail))
                        .await?;
                    stats.cancelled += 1;
                }
                SendOutcome::RateLimited => {
                    self.mark_failed(row.message_id, "flood control").await?;
                    stats.failed += 1;
                    failures += 1;
                    tokio::time::sleep(self.settings.rate_limit_backoff).await;
                }
                SendOutcome::Transient(detail) | SendOutcome::Unknown(detail) => {
                    tracing::warn!(message_id = row.message_id, detail, "Send failed");
                    self.mark_failed(row.message_id, &detail).await?;
                    stats.failed += 1;
                    failures += 1;
                }
            }
        }

        Ok(stats)
    }

    /// Oldest eligible row: no terminal timestamp, and any failure older
    /// than the cool-down window.
    async fn pop_next(&self) -> anyhow::Result<Option<PendingNotification>> {
        let cutoff = Utc::now() - self.settings.failed_cooldown;
        let row = sqlx::query_as(
            r#"
            SELECT * FROM pending_notifications
            WHERE completed_at IS NULL AND cancelled_at IS NULL
              AND (failed_at IS NULL OR failed_at < $1)
            ORDER BY created_at, message_id
            LIMIT 1
            "#,
        )
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Idempotency guard invoked before every send: has any other row for
    /// the same (change event, user, kind) already completed?
    async fn doubling_guard(&self, row: &PendingNotification) -> anyhow::Result<bool> {
        let (doubled,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM pending_notifications
                WHERE change_event_id = $1 AND user_id = $2 AND kind = $3
                  AND completed_at IS NOT NULL AND message_id <> $4
            )
            "#,
        )
        .bind(row.change_event_id)
        .bind(row.user_id)
        .bind(row.kind)
        .bind(row.message_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(doubled)
    }

    async fn send_row(&self, row: &PendingNotification) -> SendOutcome {
        let params = MessageParams::from_value(&row.params);

        match row.kind {
            NotificationKind::Text => match row.content.as_deref() {
                Some(text) if !text.is_empty() => {
                    self.telegram
                        .send_text(
                            row.user_id,
                            text,
                            params.parse_mode.as_deref(),
                            params.disable_preview.unwrap_or(true),
                        )
                        .await
                }
                _ => SendOutcome::BadRequest("text row without content".to_string()),
            },
            NotificationKind::Location => match (params.lat, params.lon) {
                (Some(lat), Some(lon)) => self.telegram.send_location(row.user_id, lat, lon).await,
                _ => SendOutcome::BadRequest("location row without coordinates".to_string()),
            },
        }
    }

    /// At-most-once completion: the guard clause makes a lost race a
    /// no-op instead of a second completed copy.
    async fn mark_completed(&self, message_id: i64) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pending_notifications
            SET completed_at = NOW(), failed_at = NULL, failure_detail = NULL
            WHERE message_id = $1 AND completed_at IS NULL AND cancelled_at IS NULL
            "#,
        )
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_cancelled(
        &self,
        message_id: i64,
        reason: &str,
        detail: Option<&str>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE pending_notifications
            SET cancelled_at = NOW(), cancellation_reason = $2, failure_detail = $3
            WHERE message_id = $1 AND completed_at IS NULL AND cancelled_at IS NULL
            "#,
        )
        .bind(message_id)
        .bind(reason)
        .bind(detail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, message_id: i64, detail: &str) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE pending_notifications
            SET failed_at = NOW(), failure_detail = $2
            WHERE message_id = $1 AND completed_at IS NULL AND cancelled_at IS NULL
            "#,
        )
        .bind(message_id)
        .bind(detail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Unsubscribe signal for a recipient who blocked the channel.
    async fn deactivate_subscriber(&self, user_id: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE subscribers SET active = false WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        tracing::info!(user_id, "Subscriber deactivated after permanent 403");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helper_count_thresholds() {
        assert_eq!(helper_count(0, 100), 0);
        assert_eq!(helper_count(100, 100), 0);
        assert_eq!(helper_count(101, 100), 1);
        assert_eq!(helper_count(200, 100), 1);
        assert_eq!(helper_count(201, 100), 2);
        assert_eq!(helper_count(10_000, 100), 2);
    }

    #[test]
    fn test_helper_count_disabled_high_water() {
        assert_eq!(helper_count(500, 0), 0);
    }

    #[test]
    fn test_drain_stats_avg() {
        let stats = DrainStats {
            sent: 3,
            failed: 1,
            send_ms_total: 400,
            ..Default::default()
        };
        assert_eq!(stats.avg_send_ms(), 100);
        assert_eq!(DrainStats::default().avg_send_ms(), 0);
    }
}
