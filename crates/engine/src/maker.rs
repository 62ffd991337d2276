//! Notification maker — materializes durable queue rows for one change
//! event.
//!
//! This is the only component that writes `pending_notifications`, which
//! keeps the at-most-once invariant behind a single writer. Mailing
//! creation is idempotent: a retried invocation reuses the existing
//! mailing and skips recipients it already queued under it.

use chrono::{Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use beacon_common::types::{ChangeEvent, NotificationKind, ProcessingState, Subscriber};

use crate::composer::{self, ComposedMessage};

/// What one materialization pass did with the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterializeOutcome {
    /// Queue rows written (or found already present); event marked done.
    Queued { queued: u32, skipped: u32 },
    /// Empty audience; event marked ignored.
    EmptyAudience,
    /// Event older than the freshness window; marked ignored unsent.
    Stale,
}

pub struct NotificationMaker {
    topic_url_prefix: String,
    freshness_window: Duration,
}

impl NotificationMaker {
    pub fn new(topic_url_prefix: String, freshness_window_hours: i64) -> Self {
        Self {
            topic_url_prefix,
            freshness_window: Duration::hours(freshness_window_hours),
        }
    }

    /// Create the mailing and one text (plus optional location) row per
    /// recipient, then flip the event's processing state.
    pub async fn materialize(
        &self,
        event: &ChangeEvent,
        subscribers: &[Subscriber],
        pool: &PgPool,
    ) -> anyhow::Result<MaterializeOutcome> {
        if Utc::now() - event.detected_at > self.freshness_window {
            tracing::warn!(
                change_event_id = event.id,
                detected_at = %event.detected_at,
                "Stale change event, ignoring"
            );
            self.finish_event(event.id, ProcessingState::Ignored, pool)
                .await?;
            return Ok(MaterializeOutcome::Stale);
        }

        if subscribers.is_empty() {
            self.finish_event(event.id, ProcessingState::Ignored, pool)
                .await?;
            return Ok(MaterializeOutcome::EmptyAudience);
        }

        let mailing_id = self.ensure_mailing(event, pool).await?;
        let already_queued = self.queued_recipients(mailing_id, pool).await?;

        let mut queued = 0u32;
        let mut skipped = 0u32;

        for subscriber in subscribers {
            if already_queued.contains(&subscriber.user_id) {
                skipped += 1;
                continue;
            }

            let Some(message) = composer::compose(event, subscriber, &self.topic_url_prefix)
            else {
                skipped += 1;
                continue;
            };

            self.insert_rows(event, subscriber.user_id, mailing_id, &message, pool)
                .await?;
            queued += 1;
        }

        self.finish_event(event.id, ProcessingState::Done, pool)
            .await?;

        tracing::info!(
            change_event_id = event.id,
            mailing_id = %mailing_id,
            queued,
            skipped,
            "Notifications materialized"
        );

        Ok(MaterializeOutcome::Queued { queued, skipped })
    }

    /// Create the mailing for this (change event, category) pair, or reuse
    /// the existing one.
    async fn ensure_mailing(&self, event: &ChangeEvent, pool: &PgPool) -> anyhow::Result<Uuid> {
        // DO UPDATE on the conflict target makes RETURNING yield the
        // surviving row's id on reuse.
        let (mailing_id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO mailings (id, change_event_id, category)
            VALUES ($1, $2, $3)
            ON CONFLICT (change_event_id, category)
                DO UPDATE SET category = EXCLUDED.category
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event.id)
        .bind(event.category())
        .fetch_one(pool)
        .await?;

        Ok(mailing_id)
    }

    /// Recipients that already have a text row under this mailing, from a
    /// previous (possibly partially failed) invocation.
    async fn queued_recipients(
        &self,
        mailing_id: Uuid,
        pool: &PgPool,
    ) -> anyhow::Result<std::collections::HashSet<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT user_id FROM pending_notifications WHERE mailing_id = $1 AND kind = $2",
        )
        .bind(mailing_id)
        .bind(NotificationKind::Text)
        .fetch_all(pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Insert the text row and its companion location row in one
    /// transaction, so the skip set never sees a text row whose
    /// companion was lost to a crash between the two inserts.
    async fn insert_rows(
        &self,
        event: &ChangeEvent,
        user_id: i64,
        mailing_id: Uuid,
        message: &ComposedMessage,
        pool: &PgPool,
    ) -> anyhow::Result<()> {
        let group_id = message.location.map(|_| Uuid::new_v4());
        let mut tx = pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO pending_notifications
                (mailing_id, change_event_id, user_id, kind, content, params, group_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(mailing_id)
        .bind(event.id)
        .bind(user_id)
        .bind(NotificationKind::Text)
        .bind(&message.text)
        .bind(serde_json::json!({
            "parse_mode": message.parse_mode,
            "disable_preview": true,
        }))
        .bind(group_id)
        .execute(&mut *tx)
        .await?;

        if let Some(location) = message.location {
            sqlx::query(
                r#"
                INSERT INTO pending_notifications
                    (mailing_id, change_event_id, user_id, kind, content, params, group_id)
                VALUES ($1, $2, $3, $4, NULL, $5, $6)
                "#,
            )
            .bind(mailing_id)
            .bind(event.id)
            .bind(user_id)
            .bind(NotificationKind::Location)
            .bind(serde_json::json!({ "lat": location.lat, "lon": location.lon }))
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn finish_event(
        &self,
        change_event_id: i64,
        state: ProcessingState,
        pool: &PgPool,
    ) -> anyhow::Result<()> {
        sqlx::query("UPDATE change_log SET processing_state = $1 WHERE id = $2")
            .bind(state)
            .bind(change_event_id)
            .execute(pool)
            .await?;
        Ok(())
    }
}
