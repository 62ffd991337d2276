//! Change-log pipeline — drives unprocessed change events through
//! audience resolution, composition, and materialization.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use beacon_common::error::AppError;
use beacon_common::types::{
    ChangeEvent, ChangeKind, ChangePayload, ProcessingState, Topic, TopicKind,
};

use crate::audience::AudienceResolver;
use crate::maker::{MaterializeOutcome, NotificationMaker};

/// Flat row shape for the change_log ⋈ topics fetch.
#[derive(Debug, sqlx::FromRow)]
struct ChangeEventRow {
    id: i64,
    topic_id: i64,
    kind: ChangeKind,
    payload: serde_json::Value,
    detected_at: DateTime<Utc>,
    topic_kind: TopicKind,
    title: String,
    display_name: Option<String>,
    status: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
    age_min: Option<i32>,
    age_max: Option<i32>,
    region: String,
}

impl ChangeEventRow {
    /// Validate the payload once; downstream code only sees the typed
    /// union.
    fn into_event(self) -> Result<ChangeEvent, AppError> {
        let payload = ChangePayload::from_kind(self.kind, &self.payload)?;
        Ok(ChangeEvent {
            id: self.id,
            topic_id: self.topic_id,
            kind: self.kind,
            payload,
            detected_at: self.detected_at,
            topic: Topic {
                topic_id: self.topic_id,
                kind: self.topic_kind,
                title: self.title,
                display_name: self.display_name,
                status: self.status,
                lat: self.lat,
                lon: self.lon,
                age_min: self.age_min,
                age_max: self.age_max,
                region: self.region,
            },
        })
    }
}

pub struct ChangePipeline {
    resolver: AudienceResolver,
    maker: NotificationMaker,
}

impl ChangePipeline {
    pub fn new(topic_url_prefix: String, freshness_window_hours: i64) -> Self {
        Self {
            resolver: AudienceResolver::new(),
            maker: NotificationMaker::new(topic_url_prefix, freshness_window_hours),
        }
    }

    /// Fetch up to `limit` unprocessed change events, oldest first,
    /// enriched with topic attributes. A row whose payload fails
    /// validation is marked ignored and skipped, never retried with
    /// ad-hoc parsing downstream.
    pub async fn fetch_unprocessed(
        &self,
        pool: &PgPool,
        limit: i64,
    ) -> anyhow::Result<Vec<ChangeEvent>> {
        let rows: Vec<ChangeEventRow> = sqlx::query_as(
            r#"
            SELECT c.id, c.topic_id, c.kind, c.payload, c.detected_at,
                   t.kind AS topic_kind, t.title, t.display_name, t.status,
                   t.lat, t.lon, t.age_min, t.age_max, t.region
            FROM change_log c
            JOIN topics t ON t.topic_id = c.topic_id
            WHERE c.processing_state = $1
            ORDER BY c.id
            LIMIT $2
            "#,
        )
        .bind(ProcessingState::Unprocessed)
        .bind(limit)
        .fetch_all(pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id;
            match row.into_event() {
                Ok(event) => events.push(event),
                Err(e) => {
                    tracing::error!(change_event_id = id, error = %e, "Malformed change payload, ignoring event");
                    sqlx::query("UPDATE change_log SET processing_state = $1 WHERE id = $2")
                        .bind(ProcessingState::Ignored)
                        .bind(id)
                        .execute(pool)
                        .await?;
                }
            }
        }
        Ok(events)
    }

    /// Claim an event for processing. Returns false when another pipeline
    /// instance claimed it first.
    pub async fn claim(&self, pool: &PgPool, change_event_id: i64) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE change_log SET processing_state = $1, claimed_at = NOW() WHERE id = $2 AND processing_state = $3",
        )
        .bind(ProcessingState::InProgress)
        .bind(change_event_id)
        .bind(ProcessingState::Unprocessed)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Return events stranded `in_progress` to the queue. A claim whose
    /// invocation died between claim and materialize would otherwise never
    /// be picked up again.
    pub async fn reclaim_stale(
        &self,
        pool: &PgPool,
        claim_timeout: chrono::Duration,
    ) -> anyhow::Result<u64> {
        let cutoff = Utc::now() - claim_timeout;
        let result = sqlx::query(
            r#"
            UPDATE change_log SET processing_state = $1, claimed_at = NULL
            WHERE processing_state = $2
              AND (claimed_at IS NULL OR claimed_at < $3)
            "#,
        )
        .bind(ProcessingState::Unprocessed)
        .bind(ProcessingState::InProgress)
        .bind(cutoff)
        .execute(pool)
        .await?;

        let reclaimed = result.rows_affected();
        if reclaimed > 0 {
            tracing::warn!(reclaimed, "Reclaimed stale in-progress change events");
        }
        Ok(reclaimed)
    }

    /// Run one event through resolve → compose → materialize. Returns the
    /// number of queue rows written.
    pub async fn process_event(
        &self,
        event: &ChangeEvent,
        pool: &PgPool,
    ) -> anyhow::Result<u32> {
        let audience = self.resolver.resolve(event, pool).await?;
        let outcome = self.maker.materialize(event, &audience, pool).await?;

        let queued = match outcome {
            MaterializeOutcome::Queued { queued, .. } => queued,
            MaterializeOutcome::EmptyAudience | MaterializeOutcome::Stale => 0,
        };
        Ok(queued)
    }
}
