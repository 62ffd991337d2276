//! Invocation bus — the trigger interface between pipeline stages.
//!
//! Stages do not call each other directly. Anything that wants a delivery
//! worker pass publishes an invocation request onto a Redis list; the
//! notifier binary block-pops requests and runs one pass per request. The
//! delivery worker itself publishes here for overflow hand-off and
//! self-rescheduling.

use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const DELIVERY_QUEUE_KEY: &str = "beacon:invocations:delivery";

/// One request to run a delivery worker pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub invocation_id: Uuid,
    pub reason: String,
    pub requested_at: DateTime<Utc>,
}

impl InvocationRequest {
    pub fn new(reason: &str) -> Self {
        Self {
            invocation_id: Uuid::new_v4(),
            reason: reason.to_string(),
            requested_at: Utc::now(),
        }
    }
}

/// Redis-list-backed invocation bus.
#[derive(Clone)]
pub struct InvocationBus {
    redis: ConnectionManager,
}

impl InvocationBus {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    /// Publish a delivery worker invocation request.
    pub async fn publish_delivery(&self, reason: &str) -> anyhow::Result<InvocationRequest> {
        let request = InvocationRequest::new(reason);
        let payload = serde_json::to_string(&request)?;

        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(DELIVERY_QUEUE_KEY, payload).await?;

        tracing::debug!(
            invocation_id = %request.invocation_id,
            reason,
            "Published delivery invocation request"
        );
        Ok(request)
    }

    /// Block-pop the next delivery invocation request, waiting up to
    /// `timeout_secs`. Returns `None` on timeout.
    pub async fn pop_delivery(&self, timeout_secs: f64) -> anyhow::Result<Option<InvocationRequest>> {
        let mut conn = self.redis.clone();
        let popped: Option<(String, String)> =
            conn.brpop(DELIVERY_QUEUE_KEY, timeout_secs).await?;

        match popped {
            Some((_key, payload)) => {
                let request: InvocationRequest = serde_json::from_str(&payload)?;
                Ok(Some(request))
            }
            None => Ok(None),
        }
    }
}
