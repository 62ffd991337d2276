use serde::Deserialize;

use crate::error::AppError;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string (invocation bus)
    pub redis_url: String,

    /// Telegram bot token (required by the notifier binary)
    pub telegram_bot_token: Option<String>,

    /// Telegram Bot API base URL (overridable for local test servers)
    pub telegram_api_base: String,

    /// Forum topic URL prefix; the topic id is appended to build links
    pub forum_topic_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Change-log polling interval in milliseconds (default: 5000)
    pub poll_interval_ms: u64,

    /// Events older than this many hours are marked ignored, not fanned out
    pub freshness_window_hours: i64,

    /// An in-progress claim older than this many seconds is returned to the queue
    pub claim_timeout_secs: i64,

    /// Soft wall-clock budget for one delivery worker invocation, seconds
    pub worker_time_budget_secs: u64,

    /// Number of failed sends after which a drain pass gives up
    pub worker_error_budget: u32,

    /// Backlog size above which helper worker invocations are requested
    pub backlog_high_water: i64,

    /// Trailing window in which another unfinished lease blocks a new pass
    pub lease_window_secs: i64,

    /// A failed notification is not retried until this many seconds pass
    pub failed_cooldown_secs: i64,

    /// Fixed in-loop backoff after a Telegram 429, milliseconds
    pub rate_limit_backoff_ms: u64,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL").map_err(|_| {
                AppError::Config("DATABASE_URL environment variable is required".to_string())
            })?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            telegram_bot_token: std::env::var("TELEGRAM_BOT_TOKEN").ok(),
            telegram_api_base: std::env::var("TELEGRAM_API_BASE")
                .unwrap_or_else(|_| "https://api.telegram.org".to_string()),
            forum_topic_url: std::env::var("FORUM_TOPIC_URL")
                .unwrap_or_else(|_| "https://forum.example.org/viewtopic.php?t=".to_string()),
            db_max_connections: parse_env("DB_MAX_CONNECTIONS", 20)?,
            poll_interval_ms: parse_env("POLL_INTERVAL_MS", 5000)?,
            freshness_window_hours: parse_env("FRESHNESS_WINDOW_HOURS", 36)?,
            claim_timeout_secs: parse_env("CLAIM_TIMEOUT_SECS", 300)?,
            worker_time_budget_secs: parse_env("WORKER_TIME_BUDGET_SECS", 50)?,
            worker_error_budget: parse_env("WORKER_ERROR_BUDGET", 10)?,
            backlog_high_water: parse_env("BACKLOG_HIGH_WATER", 100)?,
            lease_window_secs: parse_env("LEASE_WINDOW_SECS", 90)?,
            failed_cooldown_secs: parse_env("FAILED_COOLDOWN_SECS", 300)?,
            rate_limit_backoff_ms: parse_env("RATE_LIMIT_BACKOFF_MS", 1500)?,
        })
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T, AppError> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| {
            AppError::Config(format!(
                "{} must be a valid {}",
                name,
                std::any::type_name::<T>()
            ))
        }),
        Err(_) => Ok(default),
    }
}
