//! Telegram Bot API client with response classification.
//!
//! Two operations: per-chat text send and location send. Every call
//! resolves to a [`SendOutcome`] — the client never returns `Err`, because
//! no failure while sending one notification may abort the drain loop.

use std::time::Duration;

use serde::Deserialize;

/// Classified result of one send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Accepted by Telegram.
    Delivered,
    /// HTTP 403 — the recipient blocked the bot or deactivated their
    /// account. Never retried; triggers a deactivation signal.
    Blocked,
    /// HTTP 400 — malformed content. Retrying cannot succeed.
    BadRequest(String),
    /// HTTP 420–429 — flood control. Retried after a short backoff.
    RateLimited,
    /// Timeouts, reset connections, 5xx. Retried on a later pass.
    Transient(String),
    /// Anything unclassified. Logged in full and retried.
    Unknown(String),
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    description: Option<String>,
}

pub struct TelegramClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
}

impl TelegramClient {
    /// Build a client with bounded timeouts so a stuck call cannot stall
    /// the drain loop.
    pub fn new(token: String, api_base: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(15))
            .build()?;

        Ok(Self {
            http,
            api_base,
            token,
        })
    }

    /// `sendMessage`: per-chat text send.
    pub async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        parse_mode: Option<&str>,
        disable_preview: bool,
    ) -> SendOutcome {
        let mut body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "disable_web_page_preview": disable_preview,
        });
        if let Some(mode) = parse_mode {
            body["parse_mode"] = serde_json::json!(mode);
        }

        self.call("sendMessage", &body).await
    }

    /// `sendLocation`: per-chat location send.
    pub async fn send_location(&self, chat_id: i64, lat: f64, lon: f64) -> SendOutcome {
        let body = serde_json::json!({
            "chat_id": chat_id,
            "latitude": lat,
            "longitude": lon,
        });

        self.call("sendLocation", &body).await
    }

    async fn call(&self, method: &str, body: &serde_json::Value) -> SendOutcome {
        let url = format!("{}/bot{}/{}", self.api_base, self.token, method);

        match self.http.post(&url).json(body).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                classify_response(status, &body)
            }
            Err(e) => classify_error(&e),
        }
    }
}

/// Map an HTTP response onto the outcome taxonomy.
pub fn classify_response(status: u16, body: &str) -> SendOutcome {
    match status {
        200..=299 => {
            // A 2xx with ok=false should not happen; treat it as unknown
            // rather than assuming delivery.
            match serde_json::from_str::<ApiResponse>(body) {
                Ok(api) if api.ok => SendOutcome::Delivered,
                Ok(api) => SendOutcome::Unknown(
                    api.description
                        .unwrap_or_else(|| format!("HTTP {} with ok=false", status)),
                ),
                Err(_) => SendOutcome::Delivered,
            }
        }
        400 => SendOutcome::BadRequest(error_description(body, status)),
        403 => SendOutcome::Blocked,
        420..=429 => SendOutcome::RateLimited,
        500..=599 => SendOutcome::Transient(error_description(body, status)),
        other => SendOutcome::Unknown(error_description(body, other)),
    }
}

/// Map a transport-level error onto the outcome taxonomy.
pub fn classify_error(e: &reqwest::Error) -> SendOutcome {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        SendOutcome::Transient(e.to_string())
    } else {
        SendOutcome::Unknown(e.to_string())
    }
}

fn error_description(body: &str, status: u16) -> String {
    match serde_json::from_str::<ApiResponse>(body) {
        Ok(ApiResponse {
            description: Some(description),
            ..
        }) => description,
        _ => format!("HTTP {}", status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_success() {
        assert_eq!(
            classify_response(200, r#"{"ok":true,"result":{}}"#),
            SendOutcome::Delivered
        );
    }

    #[test]
    fn test_classify_success_without_body() {
        // Some proxies strip response bodies
        assert_eq!(classify_response(200, ""), SendOutcome::Delivered);
    }

    #[test]
    fn test_classify_ok_false_is_unknown() {
        let outcome =
            classify_response(200, r#"{"ok":false,"description":"something odd"}"#);
        assert_eq!(outcome, SendOutcome::Unknown("something odd".to_string()));
    }

    #[test]
    fn test_classify_blocked() {
        assert_eq!(
            classify_response(403, r#"{"ok":false,"description":"Forbidden: bot was blocked by the user"}"#),
            SendOutcome::Blocked
        );
    }

    #[test]
    fn test_classify_bad_request() {
        let outcome = classify_response(
            400,
            r#"{"ok":false,"description":"Bad Request: can't parse entities"}"#,
        );
        assert_eq!(
            outcome,
            SendOutcome::BadRequest("Bad Request: can't parse entities".to_string())
        );
    }

    #[test]
    fn test_classify_flood_control_range() {
        assert_eq!(classify_response(429, "{}"), SendOutcome::RateLimited);
        assert_eq!(classify_response(420, "{}"), SendOutcome::RateLimited);
    }

    #[test]
    fn test_classify_server_errors_transient() {
        assert!(matches!(
            classify_response(502, "Bad Gateway"),
            SendOutcome::Transient(_)
        ));
    }

    #[test]
    fn test_classify_unexpected_status() {
        assert!(matches!(
            classify_response(301, ""),
            SendOutcome::Unknown(_)
        ));
    }
}
