//! Push delivery endpoint.
//!
//! Order of checks: shared token (401), payload decode, per-mailbox rate
//! limit (429), enqueue. Everything after the token check answers 200 unless
//! rate limited, so the push channel never redelivers a payload that cannot
//! succeed.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::Json;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, warn};

use super::AppState;
use crate::error::WebhookError;
use crate::watch::{Enqueued, PushNotice};

/// Tracked keys above which idle ones are swept.
const SWEEP_AT: usize = 1000;

/// Sliding-window limiter keyed by an arbitrary string.
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Record a hit for `key` at `now`. `false` when the window is full.
    pub fn check(&self, key: &str, now: Instant) -> bool {
        let mut hits = match self.hits.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if hits.len() >= SWEEP_AT {
            let span = self.window;
            hits.retain(|_, w| w.back().is_some_and(|&last| now.duration_since(last) < span));
        }
        let window = hits.entry(key.to_string()).or_default();
        while let Some(&oldest) = window.front() {
            if now.duration_since(oldest) >= self.window {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() >= self.limit {
            return false;
        }
        window.push_back(now);
        true
    }
}

#[cfg(test)]
impl RateLimiter {
    fn tracked_keys(&self) -> usize {
        self.hits.lock().map(|h| h.len()).unwrap_or_default()
    }
}

/// Token check plus rate limiting for push deliveries.
pub struct WebhookGuard {
    token: SecretString,
    limiter: RateLimiter,
}

impl WebhookGuard {
    pub fn new(token: SecretString, limiter: RateLimiter) -> Self {
        Self { token, limiter }
    }

    /// Accept the token from `?token=` or an `Authorization: Bearer` header.
    pub fn authorize(&self, query: Option<&str>, headers: &HeaderMap) -> Result<(), WebhookError> {
        let bearer = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim);
        let presented = query.or(bearer).ok_or(WebhookError::Unauthorized)?;
        if constant_time_eq(presented.as_bytes(), self.token.expose_secret().as_bytes()) {
            Ok(())
        } else {
            Err(WebhookError::Unauthorized)
        }
    }

    pub fn admit(&self, mailbox: &str) -> Result<(), WebhookError> {
        if self.limiter.check(mailbox, Instant::now()) {
            Ok(())
        } else {
            Err(WebhookError::RateLimited(mailbox.to_string()))
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ── Payload ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PushEnvelope {
    message: PushMessage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushMessage {
    data: String,
    #[serde(default)]
    message_id: Option<String>,
}

/// Decode `{"message": {"data": base64(JSON)}}` into a notice.
pub fn decode_notice(body: &[u8]) -> Result<PushNotice, WebhookError> {
    let envelope: PushEnvelope = serde_json::from_slice(body)
        .map_err(|e| WebhookError::InvalidPayload(format!("envelope: {e}")))?;
    let data = envelope.message.data.trim();
    let raw = STANDARD
        .decode(data)
        .or_else(|_| URL_SAFE.decode(data))
        .map_err(|e| WebhookError::InvalidPayload(format!("data: {e}")))?;
    let mut notice: PushNotice = serde_json::from_slice(&raw)
        .map_err(|e| WebhookError::InvalidPayload(format!("notice: {e}")))?;

    notice.mailbox = notice.mailbox.trim().to_lowercase();
    if notice.mailbox.is_empty() {
        return Err(WebhookError::InvalidPayload("empty mailbox".into()));
    }
    if let Some(id) = envelope.message.message_id {
        debug!(delivery_id = %id, mailbox = %notice.mailbox, "Push delivery decoded");
    }
    Ok(notice)
}

// ── Handler ─────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    token: Option<String>,
}

/// POST /api/mailbox/webhook
pub async fn receive(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Err(e) = state.webhook.authorize(query.token.as_deref(), &headers) {
        warn!(security = true, error = %e, "Webhook delivery rejected");
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "unauthorized"})),
        );
    }

    let notice = match decode_notice(&body) {
        Ok(notice) => notice,
        Err(e) => {
            warn!(error = %e, "Malformed push payload acknowledged and dropped");
            return (
                StatusCode::OK,
                Json(serde_json::json!({"status": "ignored"})),
            );
        }
    };

    if let Err(e) = state.webhook.admit(&notice.mailbox) {
        warn!(security = true, mailbox = %notice.mailbox, error = %e, "Webhook rate limited");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({"error": "rate limited"})),
        );
    }

    let status = match state.queue.enqueue(notice) {
        Enqueued::Accepted => "queued",
        Enqueued::Dropped => "dropped",
    };
    (StatusCode::OK, Json(serde_json::json!({ "status": status })))
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::http::HeaderValue;

    fn guard() -> WebhookGuard {
        WebhookGuard::new(
            SecretString::from("s3cret".to_string()),
            RateLimiter::new(3, Duration::from_secs(60)),
        )
    }

    fn envelope(json: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "message": {"data": STANDARD.encode(json), "messageId": "42"},
            "subscription": "projects/p/subscriptions/s"
        }))
        .unwrap()
    }

    #[test]
    fn token_from_query_or_bearer() {
        let g = guard();
        let empty = HeaderMap::new();
        assert!(g.authorize(Some("s3cret"), &empty).is_ok());
        assert!(g.authorize(Some("s3cre"), &empty).is_err());
        assert!(g.authorize(None, &empty).is_err());

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer s3cret"));
        assert!(g.authorize(None, &headers).is_ok());
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic s3cret"));
        assert!(g.authorize(None, &headers).is_err());
    }

    #[test]
    fn sliding_window() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(limiter.check("a", t0));
        assert!(limiter.check("a", t0 + Duration::from_secs(1)));
        assert!(!limiter.check("a", t0 + Duration::from_secs(2)));
        // Other keys are independent.
        assert!(limiter.check("b", t0 + Duration::from_secs(2)));
        // Hits age out one by one.
        assert!(limiter.check("a", t0 + Duration::from_secs(60)));
        assert!(limiter.check("a", t0 + Duration::from_secs(61)));
        assert!(!limiter.check("a", t0 + Duration::from_secs(62)));
    }

    #[test]
    fn idle_keys_are_swept() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        let t0 = Instant::now();
        for i in 0..5000 {
            assert!(limiter.check(&format!("box{i}@acme.pe"), t0));
        }
        assert_eq!(limiter.tracked_keys(), 5000);

        assert!(limiter.check("late@acme.pe", t0 + Duration::from_secs(3600)));
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn sweep_keeps_active_windows() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(limiter.check("busy@acme.pe", t0 + Duration::from_secs(30)));
        for i in 0..SWEEP_AT {
            limiter.check(&format!("box{i}@acme.pe"), t0);
        }
        // The sweep at t0+61 drops the t0 keys but the busy one is still limited.
        assert!(!limiter.check("busy@acme.pe", t0 + Duration::from_secs(61)));
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn decodes_provider_payload() {
        let notice =
            decode_notice(&envelope(r#"{"emailAddress":"Caja@Acme.pe","historyId":500}"#)).unwrap();
        assert_eq!(notice.mailbox, "caja@acme.pe");
        assert_eq!(notice.reported_cursor, 500);
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert!(decode_notice(b"not json").is_err());
        assert!(decode_notice(br#"{"message":{"data":"%%%"}}"#).is_err());
        assert!(decode_notice(&envelope(r#"{"emailAddress":"a@b.pe"}"#)).is_err());
        assert!(decode_notice(&envelope(r#"{"emailAddress":" ","historyId":"1"}"#)).is_err());
    }

    #[test]
    fn constant_time_compare() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
