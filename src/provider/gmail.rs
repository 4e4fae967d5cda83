//! Gmail REST client.
//!
//! Only the endpoints the ingestion path needs: profile, watch/stop,
//! history.list, messages.get and messages.list. Token refresh is not
//! handled here; an expired access token surfaces as `Unauthorized`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::RequestBuilder;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::{
    Credentials, HistoryPage, MailboxProvider, MessageList, MessagePart, MessageRef, Profile,
    ProviderMessage, WatchResponse, opt_u64_from_str, u64_from_str,
};
use crate::error::ProviderError;

const DEFAULT_BASE_URL: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

/// Page size for message searches.
const SEARCH_PAGE_SIZE: u32 = 100;

pub struct GmailClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl GmailClient {
    pub fn new(timeout: Duration) -> Result<Self, ProviderError> {
        Self::with_base_url(DEFAULT_BASE_URL, timeout)
    }

    /// Point the client at another API root (tests, proxies).
    pub fn with_base_url(base_url: &str, timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Connectivity(format!("client init: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    async fn send(
        &self,
        request: RequestBuilder,
        credentials: &Credentials,
        what: &str,
    ) -> Result<reqwest::Response, ProviderError> {
        let resp = request
            .bearer_auth(credentials.access_token.expose_secret())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(self.timeout)
                } else {
                    ProviderError::Connectivity(format!("{what}: {e}"))
                }
            })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        tracing::debug!(call = what, status = status.as_u16(), "Gmail call failed");
        Err(match status.as_u16() {
            401 => ProviderError::Unauthorized(format!("{what}: {body}")),
            404 => ProviderError::NotFound(format!("{what}: {body}")),
            code => ProviderError::Status { status: code, body },
        })
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        credentials: &Credentials,
        what: &str,
    ) -> Result<T, ProviderError> {
        self.send(request, credentials, what)
            .await?
            .json::<T>()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("{what}: {e}")))
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileWire {
    email_address: String,
    #[serde(deserialize_with = "u64_from_str")]
    history_id: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatchWire {
    #[serde(deserialize_with = "u64_from_str")]
    history_id: u64,
    /// Epoch milliseconds.
    #[serde(deserialize_with = "u64_from_str")]
    expiration: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryWire {
    #[serde(default)]
    history: Vec<HistoryRecordWire>,
    next_page_token: Option<String>,
    #[serde(deserialize_with = "u64_from_str")]
    history_id: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRecordWire {
    #[serde(deserialize_with = "u64_from_str")]
    id: u64,
    #[serde(default)]
    messages_added: Vec<MessageAddedWire>,
}

#[derive(Deserialize)]
struct MessageAddedWire {
    message: MessageRefWire,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageRefWire {
    id: String,
    #[serde(default)]
    thread_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListWire {
    #[serde(default)]
    messages: Vec<MessageRefWire>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageWire {
    id: String,
    #[serde(default)]
    thread_id: String,
    #[serde(default)]
    label_ids: Vec<String>,
    /// Epoch milliseconds.
    #[serde(default, deserialize_with = "opt_u64_from_str")]
    internal_date: Option<u64>,
    payload: Option<MessagePart>,
}

fn from_millis(ms: u64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(i64::try_from(ms).ok()?)
}

impl HistoryWire {
    fn into_page(self) -> HistoryPage {
        let added = self
            .history
            .into_iter()
            .flat_map(|record| {
                let cursor = record.id;
                record.messages_added.into_iter().map(move |added| MessageRef {
                    id: added.message.id,
                    thread_id: added.message.thread_id,
                    history_cursor: cursor,
                })
            })
            .collect();
        HistoryPage {
            added,
            next_page_token: self.next_page_token.filter(|t| !t.is_empty()),
            latest_cursor: self.history_id,
        }
    }
}

#[async_trait]
impl MailboxProvider for GmailClient {
    async fn profile(&self, credentials: &Credentials) -> Result<Profile, ProviderError> {
        let wire: ProfileWire = self
            .send_json(self.client.get(self.url("profile")), credentials, "profile")
            .await?;
        Ok(Profile {
            email_address: wire.email_address.to_lowercase(),
            history_cursor: wire.history_id,
        })
    }

    async fn watch(
        &self,
        credentials: &Credentials,
        topic: &str,
    ) -> Result<WatchResponse, ProviderError> {
        let body = serde_json::json!({
            "topicName": topic,
            "labelIds": ["INBOX"],
            "labelFilterBehavior": "INCLUDE",
        });
        let wire: WatchWire = self
            .send_json(
                self.client.post(self.url("watch")).json(&body),
                credentials,
                "watch",
            )
            .await?;
        let expiration = from_millis(wire.expiration).ok_or_else(|| {
            ProviderError::InvalidResponse(format!("watch: bad expiration {}", wire.expiration))
        })?;
        Ok(WatchResponse {
            history_cursor: wire.history_id,
            expiration,
        })
    }

    async fn stop(&self, credentials: &Credentials) -> Result<(), ProviderError> {
        self.send(self.client.post(self.url("stop")), credentials, "stop")
            .await?;
        Ok(())
    }

    async fn list_history(
        &self,
        credentials: &Credentials,
        start_cursor: u64,
        page_token: Option<&str>,
    ) -> Result<HistoryPage, ProviderError> {
        let mut query = vec![
            ("startHistoryId", start_cursor.to_string()),
            ("historyTypes", "messageAdded".to_string()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }
        let wire: HistoryWire = self
            .send_json(
                self.client.get(self.url("history")).query(&query),
                credentials,
                "history.list",
            )
            .await?;
        Ok(wire.into_page())
    }

    async fn get_message(
        &self,
        credentials: &Credentials,
        message_id: &str,
    ) -> Result<ProviderMessage, ProviderError> {
        let wire: MessageWire = self
            .send_json(
                self.client
                    .get(self.url(&format!("messages/{message_id}")))
                    .query(&[("format", "full")]),
                credentials,
                "messages.get",
            )
            .await?;
        Ok(ProviderMessage {
            id: wire.id,
            thread_id: wire.thread_id,
            label_ids: wire.label_ids,
            internal_date: wire.internal_date.and_then(from_millis),
            payload: wire.payload,
        })
    }

    async fn search_messages(
        &self,
        credentials: &Credentials,
        query: &str,
        page_token: Option<&str>,
    ) -> Result<MessageList, ProviderError> {
        let mut params = vec![
            ("q", query.to_string()),
            ("maxResults", SEARCH_PAGE_SIZE.to_string()),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }
        let wire: MessageListWire = self
            .send_json(
                self.client.get(self.url("messages")).query(&params),
                credentials,
                "messages.list",
            )
            .await?;
        Ok(MessageList {
            messages: wire
                .messages
                .into_iter()
                .map(|m| MessageRef {
                    id: m.id,
                    thread_id: m.thread_id,
                    history_cursor: 0,
                })
                .collect(),
            next_page_token: wire.next_page_token.filter(|t| !t.is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::Router;
    use axum::extract::Query;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use secrecy::SecretString;
    use serde_json::json;
    use std::collections::HashMap;

    fn creds(token: &str) -> Credentials {
        Credentials {
            access_token: SecretString::from(token.to_string()),
            refresh_token: None,
        }
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == "Bearer good")
    }

    async fn fake_gmail() -> String {
        let app = Router::new()
            .route(
                "/profile",
                get(|headers: HeaderMap| async move {
                    if !authorized(&headers) {
                        return (StatusCode::UNAUTHORIZED, "expired").into_response();
                    }
                    axum::Json(json!({"emailAddress": "Caja@Acme.pe", "historyId": "480"}))
                        .into_response()
                }),
            )
            .route(
                "/watch",
                post(|| async {
                    axum::Json(json!({"historyId": "480", "expiration": "1735689600000"}))
                }),
            )
            .route(
                "/history",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    if q.get("startHistoryId").map(String::as_str) == Some("1") {
                        return (StatusCode::NOT_FOUND, "history gone").into_response();
                    }
                    assert_eq!(q.get("historyTypes").map(String::as_str), Some("messageAdded"));
                    axum::Json(json!({
                        "history": [
                            {"id": "490", "messagesAdded": [{"message": {"id": "m1", "threadId": "t1"}}]},
                            {"id": "495"},
                            {"id": "500", "messagesAdded": [{"message": {"id": "m2", "threadId": "t2"}}]}
                        ],
                        "historyId": "500"
                    }))
                    .into_response()
                }),
            )
            .route(
                "/messages/{id}",
                get(|axum::extract::Path(id): axum::extract::Path<String>| async move {
                    axum::Json(json!({
                        "id": id,
                        "threadId": "t1",
                        "labelIds": ["INBOX"],
                        "internalDate": "1735689600000",
                        "payload": {"mimeType": "text/plain", "body": {"size": 2, "data": "aGk"}}
                    }))
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn profile_and_unauthorized() {
        let base = fake_gmail().await;
        let client = GmailClient::with_base_url(&base, Duration::from_secs(5)).unwrap();

        let profile = client.profile(&creds("good")).await.unwrap();
        assert_eq!(profile.email_address, "caja@acme.pe");
        assert_eq!(profile.history_cursor, 480);

        let err = client.profile(&creds("stale")).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn watch_expiration_from_millis() {
        let base = fake_gmail().await;
        let client = GmailClient::with_base_url(&base, Duration::from_secs(5)).unwrap();
        let resp = client.watch(&creds("good"), "projects/p/topics/t").await.unwrap();
        assert_eq!(resp.history_cursor, 480);
        assert_eq!(resp.expiration.timestamp(), 1_735_689_600);
    }

    #[tokio::test]
    async fn history_flattens_added_messages() {
        let base = fake_gmail().await;
        let client = GmailClient::with_base_url(&base, Duration::from_secs(5)).unwrap();

        let page = client.list_history(&creds("good"), 480, None).await.unwrap();
        assert_eq!(page.latest_cursor, 500);
        assert_eq!(page.next_page_token, None);
        let ids: Vec<_> = page.added.iter().map(|m| (m.id.as_str(), m.history_cursor)).collect();
        assert_eq!(ids, vec![("m1", 490), ("m2", 500)]);

        let err = client.list_history(&creds("good"), 1, None).await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound(_)));
    }

    #[tokio::test]
    async fn message_payload_decoded() {
        let base = fake_gmail().await;
        let client = GmailClient::with_base_url(&base, Duration::from_secs(5)).unwrap();
        let msg = client.get_message(&creds("good"), "m1").await.unwrap();
        assert_eq!(msg.id, "m1");
        assert_eq!(msg.label_ids, vec!["INBOX"]);
        assert!(msg.internal_date.is_some());
        let content = crate::provider::walk_parts(msg.payload.as_ref().unwrap());
        assert_eq!(content.text.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn unreachable_is_connectivity() {
        let client =
            GmailClient::with_base_url("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = client.profile(&creds("good")).await.unwrap_err();
        assert!(matches!(
            err,
            ProviderError::Connectivity(_) | ProviderError::Timeout(_)
        ));
    }
}
