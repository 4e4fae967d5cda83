//! Mailbox provider API: watch subscriptions, change history and message
//! retrieval.

pub mod gmail;
pub mod mime;
#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};

use crate::error::ProviderError;
use crate::store::Watch;

pub use gmail::GmailClient;
pub use mime::{DecodedContent, decode_body, parse_headers, walk_parts};

/// OAuth tokens obtained outside this service.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub access_token: SecretString,
    #[serde(default)]
    pub refresh_token: Option<SecretString>,
}

impl From<&Watch> for Credentials {
    fn from(watch: &Watch) -> Self {
        Self {
            access_token: watch.access_token.clone(),
            refresh_token: watch.refresh_token.clone(),
        }
    }
}

/// Mailbox identity and current history position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub email_address: String,
    pub history_cursor: u64,
}

/// Result of establishing or renewing a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchResponse {
    pub history_cursor: u64,
    pub expiration: DateTime<Utc>,
}

/// A message reference from history or search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    pub id: String,
    pub thread_id: String,
    /// History record that added the message; 0 for search results.
    pub history_cursor: u64,
}

/// One page of "message added" history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryPage {
    pub added: Vec<MessageRef>,
    pub next_page_token: Option<String>,
    /// Mailbox cursor at the time of the call.
    pub latest_cursor: u64,
}

/// One page of a message search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageList {
    pub messages: Vec<MessageRef>,
    pub next_page_token: Option<String>,
}

/// A full message with its content tree.
#[derive(Debug, Clone, Default)]
pub struct ProviderMessage {
    pub id: String,
    pub thread_id: String,
    pub label_ids: Vec<String>,
    pub internal_date: Option<DateTime<Utc>>,
    pub payload: Option<MessagePart>,
}

/// Node of a MIME content tree.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessagePart {
    pub mime_type: String,
    pub filename: String,
    pub headers: Vec<Header>,
    pub body: Option<PartBody>,
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PartBody {
    pub size: u64,
    /// base64url content, absent for attachments.
    pub data: Option<String>,
    pub attachment_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Mailbox provider operations. Every call is bounded by a timeout.
#[async_trait]
pub trait MailboxProvider: Send + Sync {
    async fn profile(&self, credentials: &Credentials) -> Result<Profile, ProviderError>;

    /// Subscribe the mailbox's inbox to push notifications on `topic`.
    async fn watch(
        &self,
        credentials: &Credentials,
        topic: &str,
    ) -> Result<WatchResponse, ProviderError>;

    async fn stop(&self, credentials: &Credentials) -> Result<(), ProviderError>;

    /// "Message added" history since `start_cursor`. An unknown cursor is
    /// reported as `ProviderError::NotFound`.
    async fn list_history(
        &self,
        credentials: &Credentials,
        start_cursor: u64,
        page_token: Option<&str>,
    ) -> Result<HistoryPage, ProviderError>;

    async fn get_message(
        &self,
        credentials: &Credentials,
        message_id: &str,
    ) -> Result<ProviderMessage, ProviderError>;

    /// Search messages with a provider query such as `from:alerts@bank.pe`.
    async fn search_messages(
        &self,
        credentials: &Credentials,
        query: &str,
        page_token: Option<&str>,
    ) -> Result<MessageList, ProviderError>;
}

/// Provider ids travel as decimal strings; accept numbers too.
pub(crate) fn u64_from_str<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Like [`u64_from_str`] for optional fields.
pub(crate) fn opt_u64_from_str<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrap(#[serde(deserialize_with = "u64_from_str")] u64);

    Ok(Option::<Wrap>::deserialize(deserializer)?.map(|Wrap(n)| n))
}
