//! Types that flow through the per-message pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::parser::ParsedTransaction;

/// Recorded on raw emails whose sender matched no forwarding rule.
pub const ROUTING_MISS: &str = "No matching forwarding config found";

/// Where a message belongs: owning entity (tenant-detail), bank and account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Routing {
    pub entity_id: String,
    pub bank: String,
    pub account_number: String,
}

/// Normalized transaction fields returned by the external extraction service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionVariables {
    #[serde(default, deserialize_with = "lenient_string")]
    pub origin_account: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub destination_account: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub amount: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub currency: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub operation_date: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub operation_number: Option<String>,
}

/// Accept strings, numbers and null for a text field.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        Some(serde_json::Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

/// A part that carries both a filename and a content reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    pub attachment_id: String,
    pub size: u64,
}

/// One captured provider message. Created once per `provider_message_id`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEmailRecord {
    pub id: String,
    pub provider_message_id: String,
    pub thread_id: String,
    pub history_cursor: u64,
    /// RFC 822 `Message-ID` header, shared with the secondary capture source.
    pub message_id: Option<String>,
    pub sender: String,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    /// Header names are lowercased.
    pub headers: BTreeMap<String, String>,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub labels: Vec<String>,
    pub attachments: Vec<Attachment>,
    pub routing: Option<Routing>,
    /// Local bank-parser result.
    pub parsed: Option<ParsedTransaction>,
    pub transaction_variables: Option<TransactionVariables>,
    pub transaction_type: Option<String>,
    /// External enrichment succeeded.
    pub enriched: bool,
    /// Reconciled into a transaction record.
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RawEmailRecord {
    /// Identity shared with the secondary source. Falls back to the provider
    /// id when the message carried no `Message-ID` header.
    pub fn message_identity(&self) -> &str {
        match self.message_id.as_deref() {
            Some(id) if !id.trim().is_empty() => id.trim(),
            _ => &self.provider_message_id,
        }
    }
}

/// A message to run through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTask {
    pub message_id: String,
    pub thread_id: String,
    pub history_cursor: u64,
}

/// Result of `MessagePipeline::process`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// A new raw record was written.
    Stored { record_id: String, routed: bool },
    /// The message id was already captured. Not an error.
    AlreadyProcessed,
}
