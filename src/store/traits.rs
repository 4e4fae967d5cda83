//! `SystemStore` trait: the shared (non-tenant) persistence surface.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::Serialize;

use crate::error::DatabaseError;
use crate::pipeline::types::RawEmailRecord;

/// Lifecycle state of a mailbox watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchStatus {
    Active,
    Expired,
    Error,
}

impl WatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchStatus::Active => "active",
            WatchStatus::Expired => "expired",
            WatchStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "active" => WatchStatus::Active,
            "error" => WatchStatus::Error,
            _ => WatchStatus::Expired,
        }
    }
}

/// Subscription to change notifications for one mailbox.
#[derive(Debug, Clone)]
pub struct Watch {
    pub mailbox: String,
    pub history_cursor: u64,
    pub expiration: DateTime<Utc>,
    pub topic: String,
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub status: WatchStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Watch {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration <= now
    }
}

/// Maps one sender address to destination accounts of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardingRule {
    pub entity_id: String,
    /// Stored lowercased.
    pub email: String,
    pub account_ids: Vec<String>,
}

/// All forwarding rules owned by one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardingConfig {
    pub entity_id: String,
    pub active: bool,
    pub rules: Vec<ForwardingRule>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregate counts over captured raw emails.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchingStats {
    pub total: u64,
    pub matched: u64,
    pub unmatched: u64,
    pub processed: u64,
    pub with_errors: u64,
    pub match_rate: f64,
    pub by_bank: BTreeMap<String, u64>,
}

/// Backend-agnostic store for watches, forwarding rules and raw emails.
#[async_trait]
pub trait SystemStore: Send + Sync {
    // ── Watches ─────────────────────────────────────────────────────

    /// Insert or update the watch for `watch.mailbox`. The stored cursor
    /// never moves backwards.
    async fn upsert_watch(&self, watch: &Watch) -> Result<(), DatabaseError>;

    async fn get_watch(&self, mailbox: &str) -> Result<Option<Watch>, DatabaseError>;

    async fn list_watches(&self) -> Result<Vec<Watch>, DatabaseError>;

    /// Any active watch, used when a caller does not name a mailbox.
    async fn any_active_watch(&self) -> Result<Option<Watch>, DatabaseError>;

    /// Active watches whose expiration is before `deadline`.
    async fn watches_expiring_before(
        &self,
        deadline: DateTime<Utc>,
    ) -> Result<Vec<Watch>, DatabaseError>;

    /// Move the cursor forward to `cursor` if it is greater than the stored
    /// one. Returns the cursor now stored.
    async fn advance_cursor(&self, mailbox: &str, cursor: u64) -> Result<u64, DatabaseError>;

    /// Record a successful renewal: new expiration, status active, error cleared.
    async fn renew_watch(
        &self,
        mailbox: &str,
        expiration: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn set_watch_status(
        &self,
        mailbox: &str,
        status: WatchStatus,
        last_error: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Record a sync failure without changing the status.
    async fn set_watch_error(&self, mailbox: &str, last_error: &str) -> Result<(), DatabaseError>;

    // ── Forwarding rules ────────────────────────────────────────────

    /// Replace every rule of an entity.
    async fn replace_forwarding(
        &self,
        entity_id: &str,
        active: bool,
        rules: &[ForwardingRule],
    ) -> Result<(), DatabaseError>;

    async fn get_forwarding(&self, entity_id: &str)
    -> Result<Option<ForwardingConfig>, DatabaseError>;

    /// Rule of an active config whose email equals `email` ignoring case.
    async fn find_forwarding_rule(&self, email: &str)
    -> Result<Option<ForwardingRule>, DatabaseError>;

    // ── Raw emails ──────────────────────────────────────────────────

    async fn raw_email_exists(&self, provider_message_id: &str) -> Result<bool, DatabaseError>;

    /// Insert a raw email. Returns `false` when a record with the same
    /// provider message id already exists.
    async fn insert_raw_email(&self, record: &RawEmailRecord) -> Result<bool, DatabaseError>;

    async fn get_raw_email(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<RawEmailRecord>, DatabaseError>;

    /// Routed to `entity_id` and not yet reconciled, oldest first.
    async fn pending_raw_emails(&self, entity_id: &str)
    -> Result<Vec<RawEmailRecord>, DatabaseError>;

    async fn mark_raw_processed(
        &self,
        id: &str,
        processed_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Newest first, optionally filtered by entity.
    async fn list_raw_emails(
        &self,
        entity_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<RawEmailRecord>, DatabaseError>;

    async fn matching_stats(&self) -> Result<MatchingStats, DatabaseError>;
}
