//! Error types for bankmail.

use std::time::Duration;

/// Configuration-related errors. Always fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors from the per-tenant store registry.
#[derive(Debug, thiserror::Error)]
pub enum TenantError {
    #[error("Tenant detail {detail_id} not found for tenant {tenant_id}")]
    NotFound { tenant_id: String, detail_id: String },

    #[error("Tenant store {detail_id} unreachable: {reason}")]
    Connectivity { detail_id: String, reason: String },

    #[error("Tenant directory lookup failed: {0}")]
    Directory(#[from] DatabaseError),
}

/// Mailbox provider API errors.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider unreachable: {0}")]
    Connectivity(String),

    #[error("Provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Provider rejected credentials: {0}")]
    Unauthorized(String),

    #[error("Provider resource not found: {0}")]
    NotFound(String),

    #[error("Provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),
}

/// External extraction service errors.
#[derive(Debug, thiserror::Error)]
pub enum EnrichmentError {
    #[error("Enrichment request failed: {0}")]
    Request(String),

    #[error("Enrichment timed out after {0:?}")]
    Timeout(Duration),

    #[error("Enrichment service returned HTTP {0}")]
    Status(u16),

    #[error("Invalid enrichment response: {0}")]
    InvalidResponse(String),
}

/// Forwarding rule validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ForwardingError {
    #[error("Invalid sender address: {0:?}")]
    InvalidEmail(String),

    #[error("Sender {0} appears more than once")]
    DuplicateEmail(String),

    #[error("Rule for {0} has no accounts")]
    NoAccounts(String),
}

/// Per-message pipeline errors. Routing and parse misses are data, not errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Message fetch failed: {0}")]
    Fetch(#[from] ProviderError),

    #[error("Persist failed: {0}")]
    Persist(#[from] DatabaseError),
}

/// Watch lifecycle and history sync errors.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("No watch registered for mailbox {0}")]
    NotFound(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("History sync cancelled for mailbox {0}")]
    Cancelled(String),
}

/// Manual backfill errors. Per-message failures are reported, not raised.
#[derive(Debug, thiserror::Error)]
pub enum BackfillError {
    #[error("No active forwarding config for entity {0}")]
    NoForwarding(String),

    #[error("Sender {sender} is not configured for entity {entity_id}")]
    UnknownSender { entity_id: String, sender: String },

    #[error("No account of entity {0} resolves for forced routing")]
    NoAccount(String),

    #[error("No active mailbox watch")]
    NoWatch,

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Reconciliation errors.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Unknown entity {0}")]
    UnknownEntity(String),

    #[error("Tenant error: {0}")]
    Tenant(#[from] TenantError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Push delivery validation errors.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Webhook token rejected")]
    Unauthorized,

    #[error("Rate limit exceeded for {0}")]
    RateLimited(String),

    #[error("Malformed push payload: {0}")]
    InvalidPayload(String),
}
