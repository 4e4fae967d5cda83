//! Persistence layer: the shared system database and per-tenant stores.

pub mod libsql_backend;
pub mod migrations;
pub mod tenant;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use tenant::{RecordKind, SecondaryRawRecord, TenantStore, TransactionRecord};
pub use traits::{ForwardingConfig, ForwardingRule, MatchingStats, SystemStore, Watch, WatchStatus};
