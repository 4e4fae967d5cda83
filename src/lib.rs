//! bankmail: bank-notification email ingestion, routing, parsing and
//! reconciliation.

pub mod api;
pub mod config;
pub mod enrichment;
pub mod error;
pub mod parser;
pub mod pipeline;
pub mod provider;
pub mod reconcile;
pub mod routing;
pub mod store;
pub mod tenant;
pub mod watch;

