//! Mailbox watches: lifecycle, push ingestion and the background queue.

pub mod ingestor;
pub mod manager;
pub mod queue;

pub use ingestor::{IngestOutcome, PushIngestor, PushNotice, SyncReport};
pub use manager::{RenewalReport, WatchManager, WatchView, spawn_renewal_ticker};
pub use queue::{Enqueued, IngestQueue, QueueStats};
