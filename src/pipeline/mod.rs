//! Message capture pipeline.
//!
//! Every provider message, whether it arrives through history sync or a
//! manual backfill, flows through `MessagePipeline::process`:
//! 1. idempotency check on the provider message id
//! 2. fetch and decode the content tree
//! 3. routing (forced, or `EntityRouter`)
//! 4. local bank parse and optional external enrichment
//! 5. one `RawEmailRecord`
//!
//! **A message id is captured at most once.** The uniqueness constraint on
//! the raw email table backs the up-front check.

pub mod backfill;
pub mod processor;
pub mod types;

pub use backfill::{Backfill, BackfillReport, BackfillRequest};
pub use processor::MessagePipeline;
pub use types::{MessageTask, ProcessOutcome, RawEmailRecord, Routing};
