//! Push ingestion: turn a delivery into a history sync for one mailbox.
//!
//! Cursor rules:
//! - syncs for one mailbox are serialized; different mailboxes run freely
//! - the new cursor is committed only after the whole paged scan finished
//!   without fetch or persist failures; overlap on the next run is absorbed
//!   by raw email idempotency
//! - cancellation is checked between pages and leaves the cursor untouched

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::sync::OwnedMutexGuard;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, ProviderError, WatchError};
use crate::pipeline::processor::MessagePipeline;
use crate::pipeline::types::{MessageTask, ProcessOutcome};
use crate::provider::Credentials;
use crate::store::{Watch, WatchStatus};

/// A decoded push delivery.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushNotice {
    #[serde(alias = "emailAddress")]
    pub mailbox: String,
    #[serde(alias = "historyId", deserialize_with = "crate::provider::u64_from_str")]
    pub reported_cursor: u64,
}

/// Counts for one history sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub mailbox: String,
    pub previous_cursor: u64,
    pub cursor: u64,
    pub pages: usize,
    pub messages: usize,
    pub stored: usize,
    pub already_processed: usize,
    /// Messages the provider no longer has.
    pub skipped: usize,
    pub failed: usize,
    /// The stored cursor was unknown to the provider and was moved forward
    /// without a scan.
    pub stale_cursor: bool,
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// No active watch for the mailbox; acknowledged and dropped.
    NoWatch,
    /// The reported cursor is not ahead of the stored one.
    UpToDate { cursor: u64 },
    Synced(SyncReport),
}

type LockMap = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

struct MailboxGuard<'a> {
    locks: &'a LockMap,
    mailbox: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for MailboxGuard<'_> {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        let lock = Arc::clone(OwnedMutexGuard::mutex(&guard));
        drop(guard);

        let mut locks = match self.locks.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Only the map and `lock` hold it: nobody is waiting.
        let current = locks
            .get(&self.mailbox)
            .is_some_and(|l| Arc::ptr_eq(l, &lock));
        if current && Arc::strong_count(&lock) == 2 {
            locks.remove(&self.mailbox);
        }
    }
}

pub struct PushIngestor {
    pipeline: Arc<MessagePipeline>,
    concurrency: usize,
    locks: LockMap,
    shutdown: Arc<AtomicBool>,
}

impl PushIngestor {
    pub fn new(pipeline: Arc<MessagePipeline>, concurrency: usize) -> Self {
        Self {
            pipeline,
            concurrency: concurrency.max(1),
            locks: Mutex::new(HashMap::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag checked between history pages. Setting it cancels running syncs.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Serialize work on one mailbox. The map entry goes away with the last
    /// holder, so mailboxes that are never watched leave nothing behind.
    async fn lock_mailbox(&self, mailbox: &str) -> MailboxGuard<'_> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            Arc::clone(locks.entry(mailbox.to_string()).or_default())
        };
        MailboxGuard {
            locks: &self.locks,
            mailbox: mailbox.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or_default()
    }

    /// Handle one push delivery.
    pub async fn handle(&self, notice: &PushNotice) -> Result<IngestOutcome, WatchError> {
        let mailbox = notice.mailbox.trim().to_lowercase();
        let _guard = self.lock_mailbox(&mailbox).await;

        // Read under the lock so a sync that just finished is visible.
        let watch = match self.pipeline.store().get_watch(&mailbox).await? {
            Some(w) if w.status == WatchStatus::Active => w,
            _ => {
                debug!(mailbox = %mailbox, "Delivery for unwatched mailbox dropped");
                return Ok(IngestOutcome::NoWatch);
            }
        };

        if notice.reported_cursor <= watch.history_cursor {
            debug!(
                mailbox = %mailbox,
                reported = notice.reported_cursor,
                stored = watch.history_cursor,
                "Delivery already covered"
            );
            return Ok(IngestOutcome::UpToDate {
                cursor: watch.history_cursor,
            });
        }

        self.sync_locked(&watch, Some(notice.reported_cursor))
            .await
            .map(IngestOutcome::Synced)
    }

    /// Sync a mailbox now, regardless of deliveries.
    pub async fn sync_now(&self, mailbox: &str) -> Result<SyncReport, WatchError> {
        let mailbox = mailbox.trim().to_lowercase();
        let _guard = self.lock_mailbox(&mailbox).await;

        let watch = self
            .pipeline
            .store()
            .get_watch(&mailbox)
            .await?
            .ok_or_else(|| WatchError::NotFound(mailbox.clone()))?;
        self.sync_locked(&watch, None).await
    }

    async fn sync_locked(
        &self,
        watch: &Watch,
        reported: Option<u64>,
    ) -> Result<SyncReport, WatchError> {
        let result = self.scan(watch, reported).await;
        if let Err(e) = &result {
            error!(mailbox = %watch.mailbox, error = %e, "History sync failed");
            if let Err(db) = self
                .pipeline
                .store()
                .set_watch_error(&watch.mailbox, &e.to_string())
                .await
            {
                warn!(mailbox = %watch.mailbox, error = %db, "Could not record sync error");
            }
        }
        result
    }

    async fn scan(&self, watch: &Watch, reported: Option<u64>) -> Result<SyncReport, WatchError> {
        let store = self.pipeline.store();
        let provider = self.pipeline.provider();
        let credentials = Credentials::from(watch);

        let mut report = SyncReport {
            mailbox: watch.mailbox.clone(),
            previous_cursor: watch.history_cursor,
            cursor: watch.history_cursor,
            ..Default::default()
        };
        let mut latest = watch.history_cursor;
        let mut page_token: Option<String> = None;
        let mut first_error: Option<PipelineError> = None;

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!(mailbox = %watch.mailbox, pages = report.pages, "History sync cancelled");
                return Err(WatchError::Cancelled(watch.mailbox.clone()));
            }

            let page = match provider
                .list_history(&credentials, watch.history_cursor, page_token.as_deref())
                .await
            {
                Ok(page) => page,
                Err(ProviderError::NotFound(detail)) if report.pages == 0 => {
                    return self
                        .recover_stale_cursor(watch, &credentials, reported, detail, report)
                        .await;
                }
                Err(e) => return Err(e.into()),
            };

            report.pages += 1;
            report.messages += page.added.len();
            latest = latest.max(page.latest_cursor);

            let outcomes: Vec<_> = futures::stream::iter(page.added)
                .map(|added| {
                    let credentials = &credentials;
                    async move {
                        let task = MessageTask {
                            message_id: added.id,
                            thread_id: added.thread_id,
                            history_cursor: added.history_cursor,
                        };
                        let outcome = self.pipeline.process(credentials, &task, None).await;
                        (task, outcome)
                    }
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

            for (task, outcome) in outcomes {
                latest = latest.max(task.history_cursor);
                match outcome {
                    Ok(ProcessOutcome::Stored { .. }) => report.stored += 1,
                    Ok(ProcessOutcome::AlreadyProcessed) => report.already_processed += 1,
                    Err(PipelineError::Fetch(ProviderError::NotFound(_))) => {
                        debug!(message_id = %task.message_id, "Message gone, skipped");
                        report.skipped += 1;
                    }
                    Err(e) => {
                        warn!(
                            mailbox = %watch.mailbox,
                            message_id = %task.message_id,
                            error = %e,
                            "Message failed during sync"
                        );
                        report.failed += 1;
                        first_error.get_or_insert(e);
                    }
                }
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        if let Some(e) = first_error {
            // Cursor stays put so the next delivery retries the failed messages.
            return Err(e.into());
        }

        report.cursor = store.advance_cursor(&watch.mailbox, latest).await?;
        info!(
            mailbox = %watch.mailbox,
            from = report.previous_cursor,
            to = report.cursor,
            pages = report.pages,
            stored = report.stored,
            already_processed = report.already_processed,
            "History sync committed"
        );
        Ok(report)
    }

    /// The provider no longer knows the stored cursor. Jump to the reported
    /// cursor (or the mailbox's current one); the gap needs a manual backfill.
    async fn recover_stale_cursor(
        &self,
        watch: &Watch,
        credentials: &Credentials,
        reported: Option<u64>,
        detail: String,
        mut report: SyncReport,
    ) -> Result<SyncReport, WatchError> {
        let target = match reported {
            Some(cursor) => cursor,
            None => {
                self.pipeline
                    .provider()
                    .profile(credentials)
                    .await?
                    .history_cursor
            }
        };
        warn!(
            mailbox = %watch.mailbox,
            stored = watch.history_cursor,
            target,
            detail = %detail,
            "Stored history cursor unknown to provider, advancing without scan"
        );
        report.cursor = self
            .pipeline
            .store()
            .advance_cursor(&watch.mailbox, target)
            .await?;
        report.stale_cursor = true;
        Ok(report)
    }
}
