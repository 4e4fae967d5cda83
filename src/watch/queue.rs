//! Bounded push queue drained by a fixed worker pool.
//!
//! The webhook handler only enqueues and returns; workers run the history
//! sync. A full queue drops the delivery: the next delivery for the same
//! mailbox reports a higher cursor and covers it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::watch::ingestor::{IngestOutcome, PushIngestor, PushNotice};

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    in_flight: AtomicU64,
    synced: AtomicU64,
    up_to_date: AtomicU64,
    no_watch: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub workers: usize,
    pub capacity: usize,
    pub enqueued: u64,
    pub dropped: u64,
    pub in_flight: u64,
    pub synced: u64,
    pub up_to_date: u64,
    pub no_watch: u64,
    pub failed: u64,
}

/// Result of `IngestQueue::enqueue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Accepted,
    /// Queue full or closed.
    Dropped,
}

pub struct IngestQueue {
    tx: mpsc::Sender<PushNotice>,
    counters: Arc<Counters>,
    workers: usize,
    capacity: usize,
}

impl IngestQueue {
    /// Start `workers` tasks draining a queue of `capacity` notices.
    /// Workers exit once every `IngestQueue` handle is dropped and the queue
    /// is drained.
    pub fn start(
        ingestor: Arc<PushIngestor>,
        workers: usize,
        capacity: usize,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let workers = workers.max(1);
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let rx = Arc::new(Mutex::new(rx));
        let counters = Arc::new(Counters::default());

        let handles = (0..workers)
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let ingestor = Arc::clone(&ingestor);
                let counters = Arc::clone(&counters);
                tokio::spawn(async move {
                    run_worker(worker, rx, ingestor, counters).await;
                })
            })
            .collect();

        info!(workers, capacity, "Ingest queue started");
        (
            Self {
                tx,
                counters,
                workers,
                capacity,
            },
            handles,
        )
    }

    /// Queue a notice without waiting.
    pub fn enqueue(&self, notice: PushNotice) -> Enqueued {
        match self.tx.try_send(notice) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                Enqueued::Accepted
            }
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                let notice = match &e {
                    mpsc::error::TrySendError::Full(n) | mpsc::error::TrySendError::Closed(n) => n,
                };
                warn!(
                    mailbox = %notice.mailbox,
                    reported_cursor = notice.reported_cursor,
                    "Ingest queue rejected delivery: {e}"
                );
                Enqueued::Dropped
            }
        }
    }

    pub fn stats(&self) -> QueueStats {
        let c = &self.counters;
        QueueStats {
            workers: self.workers,
            capacity: self.capacity,
            enqueued: c.enqueued.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            in_flight: c.in_flight.load(Ordering::Relaxed),
            synced: c.synced.load(Ordering::Relaxed),
            up_to_date: c.up_to_date.load(Ordering::Relaxed),
            no_watch: c.no_watch.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }
}

async fn run_worker(
    worker: usize,
    rx: Arc<Mutex<mpsc::Receiver<PushNotice>>>,
    ingestor: Arc<PushIngestor>,
    counters: Arc<Counters>,
) {
    loop {
        // Hold the receiver only while waiting, not while syncing.
        let notice = { rx.lock().await.recv().await };
        let Some(notice) = notice else {
            debug!(worker, "Ingest worker stopping");
            return;
        };

        counters.in_flight.fetch_add(1, Ordering::Relaxed);
        match ingestor.handle(&notice).await {
            Ok(IngestOutcome::Synced(report)) => {
                counters.synced.fetch_add(1, Ordering::Relaxed);
                debug!(worker, mailbox = %report.mailbox, stored = report.stored, "Delivery synced");
            }
            Ok(IngestOutcome::UpToDate { .. }) => {
                counters.up_to_date.fetch_add(1, Ordering::Relaxed);
            }
            Ok(IngestOutcome::NoWatch) => {
                counters.no_watch.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(worker, mailbox = %notice.mailbox, error = %e, "Delivery failed");
            }
        }
        counters.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use chrono::Utc;
    use secrecy::SecretString;

    use crate::pipeline::MessagePipeline;
    use crate::provider::testing::FakeMailbox;
    use crate::routing::EntityRouter;
    use crate::store::{LibSqlBackend, SystemStore, Watch, WatchStatus};

    async fn ingestor(fake: FakeMailbox) -> (Arc<PushIngestor>, Arc<LibSqlBackend>) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let now = Utc::now();
        db.upsert_watch(&Watch {
            mailbox: "caja@acme.pe".into(),
            history_cursor: 480,
            expiration: now + chrono::Duration::days(5),
            topic: "projects/p/topics/t".into(),
            access_token: SecretString::from("token".to_string()),
            refresh_token: None,
            status: WatchStatus::Active,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();
        let router = Arc::new(EntityRouter::new(db.clone(), db.clone()));
        let pipeline = Arc::new(MessagePipeline::new(db.clone(), Arc::new(fake), router, None));
        (Arc::new(PushIngestor::new(pipeline, 2)), db)
    }

    fn notice(mailbox: &str, cursor: u64) -> PushNotice {
        PushNotice {
            mailbox: mailbox.into(),
            reported_cursor: cursor,
        }
    }

    async fn settle(queue: &IngestQueue, expected: u64) -> QueueStats {
        for _ in 0..100 {
            let stats = queue.stats();
            let done = stats.synced + stats.up_to_date + stats.no_watch + stats.failed;
            if done >= expected && stats.in_flight == 0 {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        queue.stats()
    }

    #[tokio::test]
    async fn workers_drain_queue() {
        let fake = FakeMailbox::new("caja@acme.pe", 480);
        fake.deliver("m1", "a@bank.pe", "s", "S/ 1.00", 490);
        fake.deliver("m2", "a@bank.pe", "s", "S/ 2.00", 500);
        let (ingestor, db) = ingestor(fake).await;
        let (queue, _handles) = IngestQueue::start(ingestor, 2, 8);

        assert_eq!(queue.enqueue(notice("caja@acme.pe", 500)), Enqueued::Accepted);
        assert_eq!(queue.enqueue(notice("caja@acme.pe", 500)), Enqueued::Accepted);
        assert_eq!(queue.enqueue(notice("nobody@acme.pe", 7)), Enqueued::Accepted);

        let stats = settle(&queue, 3).await;
        assert_eq!(stats.enqueued, 3);
        assert_eq!(stats.synced + stats.up_to_date, 2);
        assert_eq!(stats.no_watch, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(db.list_raw_emails(None, 10).await.unwrap().len(), 2);
        assert_eq!(
            db.get_watch("caja@acme.pe").await.unwrap().unwrap().history_cursor,
            500
        );
    }

    #[tokio::test]
    async fn full_queue_drops() {
        let (tx, _rx) = mpsc::channel(1);
        // No workers behind it.
        let queue = IngestQueue {
            tx,
            counters: Arc::new(Counters::default()),
            workers: 0,
            capacity: 1,
        };

        assert_eq!(queue.enqueue(notice("caja@acme.pe", 1)), Enqueued::Accepted);
        assert_eq!(queue.enqueue(notice("caja@acme.pe", 2)), Enqueued::Dropped);
        let stats = queue.stats();
        assert_eq!(stats.enqueued, 1);
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test]
    async fn workers_exit_when_queue_dropped() {
        let (ingestor, _db) = ingestor(FakeMailbox::new("caja@acme.pe", 480)).await;
        let (queue, handles) = IngestQueue::start(ingestor, 3, 4);
        drop(queue);
        for h in handles {
            tokio::time::timeout(Duration::from_secs(2), h)
                .await
                .expect("worker should stop")
                .unwrap();
        }
    }
}
