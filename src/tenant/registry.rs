//! Tenant connection registry: lazily opened, cached store handles.
//!
//! At most one live `TenantStore` exists per tenant-detail id. Concurrent
//! `acquire` calls for the same detail share one in-flight open attempt.
//! Opening is bounded by a timeout; failures are surfaced, never retried here.
//! A release while an open is in flight does not orphan the opened handle.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::error::{DatabaseError, TenantError};
use crate::store::TenantStore;
use crate::tenant::directory::{DetailInfo, TenantDirectory};

/// Opens the physical store behind a tenant-detail.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self, detail: &DetailInfo) -> Result<TenantStore, DatabaseError>;
}

/// Opens `<base_dir>/<store_name>.db` on local disk.
pub struct LocalConnector {
    base_dir: PathBuf,
}

impl LocalConnector {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

#[async_trait]
impl StoreConnector for LocalConnector {
    async fn connect(&self, detail: &DetailInfo) -> Result<TenantStore, DatabaseError> {
        let file_name = sanitize_store_name(&detail.store_name);
        if file_name.is_empty() {
            return Err(DatabaseError::Pool(format!(
                "tenant detail {} has no usable store name",
                detail.id
            )));
        }
        let path = self.base_dir.join(format!("{file_name}.db"));
        TenantStore::open_local(&path, &detail.id).await
    }
}

/// Keep store names inside the tenant directory.
fn sanitize_store_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

type Slot = Arc<OnceCell<Arc<TenantStore>>>;

/// Registry of open tenant stores, keyed by tenant-detail id.
pub struct TenantConnectionRegistry {
    directory: Arc<dyn TenantDirectory>,
    connector: Arc<dyn StoreConnector>,
    connect_timeout: Duration,
    slots: Mutex<HashMap<String, Slot>>,
}

impl TenantConnectionRegistry {
    pub fn new(
        directory: Arc<dyn TenantDirectory>,
        connector: Arc<dyn StoreConnector>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            directory,
            connector,
            connect_timeout,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Get the store for `detail_id`, opening it if needed.
    ///
    /// Fails with `NotFound` when the detail does not exist or belongs to a
    /// different tenant, and with `Connectivity` when opening fails or does
    /// not finish within the connect timeout.
    pub async fn acquire(
        &self,
        tenant_id: &str,
        detail_id: &str,
    ) -> Result<Arc<TenantStore>, TenantError> {
        let not_found = || TenantError::NotFound {
            tenant_id: tenant_id.to_string(),
            detail_id: detail_id.to_string(),
        };

        let detail = self
            .directory
            .lookup_detail(detail_id)
            .await?
            .ok_or_else(not_found)?;
        if detail.tenant_id != tenant_id || detail.store_name.trim().is_empty() {
            return Err(not_found());
        }

        loop {
            let slot = {
                let mut slots = self.slots.lock().await;
                Arc::clone(
                    slots
                        .entry(detail_id.to_string())
                        .or_insert_with(|| Arc::new(OnceCell::new())),
                )
            };

            if let Some(store) = slot.get() {
                return Ok(Arc::clone(store));
            }

            let result = slot
                .get_or_try_init(|| async {
                    debug!(detail_id = detail_id, store = %detail.store_name, "Opening tenant store");
                    match tokio::time::timeout(self.connect_timeout, self.connector.connect(&detail))
                        .await
                    {
                        Ok(Ok(store)) => Ok(Arc::new(store)),
                        Ok(Err(e)) => Err(TenantError::Connectivity {
                            detail_id: detail_id.to_string(),
                            reason: e.to_string(),
                        }),
                        Err(_) => Err(TenantError::Connectivity {
                            detail_id: detail_id.to_string(),
                            reason: format!("timed out after {:?}", self.connect_timeout),
                        }),
                    }
                })
                .await;

            match result {
                Ok(store) => {
                    let store = Arc::clone(store);
                    // A release during the open evicted the slot. Put it
                    // back, or share whatever replaced it.
                    let mut slots = self.slots.lock().await;
                    match slots.get(detail_id).map(|current| Arc::ptr_eq(current, &slot)) {
                        Some(true) => return Ok(store),
                        Some(false) => {
                            debug!(detail_id = detail_id, "Tenant slot replaced during open");
                        }
                        None => {
                            slots.insert(detail_id.to_string(), Arc::clone(&slot));
                            return Ok(store);
                        }
                    }
                }
                Err(e) => {
                    warn!(detail_id = detail_id, error = %e, "Tenant store open failed");
                    let mut slots = self.slots.lock().await;
                    if let Some(current) = slots.get(detail_id) {
                        if Arc::ptr_eq(current, &slot) && current.get().is_none() {
                            slots.remove(detail_id);
                        }
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Close and evict one handle. Returns whether a handle was cached.
    pub async fn release(&self, detail_id: &str) -> bool {
        let removed = self.slots.lock().await.remove(detail_id);
        if removed.is_some() {
            info!(detail_id = detail_id, "Tenant store released");
        }
        removed.is_some()
    }

    /// Close every cached handle. Called at shutdown.
    pub async fn release_all(&self) -> usize {
        let mut slots = self.slots.lock().await;
        let count = slots.len();
        slots.clear();
        info!(count, "All tenant stores released");
        count
    }

    /// Number of open handles.
    pub async fn open_count(&self) -> usize {
        self.slots
            .lock()
            .await
            .values()
            .filter(|slot| slot.get().is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::store::LibSqlBackend;

    /// Connector that counts attempts and opens in-memory stores after a delay.
    struct CountingConnector {
        attempts: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl CountingConnector {
        fn new(delay: Duration) -> Self {
            Self {
                attempts: AtomicUsize::new(0),
                delay,
                fail: false,
            }
        }
    }

    #[async_trait]
    impl StoreConnector for CountingConnector {
        async fn connect(&self, detail: &DetailInfo) -> Result<TenantStore, DatabaseError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(DatabaseError::Pool("connection refused".into()));
            }
            TenantStore::open_memory(&detail.id).await
        }
    }

    async fn directory() -> Arc<LibSqlBackend> {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.register_tenant("t1", "Acme").await.unwrap();
        db.register_tenant("t2", "Globex").await.unwrap();
        db.register_detail("d1", "t1", "acme_main", None).await.unwrap();
        db.register_detail("d2", "t2", "globex_main", None).await.unwrap();
        Arc::new(db)
    }

    fn registry(dir: Arc<LibSqlBackend>, connector: Arc<CountingConnector>) -> TenantConnectionRegistry {
        TenantConnectionRegistry::new(dir, connector, Duration::from_millis(200))
    }

    #[tokio::test]
    async fn acquire_caches_handle() {
        let connector = Arc::new(CountingConnector::new(Duration::ZERO));
        let reg = registry(directory().await, Arc::clone(&connector));

        let a = reg.acquire("t1", "d1").await.unwrap();
        let b = reg.acquire("t1", "d1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(reg.open_count().await, 1);
    }

    #[tokio::test]
    async fn concurrent_acquires_coalesce() {
        let connector = Arc::new(CountingConnector::new(Duration::from_millis(50)));
        let reg = Arc::new(registry(directory().await, Arc::clone(&connector)));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let reg = Arc::clone(&reg);
            handles.push(tokio::spawn(async move { reg.acquire("t1", "d1").await }));
        }
        let stores: Vec<_> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        assert!(stores.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test]
    async fn wrong_tenant_is_not_found() {
        let connector = Arc::new(CountingConnector::new(Duration::ZERO));
        let reg = registry(directory().await, Arc::clone(&connector));

        let err = reg.acquire("t1", "d2").await.unwrap_err();
        assert!(matches!(err, TenantError::NotFound { .. }));
        let err = reg.acquire("t1", "missing").await.unwrap_err();
        assert!(matches!(err, TenantError::NotFound { .. }));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn slow_store_times_out() {
        let connector = Arc::new(CountingConnector::new(Duration::from_secs(5)));
        let reg = registry(directory().await, Arc::clone(&connector));

        let err = reg.acquire("t1", "d1").await.unwrap_err();
        assert!(matches!(err, TenantError::Connectivity { .. }));
        assert_eq!(reg.open_count().await, 0);
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connect_failure_is_connectivity_error() {
        let connector = Arc::new(CountingConnector {
            attempts: AtomicUsize::new(0),
            delay: Duration::ZERO,
            fail: true,
        });
        let reg = registry(directory().await, Arc::clone(&connector));

        let err = reg.acquire("t1", "d1").await.unwrap_err();
        assert!(matches!(err, TenantError::Connectivity { .. }));
        assert_eq!(reg.open_count().await, 0);
    }

    #[tokio::test]
    async fn release_evicts_and_reopens() {
        let connector = Arc::new(CountingConnector::new(Duration::ZERO));
        let reg = registry(directory().await, Arc::clone(&connector));

        reg.acquire("t1", "d1").await.unwrap();
        assert!(reg.release("d1").await);
        assert!(!reg.release("d1").await);
        reg.acquire("t1", "d1").await.unwrap();
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);

        reg.acquire("t2", "d2").await.unwrap();
        assert_eq!(reg.release_all().await, 2);
        assert_eq!(reg.open_count().await, 0);
    }

    #[tokio::test]
    async fn release_during_open_keeps_single_handle() {
        let connector = Arc::new(CountingConnector::new(Duration::from_millis(100)));
        let reg = Arc::new(registry(directory().await, Arc::clone(&connector)));

        let opening = {
            let reg = Arc::clone(&reg);
            tokio::spawn(async move { reg.acquire("t1", "d1").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(reg.release("d1").await);

        let first = opening.await.unwrap().unwrap();
        let second = reg.acquire("t1", "d1").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(reg.open_count().await, 1);
    }

    #[tokio::test]
    async fn open_racing_a_newer_slot_shares_it() {
        let connector = Arc::new(CountingConnector::new(Duration::from_millis(100)));
        let reg = Arc::new(registry(directory().await, Arc::clone(&connector)));

        let spawn_acquire = |reg: Arc<TenantConnectionRegistry>| {
            tokio::spawn(async move { reg.acquire("t1", "d1").await })
        };
        let early = spawn_acquire(Arc::clone(&reg));
        tokio::time::sleep(Duration::from_millis(20)).await;
        reg.release("d1").await;
        let late = spawn_acquire(Arc::clone(&reg));

        let early = early.await.unwrap().unwrap();
        let late = late.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&early, &late));
        assert_eq!(reg.open_count().await, 1);
    }

    #[tokio::test]
    async fn local_connector_opens_named_file() {
        let dir = tempfile::tempdir().unwrap();
        let connector = LocalConnector::new(dir.path());
        let detail = DetailInfo {
            id: "d1".into(),
            tenant_id: "t1".into(),
            store_name: "../acme main".into(),
            tax_id: None,
        };
        let store = connector.connect(&detail).await.unwrap();
        assert_eq!(store.detail_id(), "d1");
        assert!(dir.path().join("acmemain.db").exists());
    }
}
