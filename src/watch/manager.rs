//! Watch lifecycle: link, renew, unlink.
//!
//! States: unlinked → active → (renewing) → active | expired | error.
//! Renewal failures park the watch in `error` with the captured message and
//! leave retrying to the next scheduled run.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{ConfigError, WatchError};
use crate::provider::{Credentials, MailboxProvider};
use crate::store::{SystemStore, Watch, WatchStatus};

/// Public view of a watch. Tokens are never exposed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchView {
    pub mailbox: String,
    pub history_cursor: u64,
    pub expiration: DateTime<Utc>,
    pub topic: String,
    pub status: WatchStatus,
    pub last_error: Option<String>,
    pub is_expired: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WatchView {
    pub fn new(watch: &Watch, now: DateTime<Utc>) -> Self {
        Self {
            mailbox: watch.mailbox.clone(),
            history_cursor: watch.history_cursor,
            expiration: watch.expiration,
            topic: watch.topic.clone(),
            status: watch.status,
            last_error: watch.last_error.clone(),
            is_expired: watch.is_expired(now),
            created_at: watch.created_at,
            updated_at: watch.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewalFailure {
    pub mailbox: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewalReport {
    pub renewed: Vec<String>,
    pub failed: Vec<RenewalFailure>,
}

pub struct WatchManager {
    store: Arc<dyn SystemStore>,
    provider: Arc<dyn MailboxProvider>,
    topic: String,
}

impl WatchManager {
    pub fn new(
        store: Arc<dyn SystemStore>,
        provider: Arc<dyn MailboxProvider>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            store,
            provider,
            topic: topic.into(),
        }
    }

    /// Subscribe the mailbox the credentials belong to. Re-linking updates
    /// the existing watch; its cursor never moves backwards.
    pub async fn link(&self, credentials: Credentials) -> Result<Watch, WatchError> {
        let profile = self.provider.profile(&credentials).await?;
        let mailbox = profile.email_address.to_lowercase();
        let response = self.provider.watch(&credentials, &self.topic).await?;

        let now = Utc::now();
        let watch = Watch {
            mailbox: mailbox.clone(),
            history_cursor: response.history_cursor,
            expiration: response.expiration,
            topic: self.topic.clone(),
            access_token: credentials.access_token,
            refresh_token: credentials.refresh_token,
            status: WatchStatus::Active,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.store.upsert_watch(&watch).await?;

        let stored = self
            .store
            .get_watch(&mailbox)
            .await?
            .ok_or_else(|| WatchError::NotFound(mailbox.clone()))?;
        info!(
            mailbox = %mailbox,
            cursor = stored.history_cursor,
            expiration = %stored.expiration,
            "Mailbox linked"
        );
        Ok(stored)
    }

    /// Re-establish every active watch expiring within `threshold`. The
    /// history cursor is left untouched.
    pub async fn renew_before(&self, threshold: Duration) -> Result<RenewalReport, WatchError> {
        let window = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        let deadline = Utc::now()
            .checked_add_signed(window)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let due = self.store.watches_expiring_before(deadline).await?;

        let mut report = RenewalReport::default();
        for watch in due {
            match self.renew_one(&watch).await {
                Ok(expiration) => {
                    info!(mailbox = %watch.mailbox, expiration = %expiration, "Watch renewed");
                    report.renewed.push(watch.mailbox);
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(mailbox = %watch.mailbox, error = %message, "Watch renewal failed");
                    if let Err(mark) = self
                        .store
                        .set_watch_status(&watch.mailbox, WatchStatus::Error, Some(&message))
                        .await
                    {
                        error!(mailbox = %watch.mailbox, error = %mark, "Failed to record renewal error");
                    }
                    report.failed.push(RenewalFailure {
                        mailbox: watch.mailbox,
                        error: message,
                    });
                }
            }
        }
        Ok(report)
    }

    async fn renew_one(&self, watch: &Watch) -> Result<DateTime<Utc>, WatchError> {
        let response = self
            .provider
            .watch(&Credentials::from(watch), &watch.topic)
            .await?;
        self.store
            .renew_watch(&watch.mailbox, response.expiration)
            .await?;
        Ok(response.expiration)
    }

    /// Stop the remote subscription and mark the watch expired. The watch is
    /// marked even when the remote stop fails; that error is still returned.
    pub async fn unlink(&self, mailbox: &str) -> Result<(), WatchError> {
        let mailbox = mailbox.to_lowercase();
        let watch = self
            .store
            .get_watch(&mailbox)
            .await?
            .ok_or_else(|| WatchError::NotFound(mailbox.clone()))?;

        let stopped = self.provider.stop(&Credentials::from(&watch)).await;
        let stop_error = stopped.as_ref().err().map(|e| e.to_string());
        self.store
            .set_watch_status(&mailbox, WatchStatus::Expired, stop_error.as_deref())
            .await?;

        match stopped {
            Ok(()) => {
                info!(mailbox = %mailbox, "Mailbox unlinked");
                Ok(())
            }
            Err(e) => {
                warn!(mailbox = %mailbox, error = %e, "Remote stop failed, watch marked expired");
                Err(e.into())
            }
        }
    }

    pub async fn status(&self, mailbox: &str) -> Result<Watch, WatchError> {
        let mailbox = mailbox.to_lowercase();
        self.store
            .get_watch(&mailbox)
            .await?
            .ok_or(WatchError::NotFound(mailbox))
    }

    pub async fn list(&self) -> Result<Vec<Watch>, WatchError> {
        Ok(self.store.list_watches().await?)
    }
}

/// Run `renew_before(threshold)` on a cron schedule.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop after the
/// current wait.
pub fn spawn_renewal_ticker(
    manager: Arc<WatchManager>,
    schedule: &str,
    threshold: Duration,
) -> Result<(JoinHandle<()>, Arc<AtomicBool>), ConfigError> {
    let schedule = cron::Schedule::from_str(schedule).map_err(|e| ConfigError::InvalidValue {
        key: "BANKMAIL_RENEW_CRON".into(),
        message: e.to_string(),
    })?;
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(threshold_secs = threshold.as_secs(), "Watch renewal ticker started");
        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                warn!("Renewal schedule has no upcoming fire time, stopping");
                return;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Watch renewal ticker shutting down");
                return;
            }

            match manager.renew_before(threshold).await {
                Ok(report) if report.renewed.is_empty() && report.failed.is_empty() => {}
                Ok(report) => info!(
                    renewed = report.renewed.len(),
                    failed = report.failed.len(),
                    "Watch renewal run finished"
                ),
                Err(e) => error!(error = %e, "Watch renewal run failed"),
            }
        }
    });

    Ok((handle, shutdown_flag))
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Duration as ChronoDuration;
    use secrecy::SecretString;

    use crate::provider::testing::{FakeMailbox, credentials};
    use crate::store::LibSqlBackend;

    async fn setup(latest: u64) -> (WatchManager, Arc<LibSqlBackend>, Arc<FakeMailbox>) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let mailbox = Arc::new(FakeMailbox::new("caja@acme.pe", latest));
        let manager = WatchManager::new(db.clone(), mailbox.clone(), "projects/p/topics/mail");
        (manager, db, mailbox)
    }

    fn watch(mailbox: &str, cursor: u64, expires_in: ChronoDuration) -> Watch {
        let now = Utc::now();
        Watch {
            mailbox: mailbox.into(),
            history_cursor: cursor,
            expiration: now + expires_in,
            topic: "projects/p/topics/mail".into(),
            access_token: SecretString::from("token".to_string()),
            refresh_token: None,
            status: WatchStatus::Active,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn link_sets_initial_cursor() {
        let (manager, _db, _mailbox) = setup(480).await;
        let watch = manager.link(credentials()).await.unwrap();
        assert_eq!(watch.mailbox, "caja@acme.pe");
        assert_eq!(watch.history_cursor, 480);
        assert_eq!(watch.status, WatchStatus::Active);
        assert!(!watch.is_expired(Utc::now()));
    }

    #[tokio::test]
    async fn relink_keeps_row_and_greater_cursor() {
        let (manager, db, mailbox) = setup(480).await;
        manager.link(credentials()).await.unwrap();
        db.advance_cursor("caja@acme.pe", 520).await.unwrap();

        mailbox.set_latest(500);
        let watch = manager.link(credentials()).await.unwrap();
        assert_eq!(watch.history_cursor, 520);
        assert_eq!(db.list_watches().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn link_failure_surfaces_provider_error() {
        let (manager, db, mailbox) = setup(480).await;
        mailbox.fail_watch.store(true, Ordering::SeqCst);
        let err = manager.link(credentials()).await.unwrap_err();
        assert!(matches!(err, WatchError::Provider(_)));
        assert!(db.list_watches().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn renew_only_expiring_and_keep_cursor() {
        let (manager, db, mailbox) = setup(900).await;
        db.upsert_watch(&watch("soon@acme.pe", 480, ChronoDuration::hours(2)))
            .await
            .unwrap();
        db.upsert_watch(&watch("later@acme.pe", 480, ChronoDuration::days(5)))
            .await
            .unwrap();

        let report = manager
            .renew_before(Duration::from_secs(86_400))
            .await
            .unwrap();
        assert_eq!(report.renewed, vec!["soon@acme.pe".to_string()]);
        assert!(report.failed.is_empty());
        assert_eq!(mailbox.watch_calls.load(Ordering::SeqCst), 1);

        let renewed = db.get_watch("soon@acme.pe").await.unwrap().unwrap();
        assert_eq!(renewed.history_cursor, 480);
        assert!(renewed.expiration > Utc::now() + ChronoDuration::days(6));
    }

    #[tokio::test]
    async fn renew_failure_marks_error() {
        let (manager, db, mailbox) = setup(480).await;
        db.upsert_watch(&watch("soon@acme.pe", 480, ChronoDuration::hours(1)))
            .await
            .unwrap();
        mailbox.fail_watch.store(true, Ordering::SeqCst);

        let report = manager
            .renew_before(Duration::from_secs(86_400))
            .await
            .unwrap();
        assert_eq!(report.failed.len(), 1);

        let stored = db.get_watch("soon@acme.pe").await.unwrap().unwrap();
        assert_eq!(stored.status, WatchStatus::Error);
        assert!(stored.last_error.unwrap().contains("watch refused"));

        // Only active watches are renewal candidates; re-link to recover.
        let again = manager
            .renew_before(Duration::from_secs(86_400))
            .await
            .unwrap();
        assert!(again.failed.is_empty());
    }

    #[tokio::test]
    async fn store_failure_on_one_watch_does_not_stop_renewal() {
        let (manager, db, _mailbox) = setup(480).await;
        for name in ["a@acme.pe", "bad@acme.pe", "c@acme.pe"] {
            db.upsert_watch(&watch(name, 480, ChronoDuration::hours(1)))
                .await
                .unwrap();
        }
        db.conn()
            .execute_batch(
                "CREATE TRIGGER reject_bad_renewal BEFORE UPDATE OF expiration ON watches \
                 WHEN OLD.mailbox = 'bad@acme.pe' \
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .await
            .unwrap();

        let report = manager
            .renew_before(Duration::from_secs(86_400))
            .await
            .unwrap();
        let mut renewed = report.renewed.clone();
        renewed.sort();
        assert_eq!(renewed, vec!["a@acme.pe".to_string(), "c@acme.pe".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].mailbox, "bad@acme.pe");

        let bad = db.get_watch("bad@acme.pe").await.unwrap().unwrap();
        assert_eq!(bad.status, WatchStatus::Error);
        assert!(bad.last_error.unwrap().contains("disk full"));
    }

    #[tokio::test]
    async fn unlink_marks_expired_even_if_stop_fails() {
        let (manager, db, mailbox) = setup(480).await;
        manager.link(credentials()).await.unwrap();
        mailbox.fail_stop.store(true, Ordering::SeqCst);

        let err = manager.unlink("Caja@Acme.pe").await.unwrap_err();
        assert!(matches!(err, WatchError::Provider(_)));
        let stored = db.get_watch("caja@acme.pe").await.unwrap().unwrap();
        assert_eq!(stored.status, WatchStatus::Expired);
        assert!(stored.last_error.is_some());

        assert!(matches!(
            manager.unlink("nobody@acme.pe").await,
            Err(WatchError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn invalid_schedule_rejected() {
        let (manager, _db, _mailbox) = setup(480).await;
        let result = spawn_renewal_ticker(Arc::new(manager), "not a cron", Duration::from_secs(1));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[tokio::test]
    async fn view_hides_tokens() {
        let w = watch("caja@acme.pe", 480, ChronoDuration::hours(-1));
        let json = serde_json::to_value(WatchView::new(&w, Utc::now())).unwrap();
        assert_eq!(json["isExpired"], true);
        assert_eq!(json["historyCursor"], 480);
        assert!(json.get("accessToken").is_none());
    }
}
