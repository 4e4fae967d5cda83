//! Manual backfill: search a mailbox for one sender's messages and run them
//! through the pipeline with forced routing.

use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::BackfillError;
use crate::pipeline::processor::MessagePipeline;
use crate::pipeline::types::{MessageTask, ProcessOutcome};
use crate::provider::{Credentials, MessageRef};

/// Backfill parameters. Defaults: the first configured sender, any active
/// mailbox, no message cap.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackfillRequest {
    pub sender: Option<String>,
    pub mailbox: Option<String>,
    pub max_messages: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillFailure {
    pub message_id: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillReport {
    pub entity_id: String,
    pub sender: String,
    pub mailbox: String,
    pub total: usize,
    pub stored: usize,
    pub already_processed: usize,
    pub failed: usize,
    pub failures: Vec<BackfillFailure>,
}

pub struct Backfill {
    pipeline: Arc<MessagePipeline>,
    concurrency: usize,
}

impl Backfill {
    pub fn new(pipeline: Arc<MessagePipeline>, concurrency: usize) -> Self {
        Self {
            pipeline,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn run(
        &self,
        entity_id: &str,
        request: &BackfillRequest,
    ) -> Result<BackfillReport, BackfillError> {
        let store = self.pipeline.store();

        let config = store
            .get_forwarding(entity_id)
            .await?
            .filter(|c| c.active && !c.rules.is_empty())
            .ok_or_else(|| BackfillError::NoForwarding(entity_id.to_string()))?;

        let rule = match request.sender.as_deref().map(|s| s.trim().to_lowercase()) {
            Some(sender) => config
                .rules
                .iter()
                .find(|r| r.email == sender)
                .ok_or_else(|| BackfillError::UnknownSender {
                    entity_id: entity_id.to_string(),
                    sender,
                })?,
            None => &config.rules[0],
        };

        let account_id = rule
            .account_ids
            .first()
            .ok_or_else(|| BackfillError::NoAccount(entity_id.to_string()))?;
        let forced = self
            .pipeline
            .router()
            .account_routing(entity_id, account_id)
            .await
            .ok_or_else(|| BackfillError::NoAccount(entity_id.to_string()))?;

        let watch = match request.mailbox.as_deref() {
            Some(mailbox) => store.get_watch(&mailbox.to_lowercase()).await?,
            None => store.any_active_watch().await?,
        }
        .ok_or(BackfillError::NoWatch)?;
        let credentials = Credentials::from(&watch);

        let refs = self
            .search(&credentials, &rule.email, request.max_messages)
            .await?;
        info!(
            entity_id,
            sender = %rule.email,
            mailbox = %watch.mailbox,
            found = refs.len(),
            "Backfill started"
        );

        let mut report = BackfillReport {
            entity_id: entity_id.to_string(),
            sender: rule.email.clone(),
            mailbox: watch.mailbox.clone(),
            total: refs.len(),
            stored: 0,
            already_processed: 0,
            failed: 0,
            failures: Vec::new(),
        };

        let cursor = watch.history_cursor;
        let results: Vec<_> = futures::stream::iter(refs)
            .map(|m| {
                let credentials = &credentials;
                let forced = &forced;
                async move {
                    let task = MessageTask {
                        message_id: m.id,
                        thread_id: m.thread_id,
                        history_cursor: cursor,
                    };
                    let outcome = self
                        .pipeline
                        .process(credentials, &task, Some(forced))
                        .await;
                    (task.message_id, outcome)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (message_id, outcome) in results {
            match outcome {
                Ok(ProcessOutcome::Stored { .. }) => report.stored += 1,
                Ok(ProcessOutcome::AlreadyProcessed) => report.already_processed += 1,
                Err(e) => {
                    warn!(message_id = %message_id, error = %e, "Backfill message failed");
                    report.failed += 1;
                    report.failures.push(BackfillFailure {
                        message_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            entity_id,
            stored = report.stored,
            already_processed = report.already_processed,
            failed = report.failed,
            "Backfill finished"
        );
        Ok(report)
    }

    async fn search(
        &self,
        credentials: &Credentials,
        sender: &str,
        limit: Option<usize>,
    ) -> Result<Vec<MessageRef>, BackfillError> {
        let query = format!("from:{sender}");
        let mut found = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let page = self
                .pipeline
                .provider()
                .search_messages(credentials, &query, page_token.as_deref())
                .await?;
            found.extend(page.messages);

            if let Some(limit) = limit {
                if found.len() >= limit {
                    found.truncate(limit);
                    break;
                }
            }
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{Duration, Utc};
    use secrecy::SecretString;

    use crate::provider::testing::FakeMailbox;
    use crate::routing::EntityRouter;
    use crate::store::{ForwardingRule, LibSqlBackend, SystemStore, Watch, WatchStatus};

    async fn setup(mailbox: Arc<FakeMailbox>) -> (Backfill, Arc<LibSqlBackend>) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db.register_tenant("t1", "Acme").await.unwrap();
        db.register_detail("d1", "t1", "acme", None).await.unwrap();
        db.register_account("acc-1", "d1", Some("Interbank"), Some("200-3001"))
            .await
            .unwrap();
        db.replace_forwarding(
            "d1",
            true,
            &[
                ForwardingRule {
                    entity_id: "d1".into(),
                    email: "servicioalcliente@netinterbank.com.pe".into(),
                    account_ids: vec!["acc-1".into()],
                },
                ForwardingRule {
                    entity_id: "d1".into(),
                    email: "otro@bank.pe".into(),
                    account_ids: vec!["acc-1".into()],
                },
            ],
        )
        .await
        .unwrap();

        let now = Utc::now();
        db.upsert_watch(&Watch {
            mailbox: "caja@acme.pe".into(),
            history_cursor: 480,
            expiration: now + Duration::days(5),
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
        let pipeline = Arc::new(MessagePipeline::new(db.clone(), mailbox, router, None));
        (Backfill::new(pipeline, 2), db)
    }

    #[tokio::test]
    async fn forced_routing_for_every_message() {
        let mailbox = Arc::new(FakeMailbox::new("caja@acme.pe", 480).with_page_size(2));
        for i in 0..5 {
            mailbox.deliver(
                &format!("ib-{i}"),
                "Interbank <servicioalcliente@netinterbank.com.pe>",
                "Constancia",
                "Monto Total: S/ 10.00",
                400 + i,
            );
        }
        mailbox.deliver("other", "pepito@zapatero.com", "x", "y", 410);

        let (backfill, db) = setup(mailbox).await;
        let report = backfill.run("d1", &BackfillRequest::default()).await.unwrap();
        assert_eq!(report.total, 5);
        assert_eq!(report.stored, 5);
        assert_eq!(report.failed, 0);
        assert_eq!(report.sender, "servicioalcliente@netinterbank.com.pe");

        let record = db.get_raw_email("ib-3").await.unwrap().unwrap();
        let routing = record.routing.unwrap();
        assert_eq!(routing.bank, "Interbank");
        assert_eq!(routing.account_number, "200-3001");
        assert_eq!(record.history_cursor, 480);
        assert!(db.get_raw_email("other").await.unwrap().is_none());

        let again = backfill.run("d1", &BackfillRequest::default()).await.unwrap();
        assert_eq!(again.stored, 0);
        assert_eq!(again.already_processed, 5);
    }

    #[tokio::test]
    async fn message_cap_and_sender_filter() {
        let mailbox = Arc::new(FakeMailbox::new("caja@acme.pe", 480).with_page_size(2));
        for i in 0..4 {
            mailbox.deliver(&format!("o-{i}"), "otro@bank.pe", "x", "S/ 1.00", 400 + i);
        }
        let (backfill, _db) = setup(mailbox).await;
        let request = BackfillRequest {
            sender: Some("OTRO@bank.pe".into()),
            mailbox: None,
            max_messages: Some(3),
        };
        let report = backfill.run("d1", &request).await.unwrap();
        assert_eq!(report.sender, "otro@bank.pe");
        assert_eq!(report.total, 3);
    }

    #[tokio::test]
    async fn unknown_entity_or_sender() {
        let mailbox = Arc::new(FakeMailbox::new("caja@acme.pe", 480));
        let (backfill, _db) = setup(mailbox).await;
        assert!(matches!(
            backfill.run("nope", &BackfillRequest::default()).await,
            Err(BackfillError::NoForwarding(_))
        ));
        let request = BackfillRequest {
            sender: Some("stranger@x.pe".into()),
            ..Default::default()
        };
        assert!(matches!(
            backfill.run("d1", &request).await,
            Err(BackfillError::UnknownSender { .. })
        ));
    }

    #[tokio::test]
    async fn no_watch() {
        let mailbox = Arc::new(FakeMailbox::new("caja@acme.pe", 480));
        let (backfill, _db) = setup(mailbox).await;
        let request = BackfillRequest {
            mailbox: Some("someone@else.pe".into()),
            ..Default::default()
        };
        assert!(matches!(
            backfill.run("d1", &request).await,
            Err(BackfillError::NoWatch)
        ));
    }
}
