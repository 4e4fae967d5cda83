//! Per-message pipeline: fetch, decode, route, parse, enrich, persist.
//!
//! Routing and parse misses are recorded on the record, never raised.
//! Enrichment failure leaves the record unenriched. A duplicate provider
//! message id, whether caught up front or by the insert, is
//! `ProcessOutcome::AlreadyProcessed`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::enrichment::Enricher;
use crate::error::PipelineError;
use crate::parser;
use crate::pipeline::types::{
    MessageTask, ProcessOutcome, ROUTING_MISS, RawEmailRecord, Routing,
};
use crate::provider::{Credentials, MailboxProvider, parse_headers, walk_parts};
use crate::routing::EntityRouter;
use crate::store::SystemStore;

pub struct MessagePipeline {
    store: Arc<dyn SystemStore>,
    provider: Arc<dyn MailboxProvider>,
    router: Arc<EntityRouter>,
    enricher: Option<Arc<dyn Enricher>>,
}

impl MessagePipeline {
    pub fn new(
        store: Arc<dyn SystemStore>,
        provider: Arc<dyn MailboxProvider>,
        router: Arc<EntityRouter>,
        enricher: Option<Arc<dyn Enricher>>,
    ) -> Self {
        Self {
            store,
            provider,
            router,
            enricher,
        }
    }

    pub fn store(&self) -> &Arc<dyn SystemStore> {
        &self.store
    }

    pub fn provider(&self) -> &Arc<dyn MailboxProvider> {
        &self.provider
    }

    pub fn router(&self) -> &Arc<EntityRouter> {
        &self.router
    }

    /// Capture one message. `forced` routing (backfill) bypasses the router.
    pub async fn process(
        &self,
        credentials: &Credentials,
        task: &MessageTask,
        forced: Option<&Routing>,
    ) -> Result<ProcessOutcome, PipelineError> {
        if self.store.raw_email_exists(&task.message_id).await? {
            debug!(message_id = %task.message_id, "Message already captured");
            return Ok(ProcessOutcome::AlreadyProcessed);
        }

        let message = self
            .provider
            .get_message(credentials, &task.message_id)
            .await?;

        let (headers, content) = match &message.payload {
            Some(payload) => (parse_headers(&payload.headers), walk_parts(payload)),
            None => (BTreeMap::new(), Default::default()),
        };
        let header = |name: &str| headers.get(name).cloned().unwrap_or_default();
        let sender = header("from");
        let subject = header("subject");
        let received_at = received_at(headers.get("date"), message.internal_date);

        let (routing, error) = match forced {
            Some(routing) => (Some(routing.clone()), None),
            None => match self.router.match_sender(&sender, &subject).await.routing() {
                Some(routing) => (Some(routing), None),
                None => {
                    warn!(message_id = %task.message_id, sender = %sender, "Routing miss");
                    (None, Some(ROUTING_MISS.to_string()))
                }
            },
        };

        let parsed = parser::parse_email(
            content.text.as_deref(),
            content.html.as_deref(),
            &subject,
            &sender,
        );

        let mut record = RawEmailRecord {
            id: uuid::Uuid::new_v4().to_string(),
            provider_message_id: task.message_id.clone(),
            thread_id: if task.thread_id.is_empty() {
                message.thread_id.clone()
            } else {
                task.thread_id.clone()
            },
            history_cursor: task.history_cursor,
            message_id: headers.get("message-id").cloned(),
            sender,
            subject,
            received_at,
            headers: headers.clone(),
            text_body: content.text,
            html_body: content.html,
            labels: message.label_ids,
            attachments: content.attachments,
            routing,
            parsed,
            transaction_variables: None,
            transaction_type: None,
            enriched: false,
            processed: false,
            processed_at: None,
            error,
            created_at: Utc::now(),
        };

        self.enrich(&mut record).await;

        if !self.store.insert_raw_email(&record).await? {
            debug!(message_id = %task.message_id, "Lost insert race, already captured");
            return Ok(ProcessOutcome::AlreadyProcessed);
        }

        let routed = record.routing.is_some();
        info!(
            message_id = %task.message_id,
            record_id = %record.id,
            routed,
            parsed = record.parsed.is_some(),
            enriched = record.enriched,
            "Raw email captured"
        );
        Ok(ProcessOutcome::Stored {
            record_id: record.id,
            routed,
        })
    }

    async fn enrich(&self, record: &mut RawEmailRecord) {
        let Some(enricher) = &self.enricher else {
            return;
        };
        let Some(html) = record.html_body.as_deref() else {
            debug!(message_id = %record.provider_message_id, "No HTML part to enrich");
            return;
        };

        match enricher.enrich(html).await {
            Ok(result) => {
                record.transaction_variables = result.transaction_variables;
                record.transaction_type = result.transaction_type;
                record.enriched = true;
            }
            Err(e) => {
                warn!(
                    message_id = %record.provider_message_id,
                    error = %e,
                    "Enrichment failed, storing unenriched"
                );
            }
        }
    }
}

/// `Date` header, else the provider's receive time, else now.
fn received_at(date_header: Option<&String>, internal: Option<DateTime<Utc>>) -> DateTime<Utc> {
    date_header
        .and_then(|d| DateTime::parse_from_rfc2822(d.trim()).ok())
        .map(|d| d.with_timezone(&Utc))
        .or(internal)
        .unwrap_or_else(Utc::now)
}
