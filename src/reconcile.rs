//! Reconciliation: merge captured raw emails into the tenant's canonical
//! transaction records, matching against the secondary capture source by
//! message identity.
//!
//! Re-running is safe: only unprocessed raw emails are visited, the upsert is
//! keyed by message identity, and a matched record is never downgraded.
//! A record that fails stays unprocessed and is retried on the next run.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{DatabaseError, ReconcileError};
use crate::parser::{DEFAULT_DESCRIPTION, build_description, known};
use crate::pipeline::types::RawEmailRecord;
use crate::store::{SecondaryRawRecord, SystemStore, TenantStore, TransactionRecord};
use crate::tenant::{TenantConnectionRegistry, TenantDirectory};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileFailure {
    pub message_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub processed: usize,
    pub matched: usize,
    pub not_matched: usize,
    pub failed: usize,
    pub failures: Vec<ReconcileFailure>,
}

pub struct Reconciler {
    store: Arc<dyn SystemStore>,
    directory: Arc<dyn TenantDirectory>,
    registry: Arc<TenantConnectionRegistry>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn SystemStore>,
        directory: Arc<dyn TenantDirectory>,
        registry: Arc<TenantConnectionRegistry>,
    ) -> Self {
        Self {
            store,
            directory,
            registry,
        }
    }

    pub async fn reconcile(&self, entity_id: &str) -> Result<ReconcileReport, ReconcileError> {
        let detail = self
            .directory
            .lookup_detail(entity_id)
            .await?
            .ok_or_else(|| ReconcileError::UnknownEntity(entity_id.to_string()))?;
        let tenant = self.registry.acquire(&detail.tenant_id, &detail.id).await?;

        let pending = self.store.pending_raw_emails(entity_id).await?;
        let mut report = ReconcileReport::default();

        for raw in &pending {
            let identity = raw.message_identity();
            match self.reconcile_one(&tenant, raw, entity_id).await {
                Ok(matched) => {
                    debug!(entity_id, message_id = identity, matched, "Raw email reconciled");
                    report.processed += 1;
                    if matched {
                        report.matched += 1;
                    } else {
                        report.not_matched += 1;
                    }
                }
                Err(e) => {
                    warn!(entity_id, message_id = identity, error = %e, "Raw email not reconciled");
                    report.failed += 1;
                    report.failures.push(ReconcileFailure {
                        message_id: identity.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            entity_id,
            processed = report.processed,
            matched = report.matched,
            not_matched = report.not_matched,
            failed = report.failed,
            "Reconciliation finished"
        );
        Ok(report)
    }

    /// Upsert one raw email's transaction and mark it processed. Returns
    /// whether the secondary source had it.
    async fn reconcile_one(
        &self,
        tenant: &TenantStore,
        raw: &RawEmailRecord,
        entity_id: &str,
    ) -> Result<bool, DatabaseError> {
        let secondary = tenant.find_secondary(raw.message_identity()).await?;
        let record = transaction_from(raw, entity_id, secondary.as_ref());
        tenant.upsert_transaction(&record).await?;
        self.store.mark_raw_processed(&raw.id, record.processed_at).await?;
        Ok(secondary.is_some())
    }
}

/// Canonical record for one raw email. Enrichment values win over the local
/// parse when both are present.
fn transaction_from(
    raw: &RawEmailRecord,
    entity_id: &str,
    secondary: Option<&SecondaryRawRecord>,
) -> TransactionRecord {
    let now = Utc::now();
    let vars = raw.transaction_variables.as_ref();
    let parsed = raw.parsed.as_ref();

    let pick = |enriched: Option<&String>, local: Option<&String>| -> Option<String> {
        enriched
            .and_then(|v| known(v))
            .or_else(|| local.and_then(|v| known(v)))
            .map(str::to_string)
    };

    let amount_text = pick(
        vars.and_then(|v| v.amount.as_ref()),
        parsed.map(|p| &p.amount),
    );
    let description = match parsed {
        Some(p) => build_description(p),
        None => known(&raw.subject).unwrap_or(DEFAULT_DESCRIPTION).to_string(),
    };
    let (bank, account_number) = match &raw.routing {
        Some(r) => (r.bank.clone(), r.account_number.clone()),
        None => (String::new(), String::new()),
    };

    TransactionRecord {
        message_id: raw.message_identity().to_string(),
        system_raw_id: raw.id.clone(),
        secondary_raw_id: secondary.map(|s| s.id.clone()),
        entity_id: entity_id.to_string(),
        bank,
        account_number,
        sender: raw.sender.clone(),
        subject: raw.subject.clone(),
        received_at: raw.received_at,
        amount: amount_text.as_deref().and_then(parse_amount),
        amount_text,
        currency: pick(
            vars.and_then(|v| v.currency.as_ref()),
            parsed.map(|p| &p.currency),
        ),
        operation_number: pick(
            vars.and_then(|v| v.operation_number.as_ref()),
            parsed.map(|p| &p.operation_number),
        ),
        operation_date: pick(
            vars.and_then(|v| v.operation_date.as_ref()),
            parsed.map(|p| &p.operation_date),
        ),
        description,
        transaction_type: raw.transaction_type.clone(),
        transaction_variables: vars.and_then(|v| serde_json::to_string(v).ok()),
        match_status: secondary.is_some(),
        match_at: secondary.map(|_| now),
        processed_at: now,
    }
}

/// `"1,250.00"` → `1250.00`. Currency prefixes are not accepted.
fn parse_amount(text: &str) -> Option<Decimal> {
    text.trim().replace(',', "").parse().ok()
}
