//! Entity routing: resolve a sender address to {entity, bank, account}
//! through declarative forwarding rules.
//!
//! Every failure on the lookup path (no address, no rule, no account, store
//! unreachable) degrades to an unmatched result.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ForwardingError;
use crate::pipeline::types::Routing;
use crate::store::{ForwardingRule, SystemStore};
use crate::tenant::TenantDirectory;

/// Bank name used when an account has none recorded.
pub const UNKNOWN_BANK: &str = "UNKNOWN";

/// Outcome of matching one sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub entity_id: Option<String>,
    pub bank: Option<String>,
    pub account_number: Option<String>,
    pub matched: bool,
}

impl MatchResult {
    pub fn unmatched() -> Self {
        Self {
            entity_id: None,
            bank: None,
            account_number: None,
            matched: false,
        }
    }

    /// Routing for a matched result.
    pub fn routing(&self) -> Option<Routing> {
        if !self.matched {
            return None;
        }
        Some(Routing {
            entity_id: self.entity_id.clone()?,
            bank: self.bank.clone().unwrap_or_else(|| UNKNOWN_BANK.into()),
            account_number: self.account_number.clone().unwrap_or_default(),
        })
    }
}

/// Bare address from `Display Name <addr>`, or the whole trimmed string when
/// it contains `@`.
pub fn extract_address(from: &str) -> Option<String> {
    if let Some(start) = from.find('<') {
        if let Some(len) = from[start + 1..].find('>') {
            let inner = from[start + 1..start + 1 + len].trim();
            if !inner.is_empty() {
                return Some(inner.to_string());
            }
        }
    }
    let trimmed = from.trim();
    if trimmed.contains('@') {
        return Some(trimmed.to_string());
    }
    None
}

/// Resolves senders to owning entities.
pub struct EntityRouter {
    store: Arc<dyn SystemStore>,
    directory: Arc<dyn TenantDirectory>,
}

impl EntityRouter {
    pub fn new(store: Arc<dyn SystemStore>, directory: Arc<dyn TenantDirectory>) -> Self {
        Self { store, directory }
    }

    /// Match a sender against active forwarding rules.
    pub async fn match_sender(&self, from: &str, subject: &str) -> MatchResult {
        let Some(address) = extract_address(from) else {
            debug!(from = from, "No address in sender");
            return MatchResult::unmatched();
        };

        let rule = match self.store.find_forwarding_rule(&address).await {
            Ok(Some(rule)) => rule,
            Ok(None) => {
                debug!(address = %address, subject = subject, "No forwarding rule for sender");
                return MatchResult::unmatched();
            }
            Err(e) => {
                warn!(address = %address, error = %e, "Forwarding lookup failed");
                return MatchResult::unmatched();
            }
        };

        let Some(account_id) = rule.account_ids.first() else {
            debug!(address = %address, "Forwarding rule has no accounts");
            return MatchResult::unmatched();
        };

        match self.account_routing(&rule.entity_id, account_id).await {
            Some(routing) => {
                debug!(
                    address = %address,
                    entity_id = %routing.entity_id,
                    bank = %routing.bank,
                    "Sender matched"
                );
                MatchResult {
                    entity_id: Some(routing.entity_id),
                    bank: Some(routing.bank),
                    account_number: Some(routing.account_number),
                    matched: true,
                }
            }
            None => MatchResult::unmatched(),
        }
    }

    /// Routing for one account of an entity. `None` when the account is
    /// missing, belongs elsewhere, or the lookup fails.
    pub async fn account_routing(&self, entity_id: &str, account_id: &str) -> Option<Routing> {
        match self.directory.lookup_account(account_id).await {
            Ok(Some(account)) if account.detail_id == entity_id => Some(Routing {
                entity_id: entity_id.to_string(),
                bank: account
                    .bank_name
                    .filter(|b| !b.trim().is_empty())
                    .unwrap_or_else(|| UNKNOWN_BANK.into()),
                account_number: account.account_number.unwrap_or_default(),
            }),
            Ok(Some(account)) => {
                warn!(
                    account_id = account_id,
                    entity_id = entity_id,
                    owner = %account.detail_id,
                    "Account belongs to a different entity"
                );
                None
            }
            Ok(None) => {
                debug!(account_id = account_id, "Account not found");
                None
            }
            Err(e) => {
                warn!(account_id = account_id, error = %e, "Account lookup failed");
                None
            }
        }
    }
}

/// Incoming rule before normalization.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleInput {
    pub email: String,
    #[serde(default)]
    pub account_ids: Vec<String>,
}

/// Lowercase and trim sender addresses; reject malformed, duplicate, or
/// account-less rules.
pub fn normalize_rules(
    entity_id: &str,
    input: &[RuleInput],
) -> Result<Vec<ForwardingRule>, ForwardingError> {
    let mut seen = HashSet::new();
    let mut rules = Vec::with_capacity(input.len());
    for rule in input {
        let email = rule.email.trim().to_lowercase();
        if email.is_empty() || !email.contains('@') || email.contains(char::is_whitespace) {
            return Err(ForwardingError::InvalidEmail(rule.email.clone()));
        }
        if !seen.insert(email.clone()) {
            return Err(ForwardingError::DuplicateEmail(email));
        }
        let account_ids: Vec<String> = rule
            .account_ids
            .iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();
        if account_ids.is_empty() {
            return Err(ForwardingError::NoAccounts(email));
        }
        rules.push(ForwardingRule {
            entity_id: entity_id.to_string(),
            email,
            account_ids,
        });
    }
    Ok(rules)
}
