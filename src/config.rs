//! Configuration types.
//!
//! Everything is read from `BANKMAIL_*` environment variables. Missing
//! required values and unparseable numbers are startup errors.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default renewal schedule: top of every hour.
const DEFAULT_RENEW_CRON: &str = "0 0 * * * *";

/// Process-wide configuration.
#[derive(Debug)]
pub struct AppConfig {
    /// HTTP listen port.
    pub port: u16,
    /// Path of the shared system database.
    pub system_db: PathBuf,
    /// Directory holding one database file per tenant-detail.
    pub tenant_dir: PathBuf,
    /// Push topic the mailbox provider publishes changes to.
    pub pubsub_topic: String,
    /// Shared secret every push delivery must present.
    pub webhook_token: SecretString,
    /// External extraction service. Enrichment is skipped when unset.
    pub extract_url: Option<String>,
    pub provider_timeout: Duration,
    pub enrich_timeout: Duration,
    /// Upper bound on opening a tenant store.
    pub store_timeout: Duration,
    /// Number of background workers draining the push queue.
    pub workers: usize,
    pub queue_capacity: usize,
    /// Messages processed concurrently within one history page.
    pub message_concurrency: usize,
    /// Deliveries accepted per mailbox per minute.
    pub webhook_rate_limit: usize,
    pub renew_cron: String,
    /// Watches expiring within this window are renewed.
    pub renew_threshold: Duration,
    /// Optional directory for a daily-rolling log file.
    pub log_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let pubsub_topic = get("BANKMAIL_PUBSUB_TOPIC")
            .ok_or_else(|| ConfigError::MissingEnvVar("BANKMAIL_PUBSUB_TOPIC".into()))?;
        let webhook_token = get("BANKMAIL_WEBHOOK_TOKEN")
            .map(SecretString::from)
            .ok_or_else(|| ConfigError::MissingEnvVar("BANKMAIL_WEBHOOK_TOKEN".into()))?;

        let renew_cron = get("BANKMAIL_RENEW_CRON").unwrap_or_else(|| DEFAULT_RENEW_CRON.into());
        cron::Schedule::from_str(&renew_cron).map_err(|e| ConfigError::InvalidValue {
            key: "BANKMAIL_RENEW_CRON".into(),
            message: e.to_string(),
        })?;

        let workers: usize = parse_or(&get, "BANKMAIL_WORKERS", 4)?;
        let message_concurrency: usize = parse_or(&get, "BANKMAIL_MESSAGE_CONCURRENCY", 4)?;
        if workers == 0 || message_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "BANKMAIL_WORKERS".into(),
                message: "worker counts must be at least 1".into(),
            });
        }

        Ok(Self {
            port: parse_or(&get, "BANKMAIL_PORT", 8080)?,
            system_db: get("BANKMAIL_SYSTEM_DB")
                .unwrap_or_else(|| "./data/system.db".into())
                .into(),
            tenant_dir: get("BANKMAIL_TENANT_DIR")
                .unwrap_or_else(|| "./data/tenants".into())
                .into(),
            pubsub_topic,
            webhook_token,
            extract_url: get("BANKMAIL_EXTRACT_URL"),
            provider_timeout: Duration::from_secs(parse_or(&get, "BANKMAIL_PROVIDER_TIMEOUT_SECS", 15)?),
            enrich_timeout: Duration::from_secs(parse_or(&get, "BANKMAIL_ENRICH_TIMEOUT_SECS", 20)?),
            store_timeout: Duration::from_secs(parse_or(&get, "BANKMAIL_STORE_TIMEOUT_SECS", 5)?),
            workers,
            queue_capacity: parse_or(&get, "BANKMAIL_QUEUE_CAPACITY", 256)?,
            message_concurrency,
            webhook_rate_limit: parse_or(&get, "BANKMAIL_WEBHOOK_RATE_LIMIT", 100)?,
            renew_cron,
            renew_threshold: Duration::from_secs(parse_or(
                &get,
                "BANKMAIL_RENEW_THRESHOLD_SECS",
                86_400,
            )?),
            log_dir: get("BANKMAIL_LOG_DIR").map(PathBuf::from),
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const REQUIRED: [(&str, &str); 2] = [
        ("BANKMAIL_PUBSUB_TOPIC", "projects/p/topics/mail"),
        ("BANKMAIL_WEBHOOK_TOKEN", "s3cret"),
    ];

    #[test]
    fn defaults_applied() {
        let config = AppConfig::from_lookup(lookup(&REQUIRED)).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.workers, 4);
        assert_eq!(config.webhook_rate_limit, 100);
        assert_eq!(config.renew_threshold, Duration::from_secs(86_400));
        assert_eq!(config.webhook_token.expose_secret(), "s3cret");
        assert!(config.extract_url.is_none());
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn missing_topic_is_fatal() {
        let err = AppConfig::from_lookup(lookup(&[("BANKMAIL_WEBHOOK_TOKEN", "x")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "BANKMAIL_PUBSUB_TOPIC"));
    }

    #[test]
    fn blank_token_counts_as_missing() {
        let err = AppConfig::from_lookup(lookup(&[
            ("BANKMAIL_PUBSUB_TOPIC", "t"),
            ("BANKMAIL_WEBHOOK_TOKEN", "  "),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "BANKMAIL_WEBHOOK_TOKEN"));
    }

    #[test]
    fn invalid_number_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("BANKMAIL_PORT", "eighty"));
        let err = AppConfig::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "BANKMAIL_PORT"));
    }

    #[test]
    fn invalid_cron_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("BANKMAIL_RENEW_CRON", "every hour"));
        assert!(AppConfig::from_lookup(lookup(&pairs)).is_err());
    }

    #[test]
    fn overrides_read() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("BANKMAIL_EXTRACT_URL", "http://localhost:9000/extract"));
        pairs.push(("BANKMAIL_WORKERS", "8"));
        let config = AppConfig::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.extract_url.as_deref(), Some("http://localhost:9000/extract"));
    }
}
