use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;

use bankmail::api::{self, AppState, RateLimiter, WebhookGuard};
use bankmail::config::AppConfig;
use bankmail::enrichment::{Enricher, HttpEnricher};
use bankmail::pipeline::{Backfill, MessagePipeline};
use bankmail::provider::{GmailClient, MailboxProvider};
use bankmail::reconcile::Reconciler;
use bankmail::routing::EntityRouter;
use bankmail::store::{LibSqlBackend, SystemStore};
use bankmail::tenant::{LocalConnector, TenantConnectionRegistry, TenantDirectory};
use bankmail::watch::{IngestQueue, PushIngestor, WatchManager, spawn_renewal_ticker};

/// Window for the per-mailbox webhook rate limit.
const RATE_WINDOW: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;
    // Keep the guard alive so the file writer flushes on exit.
    let _log_guard = setup_logging(config.log_dir.as_deref());

    eprintln!("bankmail v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   System DB: {}", config.system_db.display());
    eprintln!("   Tenant stores: {}", config.tenant_dir.display());
    eprintln!("   Topic: {}", config.pubsub_topic);
    eprintln!(
        "   Enrichment: {}",
        config.extract_url.as_deref().unwrap_or("disabled")
    );

    // ── Stores ──────────────────────────────────────────────────────────
    let db = Arc::new(
        LibSqlBackend::new_local(&config.system_db)
            .await
            .with_context(|| format!("opening {}", config.system_db.display()))?,
    );
    let store: Arc<dyn SystemStore> = db.clone();
    let directory: Arc<dyn TenantDirectory> = db.clone();

    std::fs::create_dir_all(&config.tenant_dir)
        .with_context(|| format!("creating {}", config.tenant_dir.display()))?;
    let registry = Arc::new(TenantConnectionRegistry::new(
        Arc::clone(&directory),
        Arc::new(LocalConnector::new(config.tenant_dir.clone())),
        config.store_timeout,
    ));

    // ── Provider and enrichment ─────────────────────────────────────────
    let provider: Arc<dyn MailboxProvider> = Arc::new(GmailClient::new(config.provider_timeout)?);
    let enricher: Option<Arc<dyn Enricher>> = match &config.extract_url {
        Some(url) => Some(Arc::new(HttpEnricher::new(url.clone(), config.enrich_timeout)?)),
        None => None,
    };

    // ── Pipeline and ingestion ──────────────────────────────────────────
    let router = Arc::new(EntityRouter::new(Arc::clone(&store), Arc::clone(&directory)));
    let pipeline = Arc::new(MessagePipeline::new(
        Arc::clone(&store),
        Arc::clone(&provider),
        Arc::clone(&router),
        enricher,
    ));
    let ingestor = Arc::new(PushIngestor::new(
        Arc::clone(&pipeline),
        config.message_concurrency,
    ));
    let ingest_shutdown = ingestor.shutdown_flag();
    let (queue, workers) =
        IngestQueue::start(Arc::clone(&ingestor), config.workers, config.queue_capacity);
    let queue = Arc::new(queue);

    // ── Watches ─────────────────────────────────────────────────────────
    let watches = Arc::new(WatchManager::new(
        Arc::clone(&store),
        Arc::clone(&provider),
        config.pubsub_topic.clone(),
    ));
    let (renewal, renewal_shutdown) =
        spawn_renewal_ticker(Arc::clone(&watches), &config.renew_cron, config.renew_threshold)?;
    eprintln!("   Renewal: {} (threshold {:?})", config.renew_cron, config.renew_threshold);

    // ── HTTP ────────────────────────────────────────────────────────────
    let state = AppState {
        store: Arc::clone(&store),
        router,
        watches,
        ingestor,
        queue: Arc::clone(&queue),
        backfill: Arc::new(Backfill::new(Arc::clone(&pipeline), config.message_concurrency)),
        reconciler: Arc::new(Reconciler::new(
            Arc::clone(&store),
            directory,
            Arc::clone(&registry),
        )),
        webhook: Arc::new(WebhookGuard::new(
            config.webhook_token.clone(),
            RateLimiter::new(config.webhook_rate_limit, RATE_WINDOW),
        )),
    };

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    tracing::info!(port = config.port, workers = config.workers, "HTTP server started");
    eprintln!("   Webhook: http://0.0.0.0:{}/api/mailbox/webhook\n", config.port);

    axum::serve(listener, api::routes(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    // ── Teardown ────────────────────────────────────────────────────────
    tracing::info!("Shutting down");
    renewal_shutdown.store(true, Ordering::Relaxed);
    renewal.abort();
    ingest_shutdown.store(true, Ordering::Relaxed);
    drop(queue);
    for worker in workers {
        if tokio::time::timeout(Duration::from_secs(10), worker).await.is_err() {
            tracing::warn!("Ingest worker did not stop in time");
        }
    }
    let released = registry.release_all().await;
    tracing::info!(released, "Tenant stores released");
    Ok(())
}

/// Stderr logging plus an optional daily-rolling file.
fn setup_logging(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match log_dir.filter(|dir| std::fs::create_dir_all(dir).is_ok()) {
        Some(dir) => {
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "bankmail.log"));
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .init();
            None
        }
    }
}
