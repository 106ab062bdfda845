//! Operational drill for the failure queue.
//!
//! Seeds synthetic failed forwards (RETRY_DRILL_COUNT, default 0) into the
//! configured data directory, runs one retry tick against the configured
//! consumers, and reports what happened. Useful for verifying a deployment's
//! queue plumbing without waiting for a real outage.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use plexer_rs::config::Config;
use plexer_rs::consumers::ConsumerRegistry;
use plexer_rs::dispatch;
use plexer_rs::envelope::EventEnvelope;
use plexer_rs::metrics::Metrics;
use plexer_rs::queue::{FailedForward, FailureQueue};
use plexer_rs::recovery;
use plexer_rs::retry::RetryWorker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cfg = Config::from_env()?;
    let registry = Arc::new(ConsumerRegistry::from_env()?);
    let metrics = Metrics::new();
    let queue = Arc::new(FailureQueue::new(cfg.data_dir.clone(), metrics.clone()));

    recovery::init_delivery_state(&queue).await?;

    let seed: usize = std::env::var("RETRY_DRILL_COUNT")
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0);

    if seed > 0 {
        let mut entries = Vec::with_capacity(seed);
        for n in 0..seed {
            let mut entry = FailedForward::first_failure(
                EventEnvelope {
                    event_type: "knowledge.observatory.published.v1".to_string(),
                    source: "retry-drill".to_string(),
                    payload: serde_json::json!({"drill": n}),
                },
                "heimgeist",
                "seeded by retry drill",
            );
            // Due immediately so the tick below attempts it
            entry.next_attempt = chrono::Utc::now() - chrono::Duration::seconds(1);
            entries.push(entry);
        }
        queue.append_entries(&entries).await?;
        tracing::info!(seeded = seed, "Seeded synthetic failed forwards");
    }

    let worker = RetryWorker::new(
        dispatch::http_client()?,
        registry,
        Arc::clone(&queue),
        cfg.retry_concurrency,
        cfg.retry_batch_size,
        metrics,
    );

    let summary = worker.tick().await?;
    let counters = queue.counters_snapshot();

    tracing::info!(
        scanned = summary.scanned,
        delivered = summary.delivered,
        requeued = summary.requeued,
        deferred = summary.deferred,
        remaining = counters.failed,
        "Retry drill complete"
    );

    Ok(())
}
