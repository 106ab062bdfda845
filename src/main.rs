use std::sync::Arc;

use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use plexer_rs::config::Config;
use plexer_rs::consumers::ConsumerRegistry;
use plexer_rs::dispatch::{self, Dispatcher};
use plexer_rs::handlers::{app, AppState};
use plexer_rs::metrics::Metrics;
use plexer_rs::queue::FailureQueue;
use plexer_rs::recovery;
use plexer_rs::retry::RetryWorker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Configuration and registry are fail-fast: a bad PORT or consumer URL
    // exits non-zero before anything is bound.
    let cfg = Config::from_env()?;
    let registry = Arc::new(ConsumerRegistry::from_env()?);
    if registry.is_empty() {
        tracing::warn!("No consumers configured, accepted events will not be forwarded");
    }

    let metrics = Metrics::new();
    let queue = Arc::new(FailureQueue::new(cfg.data_dir.clone(), metrics.clone()));

    // Reattach any processing snapshot a previous run left behind, then seed
    // the delivery counters from the queue file.
    if let Err(e) = recovery::init_delivery_state(&queue).await {
        tracing::error!(error = %e, "Failure queue recovery failed");
    }

    let client = dispatch::http_client()?;
    let dispatcher = Arc::new(Dispatcher::new(
        client.clone(),
        Arc::clone(&registry),
        Arc::clone(&queue),
        metrics.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = RetryWorker::new(
        client,
        Arc::clone(&registry),
        Arc::clone(&queue),
        cfg.retry_concurrency,
        cfg.retry_batch_size,
        metrics.clone(),
    );
    let worker_handle = tokio::spawn(worker.run(shutdown_rx));

    let state = AppState {
        environment: cfg.environment.clone(),
        dispatcher: Arc::clone(&dispatcher),
        queue: Arc::clone(&queue),
        metrics,
    };

    let addr = format!("{}:{}", cfg.host, cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, environment = %cfg.environment, "plexer listening");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the retry timer first, then give in-flight fanout a bounded
    // window to settle. Critical failures are already appended to the queue
    // by the time their delivery task finishes.
    let _ = shutdown_tx.send(true);
    let _ = worker_handle.await;

    match dispatcher.drain(cfg.drain_timeout).await {
        Ok(()) => tracing::info!("In-flight forwards drained"),
        Err(remaining) => {
            tracing::warn!(remaining, "Drain timed out with forwards still in flight")
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
