//! Periodic retry of queued critical forwards.
//!
//! One logical worker runs tick after tick, never concurrently with itself.
//! A tick claims the whole queue file by renaming it to a processing
//! snapshot, so the lock is held only for the rename; retry POSTs and new
//! first-attempt failures proceed without blocking each other.

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use rand::Rng;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

use crate::consumers::ConsumerRegistry;
use crate::dispatch::deliver;
use crate::metrics::Metrics;
use crate::queue::{FailedForward, FailureQueue, QueueError};

const MIN_TICK_SECS: i64 = 5;
const MAX_TICK_SECS: i64 = 60;

/// What one retry tick did, for logging and tests.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub scanned: usize,
    pub attempted: usize,
    pub delivered: usize,
    pub requeued: usize,
    pub deferred: usize,
}

enum EntryOutcome {
    Delivered,
    Deferred(FailedForward),
    Requeued(FailedForward),
}

struct TickState {
    summary: TickSummary,
    survivors: Vec<FailedForward>,
    last_error: Option<String>,
}

pub struct RetryWorker {
    client: reqwest::Client,
    registry: Arc<ConsumerRegistry>,
    queue: Arc<FailureQueue>,
    concurrency: usize,
    batch_size: usize,
    metrics: Metrics,
}

impl RetryWorker {
    pub fn new(
        client: reqwest::Client,
        registry: Arc<ConsumerRegistry>,
        queue: Arc<FailureQueue>,
        concurrency: usize,
        batch_size: usize,
        metrics: Metrics,
    ) -> Self {
        Self {
            client,
            registry,
            queue,
            concurrency: concurrency.max(1),
            batch_size: batch_size.max(1),
            metrics,
        }
    }

    /// Tick until shutdown is signalled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("Retry worker started");

        loop {
            let delay = self.next_tick_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    tracing::info!("Retry worker stopped");
                    return;
                }
            }

            match self.tick().await {
                Ok(summary) if summary.scanned > 0 => {
                    tracing::info!(
                        scanned = summary.scanned,
                        delivered = summary.delivered,
                        requeued = summary.requeued,
                        deferred = summary.deferred,
                        "Retry cycle complete"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    // The processing snapshot stays on disk; the next boot
                    // reattaches it to the queue.
                    tracing::error!(error = %e, "Retry cycle aborted");
                }
            }
        }
    }

    /// Time until the next tick: distance to the earliest due entry, clamped
    /// to 5-60s with ±1s of jitter, floored at 5s.
    pub fn next_tick_delay(&self) -> Duration {
        let counters = self.queue.counters_snapshot();
        let base_secs = match counters.next_due_at {
            Some(due) => (due - Utc::now())
                .num_seconds()
                .clamp(MIN_TICK_SECS, MAX_TICK_SECS) as f64,
            None => MAX_TICK_SECS as f64,
        };

        let jitter: f64 = rand::thread_rng().gen_range(-1.0..1.0);
        Duration::from_secs_f64((base_secs + jitter).max(MIN_TICK_SECS as f64))
    }

    /// Run one retry cycle.
    ///
    /// Claims the queue file via rename, attempts every due entry, and
    /// appends the survivors back to the (new) queue file. The processing
    /// snapshot is only unlinked once the survivors are durable.
    pub async fn tick(&self) -> Result<TickSummary, QueueError> {
        self.queue.ensure_data_dir().await?;

        let queue_path = self.queue.queue_path();
        let processing_path = {
            let _lock = self.queue.acquire_lock().await?;

            let size = match tokio::fs::metadata(&queue_path).await {
                Ok(meta) => meta.len(),
                Err(e) if e.kind() == ErrorKind::NotFound => 0,
                Err(e) => return Err(e.into()),
            };
            if size == 0 {
                self.queue.with_counters(|c| {
                    c.failed = 0;
                    c.retryable_now = 0;
                    c.next_due_at = None;
                });
                return Ok(TickSummary::default());
            }

            let processing_path = self.queue.processing_path();
            tokio::fs::rename(&queue_path, &processing_path).await?;
            tokio::fs::File::create(&queue_path).await?;

            // Failures appended while this tick runs rebuild the counters
            // from zero; the survivors are folded back in at the end.
            self.queue.with_counters(|c| {
                c.failed = 0;
                c.retryable_now = 0;
                c.next_due_at = None;
            });

            processing_path
        };

        let mut state = TickState {
            summary: TickSummary::default(),
            survivors: Vec::new(),
            last_error: None,
        };

        let file = tokio::fs::File::open(&processing_path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut batch: Vec<FailedForward> = Vec::with_capacity(self.batch_size);

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            state.summary.scanned += 1;

            match serde_json::from_str::<FailedForward>(&line) {
                Ok(entry) => batch.push(entry),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unparsable failure queue line");
                    continue;
                }
            }

            if batch.len() >= self.batch_size {
                self.process_batch(std::mem::take(&mut batch), &mut state)
                    .await;
            }
        }
        if !batch.is_empty() {
            self.process_batch(batch, &mut state).await;
        }

        // Survivors must be durable before the snapshot goes away; if the
        // append fails the snapshot stays for next-boot recovery.
        if !state.survivors.is_empty() {
            self.queue.append_entries(&state.survivors).await?;
        }
        tokio::fs::remove_file(&processing_path).await?;

        let now = Utc::now();
        self.queue.with_counters(|c| {
            c.failed += state.survivors.len() as u64;
            c.retryable_now += state
                .survivors
                .iter()
                .filter(|s| s.next_attempt <= now)
                .count() as u64;
            for survivor in &state.survivors {
                c.observe_due(survivor.next_attempt);
            }
            c.last_retry_at = Some(now);
            if let Some(error) = state.last_error.take() {
                c.last_error = Some(error);
            }
        });

        Ok(state.summary)
    }

    async fn process_batch(&self, batch: Vec<FailedForward>, state: &mut TickState) {
        let outcomes = stream::iter(batch.into_iter().map(|entry| self.process_entry(entry)))
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .await;

        for outcome in outcomes {
            match outcome {
                EntryOutcome::Delivered => {
                    state.summary.attempted += 1;
                    state.summary.delivered += 1;
                }
                EntryOutcome::Deferred(entry) => {
                    state.summary.deferred += 1;
                    state.survivors.push(entry);
                }
                EntryOutcome::Requeued(entry) => {
                    state.summary.attempted += 1;
                    state.summary.requeued += 1;
                    state.last_error = Some(entry.error.clone());
                    state.survivors.push(entry);
                }
            }
        }
    }

    async fn process_entry(&self, mut entry: FailedForward) -> EntryOutcome {
        let now = Utc::now();
        if entry.next_attempt > now {
            return EntryOutcome::Deferred(entry);
        }

        let Some(consumer) = self.registry.get(&entry.consumer_key) else {
            tracing::warn!(
                consumer = %entry.consumer_key,
                "Queued forward has no configured consumer"
            );
            entry.reschedule(now, "Consumer configuration missing");
            return EntryOutcome::Requeued(entry);
        };

        match deliver(&self.client, consumer, &entry.event).await {
            Ok(status_code) => {
                self.metrics
                    .retry_attempts_total
                    .with_label_values(&["delivered"])
                    .inc();
                tracing::info!(
                    consumer = %consumer.key,
                    event_type = %entry.event.event_type,
                    status_code,
                    retry_count = entry.retry_count,
                    "Queued forward delivered"
                );
                EntryOutcome::Delivered
            }
            Err(error) => {
                self.metrics
                    .retry_attempts_total
                    .with_label_values(&["requeued"])
                    .inc();
                entry.reschedule(now, &error);
                tracing::warn!(
                    consumer = %consumer.key,
                    event_type = %entry.event.event_type,
                    retry_count = entry.retry_count,
                    next_attempt = %entry.next_attempt,
                    error = %error,
                    "Queued forward failed again"
                );
                EntryOutcome::Requeued(entry)
            }
        }
    }
}
