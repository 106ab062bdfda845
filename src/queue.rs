//! Durable failure queue for critical forwards.
//!
//! Failed deliveries are appended to `failed_forwards.jsonl`, one JSON entry
//! per line. All mutations of the queue file hold an exclusive advisory lock
//! on `failed_forwards.lock`, so concurrent request handlers, the retry
//! worker, and other process instances sharing the data directory never
//! interleave writes.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::envelope::EventEnvelope;
use crate::metrics::Metrics;

pub const QUEUE_FILE: &str = "failed_forwards.jsonl";
pub const LOCK_FILE: &str = "failed_forwards.lock";

const LOCK_RETRY_ATTEMPTS: u32 = 25;
const LOCK_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(40);

const INITIAL_RETRY_DELAY_SECS: i64 = 30;
const SCHEDULE_JITTER_MS: i64 = 10_000;
const BACKOFF_BASE_SECS: u64 = 60;
const BACKOFF_CAP_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("could not acquire queue lock after {attempts} attempts")]
    LockContended { attempts: u32 },
}

/// One queued delivery failure, persisted as a single JSON line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedForward {
    pub consumer_key: String,
    pub event: EventEnvelope,
    pub retry_count: u32,
    pub last_attempt: DateTime<Utc>,
    pub next_attempt: DateTime<Utc>,
    pub error: String,
}

impl FailedForward {
    /// Entry for a first-attempt failure: `retryCount = 0`, first retry due
    /// in 30s plus up to 10s of jitter.
    pub fn first_failure(event: EventEnvelope, consumer_key: &str, error: &str) -> Self {
        let now = Utc::now();
        Self {
            consumer_key: consumer_key.to_string(),
            event,
            retry_count: 0,
            last_attempt: now,
            next_attempt: now + Duration::seconds(INITIAL_RETRY_DELAY_SECS) + schedule_jitter(),
            error: error.to_string(),
        }
    }

    /// Record a failed retry: bump the count and push `nextAttempt` out by
    /// the exponential backoff for the new count.
    pub fn reschedule(&mut self, now: DateTime<Utc>, error: &str) {
        self.retry_count += 1;
        self.last_attempt = now;
        self.next_attempt = now + backoff_base(self.retry_count) + schedule_jitter();
        self.error = error.to_string();
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.consumer_key.trim().is_empty() {
            return Err("consumerKey must not be empty".to_string());
        }
        if self.event.event_type.is_empty() {
            return Err("event.type must not be empty".to_string());
        }
        if self.next_attempt <= self.last_attempt {
            return Err("nextAttempt must be after lastAttempt".to_string());
        }
        Ok(())
    }
}

/// Exponential backoff floor for a retry count: `min(2^count * 60s, 24h)`.
pub fn backoff_base(retry_count: u32) -> Duration {
    let secs = 2u64
        .checked_pow(retry_count)
        .and_then(|factor| factor.checked_mul(BACKOFF_BASE_SECS))
        .map(|secs| secs.min(BACKOFF_CAP_SECS))
        .unwrap_or(BACKOFF_CAP_SECS);
    Duration::seconds(secs as i64)
}

fn schedule_jitter() -> Duration {
    Duration::milliseconds(rand::thread_rng().gen_range(0..SCHEDULE_JITTER_MS))
}

/// Counters backing the delivery report, maintained by the queue and the
/// retry worker. Approximate between ticks; each completed tick recomputes
/// them from the persisted survivors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryCounters {
    pub failed: u64,
    pub retryable_now: u64,
    pub next_due_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_retry_at: Option<DateTime<Utc>>,
}

impl DeliveryCounters {
    /// Lower `next_due_at` to `due` if it is earlier than the current value.
    pub fn observe_due(&mut self, due: DateTime<Utc>) {
        match self.next_due_at {
            Some(current) if current <= due => {}
            _ => self.next_due_at = Some(due),
        }
    }
}

/// Held while mutating the queue file. Dropping the guard releases the
/// advisory lock.
pub struct QueueLock {
    file: std::fs::File,
}

impl Drop for QueueLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// The on-disk failure queue plus the in-memory counters derived from it.
pub struct FailureQueue {
    data_dir: PathBuf,
    counters: Arc<Mutex<DeliveryCounters>>,
    metrics: Metrics,
}

impl FailureQueue {
    pub fn new(data_dir: PathBuf, metrics: Metrics) -> Self {
        Self {
            data_dir,
            counters: Arc::new(Mutex::new(DeliveryCounters::default())),
            metrics,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn queue_path(&self) -> PathBuf {
        self.data_dir.join(QUEUE_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join(LOCK_FILE)
    }

    /// Fresh processing-snapshot path for one retry tick.
    pub fn processing_path(&self) -> PathBuf {
        self.data_dir
            .join(format!("processing.{}.jsonl", Uuid::new_v4()))
    }

    /// Fresh read-only snapshot path for a metrics scan.
    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir
            .join(format!("snapshot.{}.jsonl", Uuid::new_v4()))
    }

    /// Create the data directory and the lockfile if they do not exist.
    pub async fn ensure_data_dir(&self) -> Result<(), QueueError> {
        tokio::fs::create_dir_all(&self.data_dir).await?;
        tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(self.lock_path())
            .await?;
        Ok(())
    }

    /// Acquire the exclusive advisory lock, retrying a bounded number of
    /// times before giving up.
    pub async fn acquire_lock(&self) -> Result<QueueLock, QueueError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(self.lock_path())?;

        for attempt in 1..=LOCK_RETRY_ATTEMPTS {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(QueueLock { file }),
                Err(_) if attempt < LOCK_RETRY_ATTEMPTS => {
                    tokio::time::sleep(LOCK_RETRY_DELAY).await;
                }
                Err(_) => break,
            }
        }

        Err(QueueError::LockContended {
            attempts: LOCK_RETRY_ATTEMPTS,
        })
    }

    /// Append a first-attempt failure to the durable queue.
    ///
    /// Persistence errors are logged and surfaced via `last_error`; the event
    /// is dropped rather than blocking the caller.
    pub async fn save_failed_event(&self, event: &EventEnvelope, consumer_key: &str, error: &str) {
        let entry = FailedForward::first_failure(event.clone(), consumer_key, error);
        if let Err(reason) = entry.validate() {
            tracing::error!(
                consumer = consumer_key,
                reason = %reason,
                "Dropping invalid failure queue entry"
            );
            return;
        }

        match self.append_entries(std::slice::from_ref(&entry)).await {
            Ok(()) => {
                self.with_counters(|c| {
                    c.failed += 1;
                    c.last_error = Some(error.to_string());
                    c.observe_due(entry.next_attempt);
                });
                tracing::error!(
                    consumer = consumer_key,
                    event_type = %entry.event.event_type,
                    next_attempt = %entry.next_attempt,
                    error = %error,
                    "Forward failed, queued for retry"
                );
            }
            Err(e) => {
                self.with_counters(|c| {
                    c.last_error = Some(format!("queue append failed: {e}"));
                });
                tracing::error!(
                    consumer = consumer_key,
                    error = %e,
                    "Failed to persist failure queue entry, event dropped"
                );
            }
        }
    }

    /// Append entries to the queue file under the lock, one line each.
    pub async fn append_entries(&self, entries: &[FailedForward]) -> Result<(), QueueError> {
        self.ensure_data_dir().await?;

        let mut lines = String::new();
        for entry in entries {
            lines.push_str(&serde_json::to_string(entry)?);
            lines.push('\n');
        }

        let _lock = self.acquire_lock().await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.queue_path())
            .await?;
        file.write_all(lines.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Run `f` against the counters, then sync the queue-depth gauge.
    pub fn with_counters<R>(&self, f: impl FnOnce(&mut DeliveryCounters) -> R) -> R {
        let mut counters = self.counters.lock().unwrap();
        let result = f(&mut counters);
        self.metrics
            .failed_forwards_queued
            .set(counters.failed as i64);
        result
    }

    pub fn counters_snapshot(&self) -> DeliveryCounters {
        self.counters.lock().unwrap().clone()
    }
}
