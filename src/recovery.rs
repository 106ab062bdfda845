//! Startup reconciliation of the failure queue.
//!
//! A crash mid-tick leaves a `processing.<uuid>.jsonl` snapshot behind. At
//! boot, before the retry worker is armed, every orphaned snapshot is
//! appended back onto the queue file byte-for-byte and removed, then the
//! counters are seeded from a short-lived read-only copy of the queue.

use std::io::ErrorKind;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::queue::{FailedForward, FailureQueue, QueueError};

/// Full startup sequence: reattach orphans, then seed the counters.
pub async fn init_delivery_state(queue: &FailureQueue) -> Result<(), QueueError> {
    let reattached = recover_orphaned_batches(queue).await?;
    if reattached > 0 {
        tracing::info!(reattached, "Reattached orphaned processing snapshots");
    }
    scan_queue_metrics(queue).await?;
    Ok(())
}

/// Append every orphaned `processing.*.jsonl` snapshot back onto the queue
/// file and unlink it. Individual failures are logged and skipped so one bad
/// snapshot cannot block recovery of the rest.
pub async fn recover_orphaned_batches(queue: &FailureQueue) -> Result<usize, QueueError> {
    queue.ensure_data_dir().await?;

    let mut orphans = Vec::new();
    let mut dir = tokio::fs::read_dir(queue.data_dir()).await?;
    while let Some(dent) = dir.next_entry().await? {
        let name = dent.file_name().to_string_lossy().to_string();
        if name.starts_with("processing.") && name.ends_with(".jsonl") {
            orphans.push(dent.path());
        }
    }
    if orphans.is_empty() {
        return Ok(0);
    }
    orphans.sort();

    let mut reattached = 0;
    let _lock = queue.acquire_lock().await?;
    let mut queue_file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(queue.queue_path())
        .await?;

    for orphan in orphans {
        let bytes = match tokio::fs::read(&orphan).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(
                    file = %orphan.display(),
                    error = %e,
                    "Failed to read processing snapshot"
                );
                continue;
            }
        };

        if let Err(e) = queue_file.write_all(&bytes).await {
            tracing::error!(
                file = %orphan.display(),
                error = %e,
                "Failed to reattach processing snapshot"
            );
            continue;
        }
        if let Err(e) = queue_file.flush().await {
            tracing::error!(
                file = %orphan.display(),
                error = %e,
                "Failed to flush reattached snapshot"
            );
            continue;
        }

        if let Err(e) = tokio::fs::remove_file(&orphan).await {
            tracing::warn!(
                file = %orphan.display(),
                error = %e,
                "Failed to remove reattached snapshot"
            );
            continue;
        }

        reattached += 1;
        tracing::info!(file = %orphan.display(), "Reattached orphaned processing snapshot");
    }

    Ok(reattached)
}

/// Seed the counters from a locked copy of the queue file.
///
/// The copy keeps the lock window to a single `copy` call; the line scan
/// itself runs against the snapshot without blocking new appends.
pub async fn scan_queue_metrics(queue: &FailureQueue) -> Result<(), QueueError> {
    queue.ensure_data_dir().await?;

    let snapshot_path = queue.snapshot_path();
    {
        let _lock = queue.acquire_lock().await?;
        match tokio::fs::copy(queue.queue_path(), &snapshot_path).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                queue.with_counters(|c| {
                    c.failed = 0;
                    c.retryable_now = 0;
                    c.next_due_at = None;
                });
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
    }

    let now = Utc::now();
    let mut failed = 0u64;
    let mut retryable_now = 0u64;
    let mut next_due_at = None;

    let file = tokio::fs::File::open(&snapshot_path).await?;
    let mut lines = BufReader::new(file).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        failed += 1;

        if let Ok(entry) = serde_json::from_str::<FailedForward>(&line) {
            if entry.next_attempt <= now {
                retryable_now += 1;
            }
            match next_due_at {
                Some(due) if due <= entry.next_attempt => {}
                _ => next_due_at = Some(entry.next_attempt),
            }
        }
    }

    tokio::fs::remove_file(&snapshot_path).await?;

    queue.with_counters(|c| {
        c.failed = failed;
        c.retryable_now = retryable_now;
        c.next_due_at = next_due_at;
    });

    tracing::info!(failed, retryable_now, "Failure queue scanned");
    Ok(())
}
