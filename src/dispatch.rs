//! Fanout of one validated event to the configured consumers.
//!
//! Delivery is detached from the ingress response: each selected consumer
//! gets its own task, tracked in an in-flight counter so shutdown can drain
//! outstanding calls with a bounded wait.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use uuid::Uuid;

use crate::consumers::{ConsumerDescriptor, ConsumerRegistry};
use crate::envelope::EventEnvelope;
use crate::metrics::Metrics;
use crate::policy::route;
use crate::queue::FailureQueue;

/// Per-attempt timeout for outbound POSTs.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared outbound HTTP client used by the dispatcher and the retry worker.
pub fn http_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()
}

/// Counter of outstanding delivery calls with a completion signal.
#[derive(Clone)]
pub struct InFlightTracker {
    count: Arc<watch::Sender<usize>>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            count: Arc::new(tx),
        }
    }

    pub fn enter(&self) -> InFlightGuard {
        self.count.send_modify(|n| *n += 1);
        InFlightGuard {
            count: Arc::clone(&self.count),
        }
    }

    pub fn pending(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait until no calls are outstanding, or the timeout elapses.
    /// Returns the remaining count on timeout.
    pub async fn drain(&self, timeout: Duration) -> Result<(), usize> {
        let mut rx = self.count.subscribe();
        let result = tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0)).await;
        match result {
            Ok(_) => Ok(()),
            Err(_) => Err(self.pending()),
        }
    }
}

impl Default for InFlightTracker {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InFlightGuard {
    count: Arc<watch::Sender<usize>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.count.send_modify(|n| *n -= 1);
    }
}

/// POST one event to one consumer.
///
/// Returns the status code on 2xx; otherwise a diagnostic message carrying
/// the status or transport error, with 401/403 marked as token rejections.
pub async fn deliver(
    client: &reqwest::Client,
    consumer: &ConsumerDescriptor,
    event: &EventEnvelope,
) -> Result<u16, String> {
    let mut request = client.post(&consumer.url).json(event);
    if let Some((name, value)) = consumer.auth_header() {
        request = request.header(name, value);
    }

    match request.send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            if (200..300).contains(&status) {
                Ok(status)
            } else {
                let mut message = format!("{} responded with status {status}", consumer.label);
                if status == 401 || status == 403 {
                    message.push_str(" (token rejected)");
                }
                Err(message)
            }
        }
        Err(e) => Err(format!("request to {} failed: {e}", consumer.label)),
    }
}

pub struct Dispatcher {
    client: reqwest::Client,
    registry: Arc<ConsumerRegistry>,
    queue: Arc<FailureQueue>,
    in_flight: InFlightTracker,
    metrics: Metrics,
}

impl Dispatcher {
    pub fn new(
        client: reqwest::Client,
        registry: Arc<ConsumerRegistry>,
        queue: Arc<FailureQueue>,
        metrics: Metrics,
    ) -> Self {
        Self {
            client,
            registry,
            queue,
            in_flight: InFlightTracker::new(),
            metrics,
        }
    }

    pub fn pending(&self) -> usize {
        self.in_flight.pending()
    }

    pub async fn drain(&self, timeout: Duration) -> Result<(), usize> {
        self.in_flight.drain(timeout).await
    }

    /// Fan one event out to every consumer the policy selects.
    ///
    /// Spawns one detached task per consumer and returns immediately; the
    /// ingress response never waits on downstream calls.
    pub fn dispatch(&self, event: EventEnvelope) {
        let event_id = Uuid::new_v4();

        for consumer in self.registry.iter() {
            let decision = route(&event.event_type, &consumer.key);
            if !decision.forward {
                continue;
            }

            let guard = self.in_flight.enter();
            let client = self.client.clone();
            let consumer = consumer.clone();
            let event = event.clone();
            let queue = Arc::clone(&self.queue);
            let metrics = self.metrics.clone();

            tokio::spawn(async move {
                let _guard = guard;
                match deliver(&client, &consumer, &event).await {
                    Ok(status_code) => {
                        metrics
                            .forwards_total
                            .with_label_values(&[consumer.key.as_str(), "delivered"])
                            .inc();
                        let repo = event
                            .payload
                            .as_object()
                            .and_then(|payload| payload.get("repo"));
                        match repo {
                            Some(repo) => tracing::info!(
                                event_id = %event_id,
                                publisher = %event.source,
                                delivered_to = %consumer.key,
                                status_code,
                                repo = %repo,
                                "Event forwarded"
                            ),
                            None => tracing::info!(
                                event_id = %event_id,
                                publisher = %event.source,
                                delivered_to = %consumer.key,
                                status_code,
                                "Event forwarded"
                            ),
                        }
                    }
                    Err(error) => {
                        if decision.queue_on_fail {
                            metrics
                                .forwards_total
                                .with_label_values(&[consumer.key.as_str(), "queued"])
                                .inc();
                            queue.save_failed_event(&event, &consumer.key, &error).await;
                        } else {
                            metrics
                                .forwards_total
                                .with_label_values(&[consumer.key.as_str(), "dropped"])
                                .inc();
                            tracing::warn!(
                                log_kind = "best_effort_forward_failed",
                                event_id = %event_id,
                                consumer = %consumer.key,
                                event_type = %event.event_type,
                                error = %error,
                                "Best-effort forward failed, event dropped"
                            );
                        }
                    }
                }
            });
        }
    }
}
