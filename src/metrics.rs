use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Prometheus metrics for the router, rendered by `GET /metrics`.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    // Counters
    pub events_received_total: IntCounterVec,
    pub forwards_total: IntCounterVec,
    pub retry_attempts_total: IntCounterVec,

    // Gauges
    pub failed_forwards_queued: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let events_received_total = IntCounterVec::new(
            Opts::new("plexer_events_received_total", "Events received on ingress"),
            &["outcome"], // accepted|rejected
        )
        .expect("metric");

        let forwards_total = IntCounterVec::new(
            Opts::new("plexer_forwards_total", "First-attempt forwards by consumer"),
            &["consumer", "outcome"], // delivered|queued|dropped
        )
        .expect("metric");

        let retry_attempts_total = IntCounterVec::new(
            Opts::new("plexer_retry_attempts_total", "Retry attempts by outcome"),
            &["outcome"], // delivered|requeued
        )
        .expect("metric");

        let failed_forwards_queued = IntGauge::new(
            "plexer_failed_forwards_queued",
            "Entries currently in the failure queue",
        )
        .expect("metric");

        registry
            .register(Box::new(events_received_total.clone()))
            .unwrap();
        registry.register(Box::new(forwards_total.clone())).unwrap();
        registry
            .register(Box::new(retry_attempts_total.clone()))
            .unwrap();
        registry
            .register(Box::new(failed_forwards_queued.clone()))
            .unwrap();

        Self {
            registry,
            events_received_total,
            forwards_total,
            retry_attempts_total,
            failed_forwards_queued,
        }
    }

    pub fn render(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&mf, &mut buf).map_err(|e| e.to_string())?;
        String::from_utf8(buf).map_err(|e| e.to_string())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_registered_metrics() {
        let metrics = Metrics::new();
        metrics
            .events_received_total
            .with_label_values(&["accepted"])
            .inc();
        metrics.failed_forwards_queued.set(3);

        let rendered = metrics.render().unwrap();
        assert!(rendered.contains("plexer_events_received_total"));
        assert!(rendered.contains("plexer_failed_forwards_queued 3"));
    }
}
