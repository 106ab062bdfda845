//! Delivery policy for (event type, consumer) pairs.
//!
//! The first-attempt dispatcher and the retry worker both consult [`route`]
//! so the forward/queue decision lives in exactly one place.

/// Key of the consumer whose failed forwards are durably queued.
pub const CRITICAL_KEY: &str = "heimgeist";

/// Event types delivered to every configured consumer.
pub const BROADCAST_EVENTS: &[&str] = &[
    "knowledge.observatory.published.v1",
    "knowledge.insight.published.v1",
    "integrity.summary.published.v1",
    "heimgewebe.pulse.published.v1",
];

/// Event types that are never queued on failure, regardless of consumer.
pub const BEST_EFFORT_EVENTS: &[&str] = &[
    "integrity.summary.published.v1",
    "heimgewebe.pulse.published.v1",
];

/// Routing decision for one (event type, consumer) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// Whether the event is forwarded to this consumer at all
    pub forward: bool,
    /// Whether a failed forward is appended to the durable failure queue
    pub queue_on_fail: bool,
}

/// Decide how an event type is delivered to a consumer.
///
/// Broadcast types reach every consumer; everything else reaches only the
/// critical consumer. Only critical forwards of non-best-effort types are
/// queued on failure.
pub fn route(event_type: &str, consumer_key: &str) -> Route {
    let critical = consumer_key == CRITICAL_KEY;
    Route {
        forward: critical || BROADCAST_EVENTS.contains(&event_type),
        queue_on_fail: critical && !BEST_EFFORT_EVENTS.contains(&event_type),
    }
}
