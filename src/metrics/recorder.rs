//! Metrics recorder for routing and delivery
//!
//! Without an installed recorder every call is a no-op.

use crate::router::RouteOutcome;
use crate::transport::{SendOutcome, TransportKind};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize metric descriptions (call once at startup)
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    describe_counter!(
        "bitmesh_messages_routed_total",
        "Locally originated dispatches by outcome"
    );
    describe_counter!(
        "bitmesh_messages_received_total",
        "Frames received, by arrival transport"
    );
    describe_counter!(
        "bitmesh_messages_dropped_total",
        "Inbound frames dropped, by reason"
    );
    describe_counter!(
        "bitmesh_messages_delivered_total",
        "Messages delivered to the local application"
    );
    describe_counter!(
        "bitmesh_messages_relayed_total",
        "Relayed copies accepted, by transport"
    );
    describe_counter!(
        "bitmesh_transport_sends_total",
        "Transport send calls, by transport and outcome"
    );
    describe_counter!(
        "bitmesh_deliveries_settled_total",
        "Tracked deliveries reaching a terminal state"
    );

    describe_gauge!("bitmesh_active_deliveries", "Deliveries awaiting acknowledgement");
    describe_gauge!("bitmesh_known_peers", "Peers in the registry");
    describe_gauge!("bitmesh_dedup_entries", "Fingerprints held by the dedup store");

    describe_histogram!(
        "bitmesh_delivery_duration_seconds",
        "Time from tracking to terminal state"
    );
}

pub fn record_route_outcome(outcome: &RouteOutcome) {
    counter!("bitmesh_messages_routed_total", "outcome" => outcome.as_str()).increment(1);
}

pub fn record_message_received(via: TransportKind) {
    counter!("bitmesh_messages_received_total", "transport" => via.as_str()).increment(1);
}

pub fn record_message_dropped(reason: &'static str) {
    counter!("bitmesh_messages_dropped_total", "reason" => reason).increment(1);
}

pub fn record_message_delivered() {
    counter!("bitmesh_messages_delivered_total").increment(1);
}

pub fn record_relay(via: TransportKind) {
    counter!("bitmesh_messages_relayed_total", "transport" => via.as_str()).increment(1);
}

pub fn record_send_outcome(kind: TransportKind, outcome: SendOutcome) {
    counter!(
        "bitmesh_transport_sends_total",
        "transport" => kind.as_str(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

pub fn record_delivery_settled(state: &'static str, elapsed: Duration) {
    counter!("bitmesh_deliveries_settled_total", "state" => state).increment(1);
    histogram!("bitmesh_delivery_duration_seconds").record(elapsed.as_secs_f64());
}

pub fn set_active_deliveries(count: usize) {
    gauge!("bitmesh_active_deliveries").set(count as f64);
}

pub fn set_known_peers(count: usize) {
    gauge!("bitmesh_known_peers").set(count as f64);
}

pub fn set_dedup_entries(count: usize) {
    gauge!("bitmesh_dedup_entries").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        // Should not panic when called multiple times
        init_metrics();
        init_metrics();
    }

    #[test]
    fn test_recording_without_recorder() {
        record_route_outcome(&RouteOutcome::TransportExhausted);
        record_send_outcome(TransportKind::Relay, SendOutcome::TransportUnavailable);
        record_delivery_settled("acknowledged", Duration::from_millis(20));
        set_active_deliveries(3);
    }
}
