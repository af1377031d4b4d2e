use async_trait::async_trait;
use bitmesh::delivery::{
    AbandonReason, DeliveryConfig, DeliveryState, DeliveryTracker, Dispatcher,
};
use bitmesh::message::{Destination, MessageEnvelope, MessageKind};
use bitmesh::peer::{LocalIdentity, PeerId};
use bitmesh::router::RouteOutcome;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Answers every dispatch with the same outcome and remembers when it was asked
struct RecordingDispatcher {
    outcome: RouteOutcome,
    /// How long each dispatch takes to resolve
    latency: Duration,
    calls: Mutex<Vec<Instant>>,
}

impl RecordingDispatcher {
    fn new(outcome: RouteOutcome) -> Arc<Self> {
        Self::slow(outcome, Duration::ZERO)
    }

    fn slow(outcome: RouteOutcome, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            outcome,
            latency,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<Instant> {
        self.calls.lock().clone()
    }

    /// Time between consecutive dispatches
    fn gaps(&self) -> Vec<Duration> {
        self.calls()
            .windows(2)
            .map(|pair| pair[1].duration_since(pair[0]))
            .collect()
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn dispatch(&self, _envelope: &MessageEnvelope) -> RouteOutcome {
        self.calls.lock().push(Instant::now());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.outcome.clone()
    }
}

fn config() -> DeliveryConfig {
    DeliveryConfig {
        ack_timeout: Duration::from_secs(1),
        retry_budget: 3,
        backoff_base: Duration::from_secs(1),
        backoff_max: Duration::from_secs(60),
    }
}

fn directed_to(peer: PeerId) -> MessageEnvelope {
    MessageEnvelope::originate(
        &LocalIdentity::generate(),
        Destination::Peer(peer),
        MessageKind::Data {
            ack_requested: true,
        },
        Bytes::from_static(b"are you there"),
        7,
    )
}

fn assert_close(actual: Duration, expected: Duration) {
    assert!(
        actual >= expected && actual < expected + Duration::from_millis(20),
        "expected ~{:?}, got {:?}",
        expected,
        actual
    );
}

/// Sent, never acknowledged: retries after 1s, 2s and 4s of backoff, then
/// exactly one Abandoned notification.
#[tokio::test(start_paused = true)]
async fn test_unacknowledged_message_retries_then_abandons() {
    let dispatcher = RecordingDispatcher::new(RouteOutcome::Dispatched {
        via: vec![bitmesh::transport::TransportKind::LocalMesh],
    });
    let tracker = DeliveryTracker::new(dispatcher.clone(), config());
    let mut updates = tracker.subscribe_all();

    let envelope = directed_to(PeerId::from_bytes([7; 32]));
    let mut state = tracker.track(envelope.clone()).unwrap();

    let update = updates.recv().await.unwrap();
    assert_eq!(update.fingerprint, envelope.fingerprint);
    assert_eq!(
        update.state,
        DeliveryState::Abandoned {
            reason: AbandonReason::RetriesExhausted
        }
    );
    assert_eq!(
        *state.borrow_and_update(),
        DeliveryState::Abandoned {
            reason: AbandonReason::RetriesExhausted
        }
    );

    assert_eq!(dispatcher.calls().len(), 4);
    let gaps = dispatcher.gaps();
    let ack_timeout = Duration::from_secs(1);
    assert_close(gaps[0], ack_timeout + Duration::from_secs(1));
    assert_close(gaps[1], ack_timeout + Duration::from_secs(2));
    assert_close(gaps[2], ack_timeout + Duration::from_secs(4));

    // Nothing else happens afterwards
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(dispatcher.calls().len(), 4);
    assert!(updates.try_recv().is_err());
    assert_eq!(tracker.active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_ack_wait_suppresses_late_ack() {
    let dispatcher = RecordingDispatcher::new(RouteOutcome::Dispatched { via: vec![] });
    let tracker = DeliveryTracker::new(dispatcher.clone(), config());
    let mut updates = tracker.subscribe_all();

    let bob = PeerId::from_bytes([8; 32]);
    let envelope = directed_to(bob);
    let state = tracker.track(envelope.clone()).unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(*state.borrow(), DeliveryState::Sent { attempt: 1 });
    assert!(tracker.cancel(&envelope.fingerprint));

    let cancelled = DeliveryState::Abandoned {
        reason: AbandonReason::Cancelled,
    };
    assert_eq!(*state.borrow(), cancelled);
    assert_eq!(updates.recv().await.unwrap().state, cancelled);

    // The ack shows up after the timeout would have fired
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!tracker.acknowledge(&envelope.fingerprint, &bob));
    assert_eq!(*state.borrow(), cancelled);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(dispatcher.calls().len(), 1);
    assert!(updates.try_recv().is_err());
    assert!(!tracker.cancel(&envelope.fingerprint));
}

/// Cancelled while the first dispatch is still in flight: the record never
/// reaches Sent and nothing is dispatched again.
#[tokio::test(start_paused = true)]
async fn test_cancel_while_pending() {
    let dispatcher = RecordingDispatcher::slow(
        RouteOutcome::Dispatched { via: vec![] },
        Duration::from_millis(500),
    );
    let tracker = DeliveryTracker::new(dispatcher.clone(), config());
    let mut updates = tracker.subscribe_all();

    let bob = PeerId::from_bytes([13; 32]);
    let envelope = directed_to(bob);
    let mut state = tracker.track(envelope.clone()).unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(dispatcher.calls().len(), 1);
    assert_eq!(tracker.status(&envelope.fingerprint), Some(DeliveryState::Pending));
    assert!(!state.has_changed().unwrap());

    assert!(tracker.cancel(&envelope.fingerprint));
    let cancelled = DeliveryState::Abandoned {
        reason: AbandonReason::Cancelled,
    };
    assert_eq!(*state.borrow_and_update(), cancelled);
    assert_eq!(updates.recv().await.unwrap().state, cancelled);

    // Well past when the dispatch would have resolved and timed out
    tokio::time::sleep(Duration::from_secs(30)).await;
    // The record is gone, so the channel may be closed, but never updated
    assert!(!matches!(state.has_changed(), Ok(true)));
    assert_eq!(*state.borrow(), cancelled);
    assert_eq!(dispatcher.calls().len(), 1);
    assert!(updates.try_recv().is_err());
    assert!(!tracker.acknowledge(&envelope.fingerprint, &bob));
}

#[tokio::test(start_paused = true)]
async fn test_failed_dispatch_spends_retry_budget() {
    let dispatcher = RecordingDispatcher::new(RouteOutcome::TransportExhausted);
    let tracker = DeliveryTracker::new(dispatcher.clone(), config());
    let mut updates = tracker.subscribe_all();

    tracker
        .track(directed_to(PeerId::from_bytes([9; 32])))
        .unwrap();
    let update = updates.recv().await.unwrap();

    assert_eq!(
        update.state,
        DeliveryState::Abandoned {
            reason: AbandonReason::RetriesExhausted
        }
    );
    // No ack wait when nothing accepted the message: only the backoff
    let gaps = dispatcher.gaps();
    assert_eq!(gaps.len(), 3);
    assert_close(gaps[0], Duration::from_secs(1));
    assert_close(gaps[1], Duration::from_secs(2));
    assert_close(gaps[2], Duration::from_secs(4));
}

#[tokio::test(start_paused = true)]
async fn test_ack_after_retry_settles() {
    let dispatcher = RecordingDispatcher::new(RouteOutcome::Dispatched { via: vec![] });
    let tracker = DeliveryTracker::new(dispatcher.clone(), config());

    let bob = PeerId::from_bytes([10; 32]);
    let envelope = directed_to(bob);
    let mut state = tracker.track(envelope.clone()).unwrap();

    state
        .wait_for(|s| *s == DeliveryState::Sent { attempt: 2 })
        .await
        .unwrap();
    assert_eq!(tracker.attempts(&envelope.fingerprint), Some(2));
    assert!(tracker.acknowledge(&envelope.fingerprint, &bob));
    assert_eq!(*state.borrow(), DeliveryState::Acknowledged);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(dispatcher.calls().len(), 2);
    assert_eq!(tracker.status(&envelope.fingerprint), None);
}

#[tokio::test(start_paused = true)]
async fn test_records_are_independent() {
    let dispatcher = RecordingDispatcher::new(RouteOutcome::Dispatched { via: vec![] });
    let tracker = DeliveryTracker::new(dispatcher.clone(), config());

    let first = directed_to(PeerId::from_bytes([11; 32]));
    let second = directed_to(PeerId::from_bytes([12; 32]));
    tracker.track(first.clone()).unwrap();
    let mut second_state = tracker.track(second.clone()).unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(tracker.cancel(&first.fingerprint));
    assert_eq!(tracker.active_count(), 1);

    // The surviving record keeps retrying on its own schedule
    second_state
        .wait_for(|s| *s == DeliveryState::Sent { attempt: 2 })
        .await
        .unwrap();
    assert!(tracker.status(&second.fingerprint).is_some());
    tracker.shutdown();
    assert_eq!(tracker.active_count(), 0);
}
