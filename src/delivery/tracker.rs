use crate::delivery::error::{DeliveryError, DeliveryResult};
use crate::delivery::state_machine::DeliveryStateMachine;
use crate::delivery::types::{
    AbandonReason, DeliveryConfig, DeliveryEvent, DeliveryState, DeliveryUpdate,
};
use crate::delivery::Dispatcher;
use crate::message::{Fingerprint, MessageEnvelope};
use crate::metrics::recorder;
use crate::peer::PeerId;
use crate::router::RouteOutcome;
use backoff::{backoff::Backoff, ExponentialBackoff};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const UPDATE_CHANNEL_CAPACITY: usize = 256;

struct DeliveryRecord {
    envelope: MessageEnvelope,
    destination: PeerId,
    machine: DeliveryStateMachine,
    ack: Notify,
    /// Cuts a pending backoff short
    nudge: Notify,
    /// Set only while the driver sits in a backoff wait
    backing_off: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
    started: Instant,
}

struct TrackerInner {
    dispatcher: Arc<dyn Dispatcher>,
    config: DeliveryConfig,
    records: DashMap<Fingerprint, Arc<DeliveryRecord>>,
    updates: broadcast::Sender<DeliveryUpdate>,
}

/// Drives acknowledgement, timeout and retry for directed messages.
///
/// Every record runs on its own task; cancelling one aborts only that task.
#[derive(Clone)]
pub struct DeliveryTracker {
    inner: Arc<TrackerInner>,
}

impl DeliveryTracker {
    pub fn new(dispatcher: Arc<dyn Dispatcher>, config: DeliveryConfig) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(TrackerInner {
                dispatcher,
                config,
                records: DashMap::new(),
                updates,
            }),
        }
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.inner.config
    }

    /// Start delivering `envelope` and return a watch on its state
    pub fn track(&self, envelope: MessageEnvelope) -> DeliveryResult<watch::Receiver<DeliveryState>> {
        let destination = envelope
            .destination
            .peer()
            .ok_or(DeliveryError::NotDirected)?;
        let fingerprint = envelope.fingerprint;

        let record = match self.inner.records.entry(fingerprint) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(DeliveryError::AlreadyTracked(fingerprint.to_hex()));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let record = Arc::new(DeliveryRecord {
                    envelope,
                    destination,
                    machine: DeliveryStateMachine::new(),
                    ack: Notify::new(),
                    nudge: Notify::new(),
                    backing_off: AtomicBool::new(false),
                    task: Mutex::new(None),
                    started: Instant::now(),
                });
                slot.insert(record.clone());
                record
            }
        };

        let receiver = record.machine.subscribe();
        let task = tokio::spawn(drive(self.inner.clone(), record.clone()));
        *record.task.lock() = Some(task);

        recorder::set_active_deliveries(self.inner.records.len());
        tracing::debug!(
            fingerprint = %fingerprint.short(),
            to = %destination.short(),
            "Tracking delivery"
        );
        Ok(receiver)
    }

    /// Record an acknowledgement from `by`. Returns `false` if it was
    /// ignored (unknown, already settled or from the wrong peer).
    pub fn acknowledge(&self, fingerprint: &Fingerprint, by: &PeerId) -> bool {
        let Some(record) = self.record(fingerprint) else {
            tracing::debug!(fingerprint = %fingerprint.short(), "Ignoring ack for unknown or settled message");
            return false;
        };

        if record.destination != *by {
            tracing::warn!(
                fingerprint = %fingerprint.short(),
                by = %by.short(),
                "Ignoring ack from a peer other than the destination"
            );
            return false;
        }

        match record.machine.transition(DeliveryEvent::Acknowledged) {
            Ok(state) => {
                record.ack.notify_one();
                settle(&self.inner, &record, state);
                true
            }
            Err(e) => {
                tracing::debug!(fingerprint = %fingerprint.short(), "Ignoring ack: {}", e);
                false
            }
        }
    }

    /// Abandon a record. No further dispatch happens and a later ack has no
    /// effect. Returns `false` if the record is unknown or already settled.
    pub fn cancel(&self, fingerprint: &Fingerprint) -> bool {
        let Some(record) = self.record(fingerprint) else {
            return false;
        };

        match record.machine.transition(DeliveryEvent::Cancel) {
            Ok(state) => {
                if let Some(task) = record.task.lock().take() {
                    task.abort();
                }
                settle(&self.inner, &record, state);
                true
            }
            Err(_) => false,
        }
    }

    /// Retry now any record for `peer` that is waiting out a backoff.
    /// Returns how many were woken.
    pub fn nudge(&self, peer: &PeerId) -> usize {
        let waiting: Vec<Arc<DeliveryRecord>> = self
            .inner
            .records
            .iter()
            .filter(|entry| entry.value().destination == *peer)
            .filter(|entry| entry.value().backing_off.load(Ordering::SeqCst))
            .map(|entry| entry.value().clone())
            .collect();

        // Wakes only a registered waiter; no permit is left behind
        for record in &waiting {
            record.nudge.notify_waiters();
        }
        waiting.len()
    }

    /// Current state, or `None` once settled and removed
    pub fn status(&self, fingerprint: &Fingerprint) -> Option<DeliveryState> {
        self.record(fingerprint)
            .map(|record| record.machine.current_state())
    }

    pub fn attempts(&self, fingerprint: &Fingerprint) -> Option<u32> {
        self.record(fingerprint).map(|record| record.machine.attempts())
    }

    pub fn subscribe(&self, fingerprint: &Fingerprint) -> Option<watch::Receiver<DeliveryState>> {
        self.record(fingerprint)
            .map(|record| record.machine.subscribe())
    }

    /// Terminal outcomes of every record
    pub fn subscribe_all(&self) -> broadcast::Receiver<DeliveryUpdate> {
        self.inner.updates.subscribe()
    }

    pub fn active_count(&self) -> usize {
        self.inner.records.len()
    }

    /// Cancel every in-flight record
    pub fn shutdown(&self) {
        let fingerprints: Vec<Fingerprint> =
            self.inner.records.iter().map(|entry| *entry.key()).collect();
        for fingerprint in fingerprints {
            self.cancel(&fingerprint);
        }
    }

    fn record(&self, fingerprint: &Fingerprint) -> Option<Arc<DeliveryRecord>> {
        self.inner
            .records
            .get(fingerprint)
            .map(|entry| entry.value().clone())
    }
}

/// Remove a record that reached `state` and tell subscribers
fn settle(inner: &TrackerInner, record: &DeliveryRecord, state: DeliveryState) {
    let fingerprint = record.envelope.fingerprint;
    inner.records.remove(&fingerprint);

    recorder::record_delivery_settled(state.as_str(), record.started.elapsed());
    recorder::set_active_deliveries(inner.records.len());

    match state {
        DeliveryState::Acknowledged => tracing::debug!(
            fingerprint = %fingerprint.short(),
            "Delivery acknowledged"
        ),
        _ => tracing::info!(
            fingerprint = %fingerprint.short(),
            to = %record.destination.short(),
            state = ?state,
            "Delivery settled"
        ),
    }

    let _ = inner.updates.send(DeliveryUpdate {
        fingerprint,
        destination: record.destination,
        state,
    });
}

fn backoff_for(config: &DeliveryConfig) -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: config.backoff_base,
        current_interval: config.backoff_base,
        randomization_factor: 0.0,
        multiplier: 2.0,
        max_interval: config.backoff_max,
        max_elapsed_time: None,
        ..Default::default()
    }
}

/// Per-record driver: dispatch, wait for the ack, back off, repeat
async fn drive(inner: Arc<TrackerInner>, record: Arc<DeliveryRecord>) {
    let config = &inner.config;
    let mut backoff = backoff_for(config);
    let mut attempt: u32 = 1;

    loop {
        let outcome = inner.dispatcher.dispatch(&record.envelope).await;

        match outcome {
            RouteOutcome::Dispatched { .. } => {
                // Settled while the dispatch was in flight
                if record.machine.transition(DeliveryEvent::Dispatched).is_err() {
                    return;
                }
                tokio::select! {
                    _ = record.ack.notified() => return,
                    _ = tokio::time::sleep(config.ack_timeout) => {}
                }
                if record.machine.transition(DeliveryEvent::AckTimeout).is_err() {
                    return;
                }
                tracing::debug!(
                    fingerprint = %record.envelope.fingerprint.short(),
                    attempt,
                    "No acknowledgement within {:?}",
                    config.ack_timeout
                );
            }
            RouteOutcome::DestinationUnreachable => {
                if let Ok(state) = record
                    .machine
                    .transition(DeliveryEvent::GiveUp(AbandonReason::Unreachable))
                {
                    settle(&inner, &record, state);
                }
                return;
            }
            RouteOutcome::TransportUnavailable | RouteOutcome::TransportExhausted => {
                tracing::debug!(
                    fingerprint = %record.envelope.fingerprint.short(),
                    attempt,
                    outcome = outcome.as_str(),
                    "Dispatch failed"
                );
            }
        }

        if attempt > config.retry_budget {
            if let Ok(state) = record
                .machine
                .transition(DeliveryEvent::GiveUp(AbandonReason::RetriesExhausted))
            {
                settle(&inner, &record, state);
            }
            return;
        }

        let delay = backoff.next_backoff().unwrap_or(config.backoff_max);
        let nudged = record.nudge.notified();
        tokio::pin!(nudged);
        nudged.as_mut().enable();
        record.backing_off.store(true, Ordering::SeqCst);

        if record
            .machine
            .transition(DeliveryEvent::RetryScheduled)
            .is_err()
        {
            return;
        }

        tokio::select! {
            _ = record.ack.notified() => return,
            _ = &mut nudged => {
                tracing::debug!(fingerprint = %record.envelope.fingerprint.short(), "Retrying early");
            }
            _ = tokio::time::sleep(delay) => {}
        }
        record.backing_off.store(false, Ordering::SeqCst);
        attempt += 1;
    }
}
