use crate::delivery::error::{DeliveryError, DeliveryResult};
use crate::delivery::types::{AbandonReason, DeliveryEvent, DeliveryState};
use tokio::sync::watch;

/// Delivery state of one outbound message, published on a watch channel.
///
/// Each transition is computed and stored under the channel's lock, so
/// concurrent events (ack vs. timeout vs. cancel) are serialized and only
/// the first to reach a terminal state wins.
pub struct DeliveryStateMachine {
    state: watch::Sender<DeliveryState>,
}

impl Default for DeliveryStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryStateMachine {
    pub fn new() -> Self {
        let (state, _) = watch::channel(DeliveryState::Pending);
        Self { state }
    }

    pub fn current_state(&self) -> DeliveryState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<DeliveryState> {
        self.state.subscribe()
    }

    /// Dispatches made so far
    pub fn attempts(&self) -> u32 {
        match self.current_state() {
            DeliveryState::Pending => 0,
            DeliveryState::Sent { attempt } | DeliveryState::TimedOut { attempt } => attempt,
            DeliveryState::Retrying { attempt } => attempt - 1,
            DeliveryState::Acknowledged | DeliveryState::Abandoned { .. } => 0,
        }
    }

    pub fn transition(&self, event: DeliveryEvent) -> DeliveryResult<DeliveryState> {
        let mut result = Err(DeliveryError::InvalidStateTransition(String::new()));

        self.state.send_if_modified(|state| match next_state(state, &event) {
            Ok(next) => {
                *state = next;
                result = Ok(next);
                true
            }
            Err(e) => {
                result = Err(e);
                false
            }
        });

        result
    }
}

fn next_state(state: &DeliveryState, event: &DeliveryEvent) -> DeliveryResult<DeliveryState> {
    let next = match (state, event) {
        (DeliveryState::Pending, DeliveryEvent::Dispatched) => DeliveryState::Sent { attempt: 1 },

        (DeliveryState::Retrying { attempt }, DeliveryEvent::Dispatched) => DeliveryState::Sent {
            attempt: *attempt,
        },

        (DeliveryState::Sent { attempt }, DeliveryEvent::AckTimeout) => DeliveryState::TimedOut {
            attempt: *attempt,
        },

        // First dispatch failed outright
        (DeliveryState::Pending, DeliveryEvent::RetryScheduled) => {
            DeliveryState::Retrying { attempt: 2 }
        }

        (
            DeliveryState::TimedOut { attempt } | DeliveryState::Retrying { attempt },
            DeliveryEvent::RetryScheduled,
        ) => DeliveryState::Retrying {
            attempt: attempt + 1,
        },

        // An ack may race ahead of the Dispatched transition
        (
            DeliveryState::Pending
            | DeliveryState::Sent { .. }
            | DeliveryState::TimedOut { .. }
            | DeliveryState::Retrying { .. },
            DeliveryEvent::Acknowledged,
        ) => DeliveryState::Acknowledged,

        (state, DeliveryEvent::Cancel) if !state.is_terminal() => DeliveryState::Abandoned {
            reason: AbandonReason::Cancelled,
        },

        (state, DeliveryEvent::GiveUp(reason)) if !state.is_terminal() => {
            DeliveryState::Abandoned { reason: *reason }
        }

        _ => {
            return Err(DeliveryError::InvalidStateTransition(format!(
                "Cannot handle {:?} in state {:?}",
                event, state
            )));
        }
    };
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let sm = DeliveryStateMachine::new();
        assert_eq!(sm.current_state(), DeliveryState::Pending);

        sm.transition(DeliveryEvent::Dispatched).unwrap();
        assert_eq!(sm.current_state(), DeliveryState::Sent { attempt: 1 });

        sm.transition(DeliveryEvent::Acknowledged).unwrap();
        assert!(sm.current_state().is_terminal());
    }

    #[test]
    fn test_retry_cycle_counts_attempts() {
        let sm = DeliveryStateMachine::new();
        sm.transition(DeliveryEvent::Dispatched).unwrap();
        sm.transition(DeliveryEvent::AckTimeout).unwrap();
        assert_eq!(sm.attempts(), 1);

        sm.transition(DeliveryEvent::RetryScheduled).unwrap();
        assert_eq!(sm.current_state(), DeliveryState::Retrying { attempt: 2 });
        assert_eq!(sm.attempts(), 1);

        sm.transition(DeliveryEvent::Dispatched).unwrap();
        assert_eq!(sm.current_state(), DeliveryState::Sent { attempt: 2 });
    }

    #[test]
    fn test_failed_dispatch_goes_straight_to_retrying() {
        let sm = DeliveryStateMachine::new();
        sm.transition(DeliveryEvent::RetryScheduled).unwrap();
        sm.transition(DeliveryEvent::RetryScheduled).unwrap();
        assert_eq!(sm.current_state(), DeliveryState::Retrying { attempt: 3 });
    }

    #[test]
    fn test_cancel_is_terminal_and_suppresses_ack() {
        let sm = DeliveryStateMachine::new();
        sm.transition(DeliveryEvent::Dispatched).unwrap();
        sm.transition(DeliveryEvent::Cancel).unwrap();

        assert_eq!(
            sm.current_state(),
            DeliveryState::Abandoned {
                reason: AbandonReason::Cancelled
            }
        );
        assert!(sm.transition(DeliveryEvent::Acknowledged).is_err());
        assert!(sm.transition(DeliveryEvent::Cancel).is_err());
    }

    #[test]
    fn test_invalid_transitions() {
        let sm = DeliveryStateMachine::new();
        assert!(sm.transition(DeliveryEvent::AckTimeout).is_err());

        sm.transition(DeliveryEvent::Dispatched).unwrap();
        assert!(sm.transition(DeliveryEvent::Dispatched).is_err());
        assert_eq!(sm.current_state(), DeliveryState::Sent { attempt: 1 });
    }

    #[tokio::test]
    async fn test_watchers_see_changes() {
        let sm = DeliveryStateMachine::new();
        let mut rx = sm.subscribe();

        sm.transition(DeliveryEvent::Dispatched).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), DeliveryState::Sent { attempt: 1 });
    }
}
