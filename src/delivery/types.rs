use crate::message::Fingerprint;
use crate::peer::PeerId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbandonReason {
    Cancelled,
    RetriesExhausted,
    /// No known path; not retried
    Unreachable,
}

/// Per-message delivery state. `attempt` counts dispatches, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    Pending,
    Sent { attempt: u32 },
    TimedOut { attempt: u32 },
    /// Waiting out the backoff before dispatch number `attempt`
    Retrying { attempt: u32 },
    Acknowledged,
    Abandoned { reason: AbandonReason },
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryState::Acknowledged | DeliveryState::Abandoned { .. }
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::Sent { .. } => "sent",
            DeliveryState::TimedOut { .. } => "timed_out",
            DeliveryState::Retrying { .. } => "retrying",
            DeliveryState::Acknowledged => "acknowledged",
            DeliveryState::Abandoned { .. } => "abandoned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    Dispatched,
    AckTimeout,
    RetryScheduled,
    Acknowledged,
    Cancel,
    GiveUp(AbandonReason),
}

/// Broadcast to tracker-wide subscribers when a record settles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryUpdate {
    pub fingerprint: Fingerprint,
    pub destination: PeerId,
    pub state: DeliveryState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// How long to wait for an acknowledgement after each dispatch
    #[serde(with = "crate::config::duration_ms")]
    pub ack_timeout: Duration,

    /// Retries after the first dispatch
    pub retry_budget: u32,

    /// First backoff interval; doubles on every retry
    #[serde(with = "crate::config::duration_ms")]
    pub backoff_base: Duration,

    #[serde(with = "crate::config::duration_ms")]
    pub backoff_max: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(5),
            retry_budget: 3,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }
}
