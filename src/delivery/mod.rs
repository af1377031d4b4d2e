//! Delivery tracking
//!
//! Every directed outbound message gets a state machine:
//!
//! ```text
//! Pending -> Sent -> Acknowledged
//!              |
//!              v
//!           TimedOut -> Retrying -> Sent ...
//!
//! any non-terminal state -> Abandoned (cancelled, retries exhausted, unreachable)
//! ```

mod error;
mod state_machine;
mod tracker;
mod types;

pub use error::{DeliveryError, DeliveryResult};
pub use state_machine::DeliveryStateMachine;
pub use tracker::DeliveryTracker;
pub use types::{AbandonReason, DeliveryConfig, DeliveryEvent, DeliveryState, DeliveryUpdate};

use crate::message::MessageEnvelope;
use crate::router::RouteOutcome;
use async_trait::async_trait;

/// Hands an envelope to the network; implemented by the router
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, envelope: &MessageEnvelope) -> RouteOutcome;
}
