use crate::message::{Fingerprint, MessageEnvelope};
use crate::peer::PeerId;
use crate::transport::TransportKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Routing policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Hop count given to locally originated messages
    pub max_hops: u8,

    /// Upper bound on a single transport send
    #[serde(with = "crate::config::duration_ms")]
    pub send_timeout: Duration,

    /// Allow relaying on the transport a message arrived on when that
    /// transport has other neighbors
    pub relay_on_arrival_transport: bool,

    /// Relay fan-outs per second (0 = unlimited)
    pub relay_rate_per_second: u32,

    /// A directed, ack-requested message seen again after this long is a
    /// sender retry: relays forward it again and the destination answers
    /// with a fresh ack. Zero treats every repeat as a duplicate.
    #[serde(with = "crate::config::duration_ms")]
    pub retransmit_after: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_hops: 7,
            send_timeout: Duration::from_secs(2),
            relay_on_arrival_transport: true,
            relay_rate_per_second: 0,
            retransmit_after: Duration::from_secs(1),
        }
    }
}

/// Result of dispatching a locally originated message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Accepted by the listed transports, in dispatch order
    Dispatched { via: Vec<TransportKind> },
    /// Transports were tried and none accepted
    TransportExhausted,
    /// No transport could transmit at all
    TransportUnavailable,
    /// No known path to the destination
    DestinationUnreachable,
}

impl RouteOutcome {
    pub fn is_dispatched(&self) -> bool {
        matches!(self, RouteOutcome::Dispatched { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RouteOutcome::Dispatched { .. } => "dispatched",
            RouteOutcome::TransportExhausted => "transport_exhausted",
            RouteOutcome::TransportUnavailable => "transport_unavailable",
            RouteOutcome::DestinationUnreachable => "destination_unreachable",
        }
    }
}

/// Why an inbound frame went no further
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Duplicate,
    InvalidSignature,
    /// Our own message coming back
    Loopback,
}

/// What the router did with an inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveOutcome {
    pub delivered: bool,
    /// Transports the relayed copy was accepted on
    pub relayed_via: Vec<TransportKind>,
    pub dropped: Option<DropReason>,
}

impl ReceiveOutcome {
    pub(crate) fn dropped(reason: DropReason) -> Self {
        Self {
            delivered: false,
            relayed_via: Vec::new(),
            dropped: Some(reason),
        }
    }
}

/// Pushed upward to the node
#[derive(Debug, Clone)]
pub enum RouterEvent {
    /// A message addressed to this node (or broadcast) arrived
    Delivered {
        envelope: MessageEnvelope,
        from: PeerId,
    },
    /// The destination confirmed receipt of one of our messages
    Acknowledged { fingerprint: Fingerprint, by: PeerId },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RouterStats {
    pub originated: u64,
    pub received: u64,
    pub duplicates: u64,
    pub invalid: u64,
    pub delivered: u64,
    pub relayed: u64,
    pub acks_sent: u64,
    /// Sender retries let through after the quiet period
    pub retransmissions: u64,
}
