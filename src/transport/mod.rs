//! Transport abstraction
//!
//! Every channel (local mesh, relay network) exposes the same capability
//! set: send a framed envelope to a link destination and push received
//! frames to a subscriber. The router only sees [`Transport`] and the
//! [`TransportKind`] tag.

pub mod codec;
mod error;
mod memory;
mod quic;
mod types;
mod udp;

pub use codec::{decode_frame, encode_frame, MAX_FRAME_SIZE};
pub use error::{TransportError, TransportResult};
pub use memory::{MemoryTransport, MeshMedium, SentRecord};
pub use quic::QuicRelayTransport;
pub use types::{
    InboundFrame, InboundSink, LinkDestination, QuicRelayConfig, SendOutcome, TransportKind,
    UdpMeshConfig,
};
pub use udp::UdpMeshTransport;

use async_trait::async_trait;
use bytes::Bytes;

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Whether the channel can currently transmit at all
    fn is_available(&self) -> bool;

    /// Hand an encoded frame to the channel. Returns once the frame is
    /// queued for transmission or refused; never waits for delivery.
    async fn send(&self, frame: Bytes, destination: &LinkDestination) -> SendOutcome;

    /// Register a sink for decoded inbound frames. Frames from one
    /// connection arrive in order.
    fn subscribe(&self, sink: InboundSink);
}
