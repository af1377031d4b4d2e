//! Message envelopes
//!
//! An envelope is immutable once originated, apart from the hop count which
//! each relay decrements. Its fingerprint covers everything else and is
//! signed by the originator.

mod envelope;
mod types;

pub use envelope::MessageEnvelope;
pub use types::{Destination, EnvelopeError, Fingerprint, MessageKind};
