//! Wire format shared by all network transports
//!
//! ```text
//! +-------+---------+-------------+------------------------------+
//! | "BM"  | version | body length | bincode(WireFrame)           |
//! | 2 B   | 1 B     | u32 BE      | body length bytes            |
//! +-------+---------+-------------+------------------------------+
//! ```

use crate::message::MessageEnvelope;
use crate::peer::PeerId;
use crate::transport::error::{TransportError, TransportResult};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

pub const FRAME_MAGIC: [u8; 2] = *b"BM";
pub const FRAME_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 7;

/// Largest frame accepted on decode; fits one UDP datagram
pub const MAX_FRAME_SIZE: usize = 60 * 1024;

#[derive(Serialize, Deserialize)]
struct WireFrame {
    /// Immediate transmitter of this copy
    transmitter: PeerId,
    envelope: MessageEnvelope,
}

pub fn encode_frame(transmitter: PeerId, envelope: &MessageEnvelope) -> TransportResult<Bytes> {
    let body = bincode::serialize(&WireFrame {
        transmitter,
        envelope: envelope.clone(),
    })?;

    let total = HEADER_LEN + body.len();
    if total > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: total,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buf = BytesMut::with_capacity(total);
    buf.put_slice(&FRAME_MAGIC);
    buf.put_u8(FRAME_VERSION);
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Decode a frame into `(transmitter, envelope)`
pub fn decode_frame(frame: &[u8]) -> TransportResult<(PeerId, MessageEnvelope)> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: frame.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    if frame.len() < HEADER_LEN {
        return Err(TransportError::Truncated {
            expected: HEADER_LEN,
            actual: frame.len(),
        });
    }
    if frame[..2] != FRAME_MAGIC {
        return Err(TransportError::BadMagic);
    }
    if frame[2] != FRAME_VERSION {
        return Err(TransportError::UnsupportedVersion(frame[2]));
    }

    let body_len = u32::from_be_bytes([frame[3], frame[4], frame[5], frame[6]]) as usize;
    let body = &frame[HEADER_LEN..];
    if body.len() < body_len {
        return Err(TransportError::Truncated {
            expected: HEADER_LEN + body_len,
            actual: frame.len(),
        });
    }

    let wire: WireFrame = bincode::deserialize(&body[..body_len])?;
    Ok((wire.transmitter, wire.envelope))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Destination, MessageKind};
    use crate::peer::LocalIdentity;

    fn envelope(payload: Vec<u8>) -> MessageEnvelope {
        let identity = LocalIdentity::generate();
        MessageEnvelope::originate(
            &identity,
            Destination::Broadcast,
            MessageKind::Data {
                ack_requested: false,
            },
            payload,
            3,
        )
    }

    #[test]
    fn test_frame_carries_transmitter_and_envelope() {
        let env = envelope(b"over the air".to_vec());
        let relay = PeerId::from_bytes([9; 32]);

        let frame = encode_frame(relay, &env).unwrap();
        let (from, decoded) = decode_frame(&frame).unwrap();

        assert_eq!(from, relay);
        assert_eq!(decoded, env);
        assert!(decoded.verify().is_ok());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let env = envelope(vec![0u8; MAX_FRAME_SIZE]);
        assert!(matches!(
            encode_frame(env.sender, &env),
            Err(TransportError::FrameTooLarge { .. })
        ));
        assert!(matches!(
            decode_frame(&vec![0u8; MAX_FRAME_SIZE + 1]),
            Err(TransportError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let env = envelope(b"cut short".to_vec());
        let frame = encode_frame(env.sender, &env).unwrap();

        assert!(matches!(
            decode_frame(&frame[..frame.len() - 5]),
            Err(TransportError::Truncated { .. })
        ));
        assert!(matches!(
            decode_frame(&frame[..4]),
            Err(TransportError::Truncated { .. })
        ));
    }

    #[test]
    fn test_header_checks() {
        let env = envelope(b"x".to_vec());
        let mut frame = encode_frame(env.sender, &env).unwrap().to_vec();

        frame[2] = 9;
        assert!(matches!(
            decode_frame(&frame),
            Err(TransportError::UnsupportedVersion(9))
        ));

        frame[0] = b'X';
        assert!(matches!(decode_frame(&frame), Err(TransportError::BadMagic)));
    }
}
