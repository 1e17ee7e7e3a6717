//! Control framing: length-prefix (4 bytes LE) + bincode payload.

use crate::protocol::ControlMessage;

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode a control message into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(msg: &ControlMessage) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(msg)?;
    let len = u32::try_from(payload.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Read the length header. Errors with `NeedMore` on a short buffer and `TooLarge` past the cap.
pub fn frame_len(header: &[u8]) -> Result<usize, FrameDecodeError> {
    let header: [u8; LEN_SIZE] = header
        .get(..LEN_SIZE)
        .and_then(|h| h.try_into().ok())
        .ok_or(FrameDecodeError::NeedMore)?;
    let len = u32::from_le_bytes(header);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
pub fn decode_frame(bytes: &[u8]) -> Result<(ControlMessage, usize), FrameDecodeError> {
    let len = frame_len(bytes)?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let msg = bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((msg, LEN_SIZE + len))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::protocol::{Presence, DEFAULT_SERVICE_TAG, PROTOCOL_VERSION};

    fn sample_announce() -> ControlMessage {
        let kp = Keypair::generate();
        ControlMessage::Announce(Presence {
            protocol_version: PROTOCOL_VERSION,
            service_tag: DEFAULT_SERVICE_TAG.to_string(),
            device_id: kp.device_id(),
            public_key: kp.public_key().clone(),
            display_name: "Morty-iPhone".to_string(),
            listen_port: 45681,
        })
    }

    #[test]
    fn announce_survives_framing() {
        let msg = sample_announce();
        let frame = encode_frame(&msg).unwrap();
        let (decoded, n) = decode_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample_announce()).unwrap();
        assert!(matches!(decode_frame(&frame[..2]), Err(FrameDecodeError::NeedMore)));
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn oversized_header_rejected() {
        let header = (MAX_FRAME_LEN + 1).to_le_bytes();
        assert!(matches!(frame_len(&header), Err(FrameDecodeError::TooLarge)));
    }

    #[test]
    fn back_to_back_frames() {
        let a = sample_announce();
        let b = ControlMessage::Goodbye {
            protocol_version: PROTOCOL_VERSION,
            service_tag: DEFAULT_SERVICE_TAG.to_string(),
            device_id: Keypair::generate().device_id(),
        };
        let mut buf = encode_frame(&a).unwrap();
        let first_len = buf.len();
        buf.extend_from_slice(&encode_frame(&b).unwrap());
        let (m1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, first_len);
        let (m2, _) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(m1, a);
        assert_eq!(m2, b);
    }
}
