//! Payload codec: prefix-tag frames with no length field.
//!
//! ```text
//! Frame   := Tag Payload
//! Tag     := "LOCATION:" | "IMAGE:" | ""   (empty tag = legacy text)
//! Payload := UTF-8 text (LOCATION, legacy) or opaque bytes (IMAGE)
//! ```
//!
//! One frame is exactly one transport message. Tags are matched as exact,
//! case-sensitive byte prefixes in the order LOCATION, IMAGE, legacy.

pub const LOCATION_TAG: &[u8] = b"LOCATION:";
pub const IMAGE_TAG: &[u8] = b"IMAGE:";

/// An application payload exchanged between connected peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Location(String),
    Image(Vec<u8>),
    /// Untagged UTF-8 text from older senders. Only produced by `decode`.
    LegacyText(String),
}

impl Message {
    /// Text carried by location-like messages (`Location` and `LegacyText`).
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Location(s) | Message::LegacyText(s) => Some(s),
            Message::Image(_) => None,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("location payload is not valid UTF-8")]
    InvalidLocationText,
    #[error("untagged payload is not valid UTF-8 ({len} bytes)")]
    Unrecognized { len: usize },
}

pub fn encode(msg: &Message) -> Vec<u8> {
    let (tag, payload): (&[u8], &[u8]) = match msg {
        Message::Location(s) => (LOCATION_TAG, s.as_bytes()),
        Message::Image(b) => (IMAGE_TAG, b),
        Message::LegacyText(s) => (b"", s.as_bytes()),
    };
    let mut out = Vec::with_capacity(tag.len() + payload.len());
    out.extend_from_slice(tag);
    out.extend_from_slice(payload);
    out
}

pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    if let Some(rest) = bytes.strip_prefix(LOCATION_TAG) {
        // A LOCATION frame with bad text is an error; it must not fall through to IMAGE or legacy.
        return std::str::from_utf8(rest)
            .map(|s| Message::Location(s.to_owned()))
            .map_err(|_| DecodeError::InvalidLocationText);
    }
    if let Some(rest) = bytes.strip_prefix(IMAGE_TAG) {
        return Ok(Message::Image(rest.to_vec()));
    }
    std::str::from_utf8(bytes)
        .map(|s| Message::LegacyText(s.to_owned()))
        .map_err(|_| DecodeError::Unrecognized { len: bytes.len() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_roundtrip() {
        for s in ["Citadel of Ricks", "", "Planeta Cronenberg 🌍", "LOCATION:nested"] {
            let msg = Message::Location(s.to_string());
            assert_eq!(decode(&encode(&msg)).unwrap(), msg);
        }
    }

    #[test]
    fn image_roundtrip_with_arbitrary_bytes() {
        let blobs: [Vec<u8>; 4] = [
            vec![],
            vec![0xff, 0xd8, 0xff, 0xe0, 0x00, 0x10],
            (0..=255u8).collect(),
            b"IMAGE:IMAGE:".to_vec(),
        ];
        for b in blobs {
            let msg = Message::Image(b);
            assert_eq!(decode(&encode(&msg)).unwrap(), msg);
        }
    }

    #[test]
    fn wire_bytes_are_tag_then_payload() {
        assert_eq!(
            encode(&Message::Location("Anatomy Park".into())),
            b"LOCATION:Anatomy Park".to_vec()
        );
        assert_eq!(encode(&Message::Image(vec![1, 2, 3])), b"IMAGE:\x01\x02\x03".to_vec());
    }

    #[test]
    fn image_tag_wins_over_later_location_bytes() {
        let decoded = decode(b"IMAGE:LOCATION:Earth").unwrap();
        assert_eq!(decoded, Message::Image(b"LOCATION:Earth".to_vec()));
    }

    #[test]
    fn image_payload_is_not_validated() {
        let decoded = decode(b"IMAGE:\xff\xfe\x00").unwrap();
        assert_eq!(decoded, Message::Image(vec![0xff, 0xfe, 0x00]));
    }

    #[test]
    fn bad_location_text_does_not_fall_through() {
        assert_eq!(decode(b"LOCATION:\xff\xfe"), Err(DecodeError::InvalidLocationText));
    }

    #[test]
    fn tags_are_case_sensitive() {
        assert_eq!(
            decode(b"location:Earth").unwrap(),
            Message::LegacyText("location:Earth".into())
        );
        assert_eq!(decode(b"image:abc").unwrap(), Message::LegacyText("image:abc".into()));
    }

    #[test]
    fn short_prefixes_are_legacy_text() {
        assert_eq!(decode(b"LOCATION").unwrap(), Message::LegacyText("LOCATION".into()));
        assert_eq!(decode(b"IMAGE").unwrap(), Message::LegacyText("IMAGE".into()));
        assert_eq!(decode(b"").unwrap(), Message::LegacyText(String::new()));
    }

    #[test]
    fn untagged_text_is_legacy() {
        let msg = decode(b"Blips and Chitz").unwrap();
        assert_eq!(msg, Message::LegacyText("Blips and Chitz".into()));
        assert_eq!(msg.as_text(), Some("Blips and Chitz"));
    }

    #[test]
    fn untagged_binary_fails() {
        assert_eq!(decode(&[0x89, 0x50, 0x4e, 0x47]), Err(DecodeError::Unrecognized { len: 4 }));
    }
}
