//! Game message definitions
//!
//! A game message is a frame payload that starts with a 2 byte type tag
//! (little-endian) followed by a type-specific body.

use bytes::{BufMut, Bytes, BytesMut};

/// Size of the type tag in front of every game message
pub const TYPE_TAG_SIZE: usize = 2;

/// Game message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum GameMessageType {
    Invalid = 0,
    /// Client -> server, body = client player name
    Handshake1 = 1,
    /// Server -> client, body = server player name
    Handshake2 = 2,
    /// Client -> server, empty body
    Handshake3 = 3,
}

impl GameMessageType {
    /// Map a raw tag to a message type; unknown tags become `Invalid`
    pub fn from_tag(tag: u16) -> Self {
        match tag {
            1 => GameMessageType::Handshake1,
            2 => GameMessageType::Handshake2,
            3 => GameMessageType::Handshake3,
            _ => GameMessageType::Invalid,
        }
    }

    pub fn tag(self) -> u16 {
        self as u16
    }
}

/// A decoded game message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameMessage {
    pub message_type: GameMessageType,
    pub body: Bytes,
}

impl GameMessage {
    pub fn new(message_type: GameMessageType, body: impl Into<Bytes>) -> Self {
        Self {
            message_type,
            body: body.into(),
        }
    }

    /// First handshake message, carrying the client's name
    pub fn handshake1(client_name: &str) -> Self {
        Self::new(
            GameMessageType::Handshake1,
            Bytes::copy_from_slice(client_name.as_bytes()),
        )
    }

    /// Second handshake message, carrying the server's name
    pub fn handshake2(server_name: &str) -> Self {
        Self::new(
            GameMessageType::Handshake2,
            Bytes::copy_from_slice(server_name.as_bytes()),
        )
    }

    /// Final handshake acknowledgement
    pub fn handshake3() -> Self {
        Self::new(GameMessageType::Handshake3, Bytes::new())
    }

    /// Interpret the body as a player name
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Serialize into a frame payload
    pub fn to_payload(&self) -> Bytes {
        wrap(self.message_type, &self.body)
    }

    /// Parse a frame payload
    pub fn from_payload(payload: Bytes) -> Self {
        unwrap(payload)
    }
}

/// Prepend the type tag to `body`
pub fn wrap(message_type: GameMessageType, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(TYPE_TAG_SIZE + body.len());
    buf.put_u16_le(message_type.tag());
    buf.put_slice(body);
    buf.freeze()
}

/// Split a payload into its type and body.
///
/// This never fails: a payload too short to hold a tag comes back whole as an
/// `Invalid` message, so callers have to look at the type.
pub fn unwrap(mut payload: Bytes) -> GameMessage {
    if payload.len() < TYPE_TAG_SIZE {
        return GameMessage::new(GameMessageType::Invalid, payload);
    }

    let body = payload.split_off(TYPE_TAG_SIZE);
    let tag = u16::from_le_bytes([payload[0], payload[1]]);
    GameMessage::new(GameMessageType::from_tag(tag), body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_layout() {
        let payload = wrap(GameMessageType::Handshake2, b"Bob");
        assert_eq!(&payload[..], &[0x02, 0x00, b'B', b'o', b'b']);
    }

    #[test]
    fn test_wrap_unwrap() {
        let message = unwrap(GameMessage::handshake1("Alice").to_payload());
        assert_eq!(message.message_type, GameMessageType::Handshake1);
        assert_eq!(message.body_text(), "Alice");

        let ack = GameMessage::from_payload(GameMessage::handshake3().to_payload());
        assert_eq!(ack.message_type, GameMessageType::Handshake3);
        assert!(ack.body.is_empty());
    }

    #[test]
    fn test_short_payload_is_invalid() {
        let empty = unwrap(Bytes::new());
        assert_eq!(empty.message_type, GameMessageType::Invalid);
        assert!(empty.body.is_empty());

        let single = unwrap(Bytes::from_static(&[0x01]));
        assert_eq!(single.message_type, GameMessageType::Invalid);
        assert_eq!(&single.body[..], &[0x01]);
    }

    #[test]
    fn test_unknown_tags_clamped_to_invalid() {
        for tag in [0u16, 4, 5, 0x0100, u16::MAX] {
            let mut payload = tag.to_le_bytes().to_vec();
            payload.extend_from_slice(b"body");
            let message = unwrap(Bytes::from(payload));
            assert_eq!(message.message_type, GameMessageType::Invalid, "tag {}", tag);
            assert_eq!(&message.body[..], b"body");
        }
    }

    #[test]
    fn test_tag_roundtrip_for_known_types() {
        for kind in [
            GameMessageType::Handshake1,
            GameMessageType::Handshake2,
            GameMessageType::Handshake3,
        ] {
            assert_eq!(GameMessageType::from_tag(kind.tag()), kind);
        }
    }

    #[test]
    fn test_non_utf8_name_is_lossy() {
        let message = GameMessage::new(GameMessageType::Handshake1, vec![b'A', 0xFF]);
        assert_eq!(message.body_text(), "A\u{FFFD}");
    }
}
