//! Message envelope and its length-prefixed binary wire encoding.
//!
//! A frame on the wire is a big-endian `u32` body length followed by the
//! body:
//!
//! ```text
//! version:u8 | kind:u8 | ttl:u8
//! id_len:u8   | id bytes   (UTF-8)
//! from_len:u8 | from bytes (UTF-8)
//! to_len:u8   | to bytes   (UTF-8)
//! timestamp:i64 (microseconds since the Unix epoch)
//! payload_len:u32 | payload bytes
//! ```
//!
//! Encoding is deterministic: equal messages always produce identical
//! frames, and `decode(&encode(&m), max) == Ok(m)` for any `max` at least
//! as large as the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::NetworkError;
use crate::identity::PeerId;

/// Wire format version written into every frame.
pub const WIRE_VERSION: u8 = 1;

/// Size of the frame length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Longest id, sender or recipient string an envelope can carry.
pub const MAX_ID_LEN: usize = u8::MAX as usize;

/// Default maximum payload size (64 KiB).
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024;

/// Default relay hop budget for new messages.
pub const DEFAULT_TTL: u8 = 8;

/// Fixed-size part of a body: version, kind, ttl, three string length
/// bytes, timestamp and payload length.
const FIXED_BODY_LEN: usize = 3 + 3 + 8 + 4;

/// Largest body a message with `max_payload` bytes of payload can occupy.
pub fn max_body_len(max_payload: usize) -> usize {
    FIXED_BODY_LEN + 3 * MAX_ID_LEN + max_payload
}

/// The kind of message carried in a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// User-visible chat text.
    Text,
    /// Presence or status update.
    Status,
    /// Peer introduction and address exchange.
    Discovery,
}

impl MessageKind {
    fn tag(self) -> u8 {
        match self {
            Self::Text => 1,
            Self::Status => 2,
            Self::Discovery => 3,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Text),
            2 => Some(Self::Status),
            3 => Some(Self::Discovery),
            _ => None,
        }
    }

    /// Lowercase name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Status => "status",
            Self::Discovery => "discovery",
        }
    }
}

/// An immutable message envelope.
///
/// Fields are private: a message can only be obtained from
/// [`Message::create`] or [`decode`], both of which enforce the size
/// limits, so every value can be encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: String,
    kind: MessageKind,
    from: PeerId,
    to: PeerId,
    timestamp: DateTime<Utc>,
    ttl: u8,
    payload: Bytes,
}

impl Message {
    /// Create a new message with a fresh UUID v4 id and the current time.
    ///
    /// Fails with [`NetworkError::InvalidPayload`] if `payload` exceeds
    /// `max_payload` bytes or an address is empty or too long.
    pub fn create(
        kind: MessageKind,
        from: PeerId,
        to: PeerId,
        payload: impl Into<Bytes>,
        max_payload: usize,
    ) -> Result<Self, NetworkError> {
        let payload = payload.into();
        if payload.len() > max_payload {
            return Err(NetworkError::InvalidPayload(format!(
                "payload of {} bytes exceeds the {max_payload} byte limit",
                payload.len()
            )));
        }
        check_id("from", from.as_str()).map_err(NetworkError::InvalidPayload)?;
        check_id("to", to.as_str()).map_err(NetworkError::InvalidPayload)?;

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            from,
            to,
            timestamp: now_micros(),
            ttl: DEFAULT_TTL,
            payload,
        })
    }

    /// Create a UTF-8 text message.
    pub fn text(
        from: PeerId,
        to: PeerId,
        content: &str,
        max_payload: usize,
    ) -> Result<Self, NetworkError> {
        Self::create(
            MessageKind::Text,
            from,
            to,
            Bytes::copy_from_slice(content.as_bytes()),
            max_payload,
        )
    }

    /// Return this message with a different hop budget. Used while building
    /// a message, before it is sent.
    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    /// The copy a relay sends onward: same id, one hop less. `None` once the
    /// hop budget is spent.
    pub fn forwarded(&self) -> Option<Self> {
        let ttl = self.ttl.checked_sub(1)?;
        Some(Self {
            ttl,
            ..self.clone()
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn from(&self) -> &PeerId {
        &self.from
    }

    pub fn to(&self) -> &PeerId {
        &self.to
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// The payload as text, if it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    fn body_len(&self) -> usize {
        FIXED_BODY_LEN
            + self.id.len()
            + self.from.as_str().len()
            + self.to.as_str().len()
            + self.payload.len()
    }
}

fn now_micros() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::<Utc>::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

fn check_id(field: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{field} must not be empty"));
    }
    if value.len() > MAX_ID_LEN {
        return Err(format!(
            "{field} is {} bytes, longer than {MAX_ID_LEN}",
            value.len()
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a message into a self-delimiting frame.
pub fn encode(message: &Message) -> Bytes {
    let body_len = message.body_len();
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + body_len);

    buf.put_u32(body_len as u32);
    buf.put_u8(WIRE_VERSION);
    buf.put_u8(message.kind.tag());
    buf.put_u8(message.ttl);
    put_str8(&mut buf, &message.id);
    put_str8(&mut buf, message.from.as_str());
    put_str8(&mut buf, message.to.as_str());
    buf.put_i64(message.timestamp.timestamp_micros());
    buf.put_u32(message.payload.len() as u32);
    buf.put_slice(&message.payload);

    buf.freeze()
}

fn put_str8(buf: &mut BytesMut, value: &str) {
    buf.put_u8(value.len() as u8);
    buf.put_slice(value.as_bytes());
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode one complete frame (length prefix included). A payload longer
/// than `max_payload` is malformed.
pub fn decode(frame: &[u8], max_payload: usize) -> Result<Message, NetworkError> {
    let mut buf = frame;
    let body_len = take_u32(&mut buf, "length prefix")? as usize;
    if buf.remaining() != body_len {
        return Err(malformed(format!(
            "length prefix says {body_len} bytes, frame carries {}",
            buf.remaining()
        )));
    }
    decode_body(buf, max_payload)
}

/// Decode a frame body whose length prefix has already been consumed.
pub fn decode_body(body: &[u8], max_payload: usize) -> Result<Message, NetworkError> {
    let mut buf = body;

    let version = take_u8(&mut buf, "version")?;
    if version != WIRE_VERSION {
        return Err(malformed(format!("unsupported wire version {version}")));
    }
    let tag = take_u8(&mut buf, "kind")?;
    let kind =
        MessageKind::from_tag(tag).ok_or_else(|| malformed(format!("unknown kind tag {tag}")))?;
    let ttl = take_u8(&mut buf, "ttl")?;
    let id = take_str8(&mut buf, "id")?;
    let from = take_str8(&mut buf, "from")?;
    let to = take_str8(&mut buf, "to")?;
    for (field, value) in [("id", &id), ("from", &from), ("to", &to)] {
        check_id(field, value).map_err(malformed)?;
    }

    let micros = take_i64(&mut buf, "timestamp")?;
    let timestamp = DateTime::<Utc>::from_timestamp_micros(micros)
        .ok_or_else(|| malformed(format!("timestamp {micros} out of range")))?;

    let payload_len = take_u32(&mut buf, "payload length")? as usize;
    if payload_len > max_payload {
        return Err(malformed(format!(
            "payload of {payload_len} bytes exceeds the {max_payload} byte limit"
        )));
    }
    if buf.remaining() < payload_len {
        return Err(truncated("payload"));
    }
    let payload = Bytes::copy_from_slice(&buf[..payload_len]);
    buf.advance(payload_len);

    if buf.has_remaining() {
        return Err(malformed(format!(
            "{} trailing bytes after payload",
            buf.remaining()
        )));
    }

    Ok(Message {
        id,
        kind,
        from: PeerId::from_string(from),
        to: PeerId::from_string(to),
        timestamp,
        ttl,
        payload,
    })
}

fn malformed(reason: impl Into<String>) -> NetworkError {
    NetworkError::MalformedMessage(reason.into())
}

fn truncated(field: &str) -> NetworkError {
    malformed(format!("truncated at {field}"))
}

fn take_u8(buf: &mut &[u8], field: &str) -> Result<u8, NetworkError> {
    if buf.remaining() < 1 {
        return Err(truncated(field));
    }
    Ok(buf.get_u8())
}

fn take_u32(buf: &mut &[u8], field: &str) -> Result<u32, NetworkError> {
    if buf.remaining() < 4 {
        return Err(truncated(field));
    }
    Ok(buf.get_u32())
}

fn take_i64(buf: &mut &[u8], field: &str) -> Result<i64, NetworkError> {
    if buf.remaining() < 8 {
        return Err(truncated(field));
    }
    Ok(buf.get_i64())
}

fn take_str8(buf: &mut &[u8], field: &str) -> Result<String, NetworkError> {
    let len = take_u8(buf, field)? as usize;
    if buf.remaining() < len {
        return Err(truncated(field));
    }
    let value = std::str::from_utf8(&buf[..len])
        .map_err(|e| malformed(format!("{field} is not UTF-8: {e}")))?
        .to_string();
    buf.advance(len);
    Ok(value)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(kind: MessageKind, payload: &[u8]) -> Message {
        Message::create(
            kind,
            PeerId::from_string("peer-a"),
            PeerId::from_string("peer-b"),
            Bytes::copy_from_slice(payload),
            DEFAULT_MAX_PAYLOAD,
        )
        .unwrap()
    }

    #[test]
    fn test_message_creation() {
        let msg = Message::text(
            PeerId::from_string("peer-a"),
            PeerId::from_string("peer-b"),
            "hello mesh",
            DEFAULT_MAX_PAYLOAD,
        )
        .unwrap();

        assert_eq!(msg.kind(), MessageKind::Text);
        assert_eq!(msg.from().as_str(), "peer-a");
        assert_eq!(msg.to().as_str(), "peer-b");
        assert_eq!(msg.ttl(), DEFAULT_TTL);
        assert_eq!(msg.payload_str(), Some("hello mesh"));
        assert!(uuid::Uuid::parse_str(msg.id()).is_ok());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = sample(MessageKind::Status, b"");
        let b = sample(MessageKind::Status, b"");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let result = Message::create(
            MessageKind::Text,
            PeerId::from_string("peer-a"),
            PeerId::from_string("peer-b"),
            vec![0u8; 17],
            16,
        );
        assert!(matches!(result, Err(NetworkError::InvalidPayload(_))));

        let at_limit = Message::create(
            MessageKind::Text,
            PeerId::from_string("peer-a"),
            PeerId::from_string("peer-b"),
            vec![0u8; 16],
            16,
        );
        assert!(at_limit.is_ok());
    }

    #[test]
    fn test_bad_addresses_rejected() {
        let empty = Message::create(
            MessageKind::Text,
            PeerId::from_string(""),
            PeerId::from_string("peer-b"),
            Bytes::new(),
            DEFAULT_MAX_PAYLOAD,
        );
        assert!(matches!(empty, Err(NetworkError::InvalidPayload(_))));

        let long = Message::create(
            MessageKind::Text,
            PeerId::from_string("peer-a"),
            PeerId::from_string("x".repeat(MAX_ID_LEN + 1)),
            Bytes::new(),
            DEFAULT_MAX_PAYLOAD,
        );
        assert!(matches!(long, Err(NetworkError::InvalidPayload(_))));
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let messages = [
            sample(MessageKind::Text, "héllo wörld".as_bytes()),
            sample(MessageKind::Status, b""),
            sample(MessageKind::Discovery, &[0, 159, 255, 10]).with_ttl(0),
            Message::create(
                MessageKind::Text,
                PeerId::generate(),
                PeerId::broadcast(),
                vec![7u8; DEFAULT_MAX_PAYLOAD],
                DEFAULT_MAX_PAYLOAD,
            )
            .unwrap(),
        ];

        for msg in messages {
            let frame = encode(&msg);
            assert_eq!(decode(&frame, DEFAULT_MAX_PAYLOAD).unwrap(), msg);
        }
    }

    #[test]
    fn test_encoding_is_deterministic_and_self_delimiting() {
        let msg = sample(MessageKind::Text, b"payload");
        let a = encode(&msg);
        let b = encode(&msg.clone());
        assert_eq!(a, b);

        let body_len = u32::from_be_bytes([a[0], a[1], a[2], a[3]]) as usize;
        assert_eq!(body_len, a.len() - LENGTH_PREFIX_LEN);
        assert!(body_len <= max_body_len(DEFAULT_MAX_PAYLOAD));
        assert_eq!(
            decode_body(&a[LENGTH_PREFIX_LEN..], DEFAULT_MAX_PAYLOAD).unwrap(),
            msg
        );
    }

    #[test]
    fn test_every_truncation_is_malformed() {
        let frame = encode(&sample(MessageKind::Text, b"abc"));
        for cut in 0..frame.len() {
            let result = decode(&frame[..cut], DEFAULT_MAX_PAYLOAD);
            assert!(
                matches!(result, Err(NetworkError::MalformedMessage(_))),
                "cut at {cut} decoded"
            );
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let frame = encode(&sample(MessageKind::Text, b"abc"));
        let mut body = frame[LENGTH_PREFIX_LEN..].to_vec();
        body.push(0);
        assert!(matches!(
            decode_body(&body, DEFAULT_MAX_PAYLOAD),
            Err(NetworkError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_unknown_kind_and_version_rejected() {
        let frame = encode(&sample(MessageKind::Text, b"abc"));

        let mut bad_version = frame.to_vec();
        bad_version[LENGTH_PREFIX_LEN] = 9;
        assert!(matches!(
            decode(&bad_version, DEFAULT_MAX_PAYLOAD),
            Err(NetworkError::MalformedMessage(_))
        ));

        let mut bad_kind = frame.to_vec();
        bad_kind[LENGTH_PREFIX_LEN + 1] = 42;
        assert!(matches!(
            decode(&bad_kind, DEFAULT_MAX_PAYLOAD),
            Err(NetworkError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_invalid_utf8_id_rejected() {
        let frame = encode(&sample(MessageKind::Text, b"abc"));
        let mut bad = frame.to_vec();
        // First byte of the id string.
        bad[LENGTH_PREFIX_LEN + 4] = 0xFF;
        assert!(matches!(
            decode(&bad, DEFAULT_MAX_PAYLOAD),
            Err(NetworkError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_payload_over_limit_rejected_on_decode() {
        let msg = Message::create(
            MessageKind::Text,
            PeerId::from_string("a"),
            PeerId::from_string("b"),
            vec![1u8; 1500],
            2048,
        )
        .unwrap();
        let frame = encode(&msg);

        // Short ids leave room in the body limit for a larger payload.
        assert!(frame.len() - LENGTH_PREFIX_LEN <= max_body_len(1024));
        assert!(matches!(
            decode(&frame, 1024),
            Err(NetworkError::MalformedMessage(_))
        ));
        assert!(matches!(
            decode_body(&frame[LENGTH_PREFIX_LEN..], 1499),
            Err(NetworkError::MalformedMessage(_))
        ));
        assert_eq!(decode(&frame, 1500).unwrap(), msg);
    }

    #[test]
    fn test_forwarded_spends_one_hop() {
        let msg = sample(MessageKind::Text, b"hop").with_ttl(2);
        let once = msg.forwarded().unwrap();
        assert_eq!(once.ttl(), 1);
        assert_eq!(once.id(), msg.id());
        assert_eq!(once.payload(), msg.payload());

        let twice = once.forwarded().unwrap();
        assert_eq!(twice.ttl(), 0);
        assert!(twice.forwarded().is_none());
    }

    #[test]
    fn test_timestamp_has_microsecond_precision() {
        let msg = sample(MessageKind::Status, b"");
        assert_eq!(msg.timestamp().timestamp_subsec_nanos() % 1_000, 0);
    }
}
