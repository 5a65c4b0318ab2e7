//! Kernel wire protocol
//!
//! Every frame is an 8-byte big-endian header followed by a MessagePack body:
//!
//! ```text
//! [u16 magic = 0x4B41 "KA"][u8 version = 1][u8 type][u32 length][length bytes]
//! ```
//!
//! Decoding never consumes a partial frame: [`decode`] returns `Ok(None)` until
//! the whole frame is buffered, so callers keep the remainder and retry after
//! the next read. A bad magic, version or type is fatal for the connection.

use bytes::{Buf, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use thiserror::Error;

pub const MAGIC: u16 = 0x4B41;
pub const VERSION: u8 = 1;
pub const HEADER_SIZE: usize = 8;

/// Upper bound on a single payload; a header announcing more is rejected
/// before any of the body is buffered.
pub const MAX_PAYLOAD: usize = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid magic bytes: {0:#06x}")]
    InvalidMagic(u16),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("unknown packet type: {0}")]
    UnknownPacketType(u8),

    #[error("payload of {0} bytes exceeds the frame size limit")]
    PayloadTooLarge(usize),

    #[error("failed to encode payload: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("failed to decode payload: {0}")]
    Decode(String),
}

/// Frame type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    Request = 0x01,
    Response = 0x02,
    Event = 0x03,
    StreamChunk = 0x04,
}

impl PacketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketKind::Request => "request",
            PacketKind::Response => "response",
            PacketKind::Event => "event",
            PacketKind::StreamChunk => "stream_chunk",
        }
    }
}

impl TryFrom<u8> for PacketKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PacketKind::Request),
            0x02 => Ok(PacketKind::Response),
            0x03 => Ok(PacketKind::Event),
            0x04 => Ok(PacketKind::StreamChunk),
            other => Err(ProtocolError::UnknownPacketType(other)),
        }
    }
}

/// A decoded frame with its still-dynamic payload
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub kind: PacketKind,
    pub payload: rmpv::Value,
}

impl Packet {
    /// Deserialize the payload into a concrete type
    pub fn into_payload<T: DeserializeOwned>(self) -> Result<T, ProtocolError> {
        rmpv::ext::from_value(self.payload).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Result of a successful [`decode`]
#[derive(Debug)]
pub struct Decoded {
    pub packet: Packet,
    /// Bytes of the input occupied by this frame
    pub consumed: usize,
}

/// Encode a payload into a complete frame
pub fn encode<T: Serialize + ?Sized>(kind: PacketKind, payload: &T) -> Result<Vec<u8>, ProtocolError> {
    let body = rmp_serde::to_vec_named(payload)?;
    if body.len() > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(body.len()));
    }

    let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
    frame.extend_from_slice(&MAGIC.to_be_bytes());
    frame.push(VERSION);
    frame.push(kind as u8);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode the first frame of `buf`.
///
/// Returns `Ok(None)` when fewer than [`HEADER_SIZE`] bytes, or fewer than the
/// announced frame length, are available.
pub fn decode(buf: &[u8]) -> Result<Option<Decoded>, ProtocolError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let magic = u16::from_be_bytes([buf[0], buf[1]]);
    if magic != MAGIC {
        return Err(ProtocolError::InvalidMagic(magic));
    }

    let version = buf[2];
    if version != VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    let kind = PacketKind::try_from(buf[3])?;
    let length = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    if length > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(length));
    }

    let total = HEADER_SIZE + length;
    if buf.len() < total {
        return Ok(None);
    }

    let mut body = &buf[HEADER_SIZE..total];
    let payload =
        rmpv::decode::read_value(&mut body).map_err(|e| ProtocolError::Decode(e.to_string()))?;

    Ok(Some(Decoded {
        packet: Packet { kind, payload },
        consumed: total,
    }))
}

/// Per-connection accumulation buffer for the decode loop.
///
/// One socket read may carry zero, one or several frames, and one frame may
/// span several reads; call [`FrameBuffer::next_packet`] until it yields `None`.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn next_packet(&mut self) -> Result<Option<Packet>, ProtocolError> {
        match decode(&self.buf)? {
            Some(decoded) => {
                self.buf.advance(decoded.consumed);
                Ok(Some(decoded.packet))
            }
            None => Ok(None),
        }
    }

    /// Bytes currently buffered (an incomplete frame, if any)
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Which standard stream a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdStream {
    Stdout,
    Stderr,
}

impl StdStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            StdStream::Stdout => "stdout",
            StdStream::Stderr => "stderr",
        }
    }
}

/// REQUEST body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "P: Deserialize<'de>"))]
pub struct RequestPayload<P = rmpv::Value> {
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<P>,
}

/// RESPONSE body; exactly one of `result` / `error` is set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponsePayload {
    pub fn ok(id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(error.into()),
        }
    }
}

/// EVENT body forwarded from the event bus to topic subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub topic: String,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub source: String,
    pub time: String,
    pub id: String,
}

/// EVENT body for kernel notices (`process.exit`, `stream.overflow`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoticePayload {
    pub topic: String,
    pub data: serde_json::Value,
}

/// STREAM_CHUNK body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChunkPayload {
    pub subscription_id: String,
    pub stream: StdStream,
    pub data: ByteBuf,
    pub sequence: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmpv::Value;

    fn sample_payload() -> Value {
        Value::Map(vec![
            (Value::from("id"), Value::from("req-1")),
            (Value::from("method"), Value::from("process.spawn")),
            (
                Value::from("params"),
                Value::Map(vec![
                    (
                        Value::from("command"),
                        Value::Array(vec![Value::from("cat"), Value::from("-n")]),
                    ),
                    (Value::from("limit"), Value::from(-42i64)),
                    (Value::from("blob"), Value::Binary(vec![0, 159, 255])),
                ]),
            ),
        ])
    }

    #[test]
    fn test_roundtrip_every_kind() {
        for kind in [
            PacketKind::Request,
            PacketKind::Response,
            PacketKind::Event,
            PacketKind::StreamChunk,
        ] {
            let frame = encode(kind, &sample_payload()).unwrap();
            let decoded = decode(&frame).unwrap().unwrap();
            assert_eq!(decoded.consumed, frame.len());
            assert_eq!(decoded.packet.kind, kind);
            assert_eq!(decoded.packet.payload, sample_payload());
        }
    }

    #[test]
    fn test_header_layout() {
        let frame = encode(PacketKind::Event, &Value::Nil).unwrap();
        assert_eq!(&frame[..4], &[0x4B, 0x41, 0x01, 0x03]);
        let len = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
        assert_eq!(len, frame.len() - HEADER_SIZE);
    }

    #[test]
    fn test_incomplete_prefixes_yield_none() {
        let frame = encode(PacketKind::Request, &sample_payload()).unwrap();
        for cut in 0..frame.len() {
            assert!(decode(&frame[..cut]).unwrap().is_none(), "prefix of {cut} bytes");
        }
    }

    #[test]
    fn test_frame_split_across_reads() {
        let frame = encode(PacketKind::Request, &sample_payload()).unwrap();

        for split in 1..frame.len() {
            let mut buffer = FrameBuffer::new();
            buffer.extend(&frame[..split]);
            assert!(buffer.next_packet().unwrap().is_none());
            buffer.extend(&frame[split..]);

            let packet = buffer.next_packet().unwrap().expect("complete frame");
            assert_eq!(packet.payload, sample_payload());
            assert!(buffer.next_packet().unwrap().is_none());
            assert!(buffer.is_empty());
        }
    }

    #[test]
    fn test_multi_frame_drain_in_order() {
        let first = encode(PacketKind::Request, &Value::from("first")).unwrap();
        let second = encode(PacketKind::Event, &Value::from("second")).unwrap();

        let mut buffer = FrameBuffer::new();
        buffer.extend(&[first, second].concat());

        let a = buffer.next_packet().unwrap().unwrap();
        let b = buffer.next_packet().unwrap().unwrap();
        assert_eq!((a.kind, a.payload), (PacketKind::Request, Value::from("first")));
        assert_eq!((b.kind, b.payload), (PacketKind::Event, Value::from("second")));
        assert!(buffer.next_packet().unwrap().is_none());
    }

    #[test]
    fn test_trailing_partial_frame_is_retained() {
        let first = encode(PacketKind::Response, &Value::from(1)).unwrap();
        let second = encode(PacketKind::Response, &Value::from(2)).unwrap();

        let mut buffer = FrameBuffer::new();
        buffer.extend(&first);
        buffer.extend(&second[..5]);

        assert!(buffer.next_packet().unwrap().is_some());
        assert!(buffer.next_packet().unwrap().is_none());
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn test_bad_magic_is_fatal() {
        let mut frame = encode(PacketKind::Request, &Value::Nil).unwrap();
        frame[0] = 0xFF;
        assert!(matches!(decode(&frame), Err(ProtocolError::InvalidMagic(_))));
    }

    #[test]
    fn test_bad_version_is_fatal() {
        let mut frame = encode(PacketKind::Request, &Value::Nil).unwrap();
        frame[2] = 2;
        assert!(matches!(
            decode(&frame),
            Err(ProtocolError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn test_unknown_type_is_fatal() {
        let mut frame = encode(PacketKind::Request, &Value::Nil).unwrap();
        frame[3] = 9;
        assert!(matches!(
            decode(&frame),
            Err(ProtocolError::UnknownPacketType(9))
        ));
    }

    #[test]
    fn test_oversized_length_rejected_from_header() {
        let mut header = Vec::new();
        header.extend_from_slice(&MAGIC.to_be_bytes());
        header.push(VERSION);
        header.push(PacketKind::Request as u8);
        header.extend_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            decode(&header),
            Err(ProtocolError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn test_typed_payloads() {
        let request = RequestPayload {
            id: "r1".to_string(),
            method: "process.kill".to_string(),
            params: Some(serde_json::json!({ "id": "p1" })),
        };
        let frame = encode(PacketKind::Request, &request).unwrap();
        let packet = decode(&frame).unwrap().unwrap().packet;
        let back: RequestPayload = packet.into_payload().unwrap();
        assert_eq!(back.id, "r1");
        assert_eq!(back.method, "process.kill");
        assert!(back.params.is_some());

        let chunk = StreamChunkPayload {
            subscription_id: "stream_1".to_string(),
            stream: StdStream::Stderr,
            data: ByteBuf::from(b"oops\n".to_vec()),
            sequence: 7,
        };
        let frame = encode(PacketKind::StreamChunk, &chunk).unwrap();
        let back: StreamChunkPayload = decode(&frame).unwrap().unwrap().packet.into_payload().unwrap();
        assert_eq!(back, chunk);
    }

    #[test]
    fn test_response_without_params_or_result() {
        let response = ResponsePayload::err("r2", "Unknown method: nope");
        let frame = encode(PacketKind::Response, &response).unwrap();
        let back: ResponsePayload = decode(&frame).unwrap().unwrap().packet.into_payload().unwrap();
        assert_eq!(back.id, "r2");
        assert!(back.result.is_none());
        assert_eq!(back.error.as_deref(), Some("Unknown method: nope"));
    }
}
