//! Encoding and decoding of logical messages.
//!
//! The session layer only depends on [`MessageEncoder`]. [`CborEncoder`] is
//! the reference implementation used by the bundled transports: the message
//! is serialized as canonical CBOR and carried in a length-prefixed frame
//! whose body is protected by a CRC-32.
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 frame_len        | length of bytes that follow|
//! +----------------------+----------------------------+
//! | u32 crc32            | checksum of the body       |
//! +----------------------+----------------------------+
//! | body                 | CBOR-encoded Message       |
//! +----------------------+----------------------------+
//! ```

use crate::message::Message;
use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

/// Content type produced by [`CborEncoder`]
pub const CBOR_CONTENT_TYPE: &str = "application/x-wsrm+cbor";

/// Default maximum encoded message size (4 MiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Hard maximum frame size accepted by [`FrameDecoder`] (64 MiB)
pub const HARD_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Size of the frame prefix (length + checksum)
pub const FRAME_PREFIX_SIZE: usize = 8;

/// Converts logical messages to and from bytes
pub trait MessageEncoder: Send + Sync {
    /// Content type of the encoded form
    fn content_type(&self) -> &'static str;

    /// Encode `message`, failing if the result exceeds `max_size`
    fn encode(&self, message: &Message, max_size: usize) -> Result<Bytes, WireError>;

    /// Decode a message body of the given content type
    fn decode(&self, bytes: &[u8], content_type: &str) -> Result<Message, WireError>;
}

/// CBOR encoder
#[derive(Debug, Clone, Copy, Default)]
pub struct CborEncoder;

impl CborEncoder {
    /// Create a new encoder
    pub fn new() -> Self {
        Self
    }
}

impl MessageEncoder for CborEncoder {
    fn content_type(&self) -> &'static str {
        CBOR_CONTENT_TYPE
    }

    fn encode(&self, message: &Message, max_size: usize) -> Result<Bytes, WireError> {
        message.validate()?;

        let mut buf = Vec::new();
        ciborium::into_writer(message, &mut buf).map_err(|e| WireError::Encode(e.to_string()))?;

        if buf.len() > max_size {
            return Err(WireError::Size(buf.len()));
        }

        trace!("Encoded {:?} message {} ({} bytes)", message.action, message.id(), buf.len());
        Ok(Bytes::from(buf))
    }

    fn decode(&self, bytes: &[u8], content_type: &str) -> Result<Message, WireError> {
        if content_type != CBOR_CONTENT_TYPE {
            return Err(WireError::ContentType(content_type.to_string()));
        }

        let message: Message =
            ciborium::from_reader(bytes).map_err(|e| WireError::Decode(e.to_string()))?;
        message.validate()?;
        Ok(message)
    }
}

/// Wrap an encoded body into a frame
pub fn encode_frame(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_PREFIX_SIZE + body.len());
    buf.put_u32((body.len() + 4) as u32);
    buf.put_u32(crc32fast::hash(body));
    buf.put_slice(body);
    buf.freeze()
}

/// Frame decoder for reassembling frames from a byte stream
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_MESSAGE_SIZE + 4,
        }
    }

    /// Create a decoder with a custom frame size limit (capped at the hard limit)
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(HARD_MAX_FRAME_SIZE),
        }
    }

    /// Decode one frame body from a buffer, consuming it
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
        // Need at least 4 bytes for frame length
        if buf.len() < 4 {
            return Ok(None);
        }

        let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

        if frame_len > self.max_frame_size {
            return Err(WireError::Size(frame_len));
        }
        if frame_len < 4 {
            return Err(WireError::Malformed("frame shorter than checksum"));
        }

        if buf.len() < 4 + frame_len {
            return Ok(None);
        }

        buf.advance(4);
        let mut frame = buf.split_to(frame_len).freeze();
        let expected = frame.get_u32();

        if crc32fast::hash(&frame) != expected {
            return Err(WireError::Checksum);
        }

        Ok(Some(frame))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{SequenceAcknowledgement, SequenceId};
    use crate::range::SequenceRange;
    use crate::version::ProtocolVersion;
    use smallvec::smallvec;

    #[test]
    fn test_cbor_message_through_frame() {
        let encoder = CborEncoder::new();
        let id = SequenceId::generate();
        let ack = SequenceAcknowledgement {
            id,
            ranges: smallvec![SequenceRange::new(1, 3).unwrap(), SequenceRange::single(5).unwrap()],
            final_ack: false,
            buffer_remaining: Some(7),
        };
        let msg = Message::sequenced(
            ProtocolVersion::WsReliableMessaging11,
            id,
            6,
            Bytes::from_static(b"payload"),
        )
        .with_acknowledgement(ack);

        let body = encoder.encode(&msg, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        let mut stream = BytesMut::from(encode_frame(&body).as_ref());

        let mut decoder = FrameDecoder::new();
        let frame = decoder.decode(&mut stream).unwrap().unwrap();
        assert!(stream.is_empty());

        let decoded = encoder.decode(&frame, CBOR_CONTENT_TYPE).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let frame = encode_frame(b"abcdef");
        let mut decoder = FrameDecoder::new();

        let mut buf = BytesMut::from(&frame[..5]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[5..]);
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap(), Bytes::from_static(b"abcdef"));
    }

    #[test]
    fn test_corrupted_frame_rejected() {
        let frame = encode_frame(b"abcdef");
        let mut corrupted = BytesMut::from(frame.as_ref());
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xFF;

        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.decode(&mut corrupted), Err(WireError::Checksum));
    }

    #[test]
    fn test_size_limit_enforced() {
        let encoder = CborEncoder::new();
        let msg = Message::sequenced(
            ProtocolVersion::WsReliableMessaging11,
            SequenceId::generate(),
            1,
            Bytes::from(vec![0u8; 1024]),
        );
        assert!(matches!(encoder.encode(&msg, 128), Err(WireError::Size(_))));
    }

    #[test]
    fn test_wrong_content_type() {
        let encoder = CborEncoder::new();
        assert!(matches!(
            encoder.decode(b"", "text/xml"),
            Err(WireError::ContentType(_))
        ));
    }
}
