//! Response and chunk header processing for the wire protocol.
//!
//! This module defines the two fixed-size header shapes the server sends:
//! the 17-byte message header used on the simple request/response path, and
//! the 17-byte chunked-response header followed by 5-byte per-chunk headers
//! on the streamed path.

use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};

/// Fixed message header size in bytes (simple and chunked-response shapes)
pub const MESSAGE_HEADER_SIZE: usize = 17;

/// Per-chunk header size in bytes
pub const CHUNK_HEADER_SIZE: usize = 5;

bitflags! {
    /// Flags byte carried on each chunk
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChunkFlags: u8 {
        /// This is the final chunk of the reply
        const LAST_CHUNK = 0x01;
    }
}

/// Simple response header (17 bytes on the wire).
///
/// Only the message type and body length are decoded here; the remaining
/// 9 header bytes are carried through opaquely with the rest of the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Message type
    pub message_type: i32,
    /// Body length in bytes, excluding the header itself
    pub message_len: i32,
}

impl MessageHeader {
    /// Decode from the leading bytes of a 17-byte header buffer (big-endian)
    pub fn decode(buf: &[u8]) -> Result<Self, crate::WireError> {
        if buf.len() < MESSAGE_HEADER_SIZE {
            return Err(crate::WireError::Incomplete);
        }

        let mut buf = &buf[..];
        let message_type = buf.get_i32();
        let message_len = buf.get_i32();

        Ok(Self {
            message_type,
            message_len,
        })
    }
}

/// Per-chunk header (5 bytes on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Chunk body length in bytes
    pub len: i32,
    /// Chunk flags; bit 0 marks the last chunk
    pub flags: ChunkFlags,
}

impl ChunkHeader {
    /// Encode the chunk header to bytes (big-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.len);
        buf.put_u8(self.flags.bits());
    }

    /// Decode the chunk header from bytes (big-endian)
    pub fn decode(buf: &[u8]) -> Result<Self, crate::WireError> {
        if buf.len() < CHUNK_HEADER_SIZE {
            return Err(crate::WireError::Incomplete);
        }

        let mut buf = &buf[..];
        let len = buf.get_i32();
        let flags = ChunkFlags::from_bits_retain(buf.get_u8());

        if len < 0 {
            return Err(crate::WireError::Length(len));
        }

        Ok(Self { len, flags })
    }

    /// Whether this chunk terminates the stream
    pub fn is_last(&self) -> bool {
        self.flags.contains(ChunkFlags::LAST_CHUNK)
    }
}

/// Chunked response header (17 bytes on the wire).
///
/// Sent once at the start of a streamed reply; embeds the header of the
/// first chunk so the body read can begin immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkedResponseHeader {
    /// Message type of the overall reply
    pub message_type: i32,
    /// Number of parts the server intends to send
    pub number_of_parts: i32,
    /// Transaction id correlating the reply with its request
    pub transaction_id: i32,
    /// Header of the first chunk
    pub chunk: ChunkHeader,
}

impl ChunkedResponseHeader {
    /// Encode the chunked response header to bytes (big-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.message_type);
        buf.put_i32(self.number_of_parts);
        buf.put_i32(self.transaction_id);
        self.chunk.encode(buf);
    }

    /// Decode the chunked response header from bytes (big-endian)
    pub fn decode(buf: &[u8]) -> Result<Self, crate::WireError> {
        if buf.len() < MESSAGE_HEADER_SIZE {
            return Err(crate::WireError::Incomplete);
        }

        let mut head = &buf[..];
        let message_type = head.get_i32();
        let number_of_parts = head.get_i32();
        let transaction_id = head.get_i32();
        let chunk = ChunkHeader::decode(&buf[MESSAGE_HEADER_SIZE - CHUNK_HEADER_SIZE..])?;

        Ok(Self {
            message_type,
            number_of_parts,
            transaction_id,
            chunk,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_header_decode() {
        let mut buf = BytesMut::new();
        buf.put_i32(42);
        buf.put_i32(128);
        buf.put_i32(1); // parts, opaque on the simple path
        buf.put_i32(7); // transaction id, opaque on the simple path
        buf.put_u8(0);

        let header = MessageHeader::decode(&buf).unwrap();
        assert_eq!(header.message_type, 42);
        assert_eq!(header.message_len, 128);
    }

    #[test]
    fn test_message_header_incomplete() {
        assert!(matches!(
            MessageHeader::decode(&[0u8; 8]),
            Err(crate::WireError::Incomplete)
        ));
    }

    #[test]
    fn test_chunk_header_roundtrip() {
        let header = ChunkHeader {
            len: 512,
            flags: ChunkFlags::LAST_CHUNK,
        };

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), CHUNK_HEADER_SIZE);

        let decoded = ChunkHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.is_last());
    }

    #[test]
    fn test_chunk_header_negative_length() {
        let mut buf = BytesMut::new();
        buf.put_i32(-1);
        buf.put_u8(0);
        assert!(matches!(
            ChunkHeader::decode(&buf),
            Err(crate::WireError::Length(-1))
        ));
    }

    #[test]
    fn test_chunk_header_retains_unknown_flag_bits() {
        let mut buf = BytesMut::new();
        buf.put_i32(16);
        buf.put_u8(0x81);

        let decoded = ChunkHeader::decode(&buf).unwrap();
        assert!(decoded.is_last());
        assert_eq!(decoded.flags.bits(), 0x81);
    }

    #[test]
    fn test_chunked_response_header_roundtrip() {
        let header = ChunkedResponseHeader {
            message_type: 9,
            number_of_parts: 3,
            transaction_id: 77,
            chunk: ChunkHeader {
                len: 1024,
                flags: ChunkFlags::empty(),
            },
        };

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), MESSAGE_HEADER_SIZE);

        let decoded = ChunkedResponseHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
        assert!(!decoded.chunk.is_last());
    }
}
