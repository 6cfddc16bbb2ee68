//! Wire protocol headers, handshake encoding, and chunk framing for the cache client.
//!
//! This crate provides the low-level wire protocol pieces the connection layer
//! is built on: the fixed response headers, the handshake message layout and
//! its constants, and the per-chunk framing used by streamed replies. It is
//! pure encode/decode; all socket I/O and timeout handling lives in the
//! connection crate.
//!
//! ## Features
//!
//! - **Fixed Headers**: 17-byte message header, 5-byte chunk header
//! - **Zero-Copy Buffers**: Uses `Bytes`/`BytesMut` for minimal allocations
//! - **Handshake Layout**: channel roles, acceptance codes, identity encoding
//! - **Message Builder**: header + length-prefixed parts
//!
//! ## Wire Format
//!
//! ```text
//! Simple response:
//! +----------------------+----------------------------+
//! | i32 message_type     |                            |
//! | i32 message_len      | body length after header   |
//! | i32 number_of_parts  | opaque on this path        |
//! | i32 transaction_id   | opaque on this path        |
//! | u8  flags            | opaque on this path        |
//! +----------------------+----------------------------+
//! | body                 | message_len bytes          |
//! +----------------------+----------------------------+
//!
//! Chunked response:
//! +----------------------+----------------------------+
//! | i32 message_type     |                            |
//! | i32 number_of_parts  |                            |
//! | i32 transaction_id   |                            |
//! | i32 chunk_len        | first chunk header,        |
//! | u8  chunk_flags      | bit 0 = last chunk         |
//! +----------------------+----------------------------+
//! | chunk body           | then 5-byte chunk headers  |
//! | ...                  | until LAST_CHUNK is set    |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod handshake;
pub mod header;
pub mod message;

// Re-export main types
pub use error::WireError;
pub use handshake::{
    put_array_len, put_ascii_string, tags, AcceptanceCode, ChannelRole, Credentials,
    HandshakeRequest, MembershipId, SecurityMode, ServerQueueStatus, ARRAY_LEN_I16, ARRAY_LEN_I32,
    PROTOCOL_ORDINAL, READ_TIMEOUT_SENTINEL,
};
pub use header::{
    ChunkFlags, ChunkHeader, ChunkedResponseHeader, MessageHeader, CHUNK_HEADER_SIZE,
    MESSAGE_HEADER_SIZE,
};
pub use message::{MessageBuilder, MessageType};
