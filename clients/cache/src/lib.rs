//! Client-side connection layer for the cache server wire protocol.
//!
//! This crate re-exports the two layers the client is built from:
//!
//! - [`wire`]: pure encode/decode of the protocol (headers, handshake
//!   layout, chunk framing)
//! - [`conn`]: connection lifecycle on top of it (transport, handshake
//!   exchange, framed I/O, chunked replies, pool-facing bookkeeping)
//!
//! Typical use: build a [`PoolContext`] and an [`Endpoint`], create a
//! [`Connection`], call [`Connection::init_connection`], then drive
//! requests with [`Connection::send_request`] or
//! [`Connection::send_request_for_chunked_response`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use cache_conn as conn;
pub use cache_wire as wire;

pub use cache_conn::{
    AuthProvider, Chunk, ChunkStream, ChunkedReply, Connection, ConnectionConfig, ConnectionError,
    Endpoint, HandshakeOutcome, PoolContext, PoolSettings, PortSet, Request, UsageState,
};
pub use cache_wire::{ChannelRole, MessageBuilder, MessageType, ServerQueueStatus};
