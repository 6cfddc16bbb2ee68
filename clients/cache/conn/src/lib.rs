//! Server connection management for the cache client.
//!
//! This crate owns everything between a configured endpoint and a usable
//! connection: establishing TCP (optionally TLS) streams, the handshake
//! exchange, framed request/response I/O, chunked reply streaming, and the
//! per-connection bookkeeping pools rely on (age and idle tracking, the
//! checkout gate, queue status snapshots).
//!
//! A [`Connection`] is driven by one owner at a time, enforced through the
//! [`UsageGate`]; the pool's health sweep reads age and idleness without
//! taking the gate.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunked;
pub mod config;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod health;
pub mod pool;
pub mod transport;
pub mod usage;

// Re-export main types
pub use chunked::{Chunk, ChunkStream, ChunkedReply};
pub use config::{ConnectionConfig, DEFAULT_READ_TIMEOUT_MS, DEFAULT_SOCKET_BUFFER_SIZE};
pub use connection::{
    Connection, Request, DEFAULT_READ_TIMEOUT, DEFAULT_TIMEOUT_RETRIES, INITIAL_CONNECTION_ID,
};
pub use error::ConnectionError;
pub use handshake::HandshakeOutcome;
pub use health::HealthTracker;
pub use pool::{AuthProvider, Endpoint, PoolContext, PoolSettings, PortSet};
pub use transport::{IoStream, TransportError};
pub use usage::{UsageGate, UsageState};
