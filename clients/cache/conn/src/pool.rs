//! Shared pool and endpoint state connections report into.
//!
//! A pool owns many connections across many endpoints; an endpoint is one
//! server address. Connections only write a few facts upward (queue status,
//! queue size, the server's member identity), so this state is kept in
//! atomics and a small mutex rather than behind an async lock.

use bytes::Bytes;
use cache_wire::{Credentials, ServerQueueStatus};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI32, AtomicU16, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::error::ConnectionError;

/// Supplies credentials for handshakes that require authentication
pub trait AuthProvider: Send + Sync {
    /// Build credentials for the given endpoint from the configured
    /// security properties.
    fn credentials(
        &self,
        security_properties: &HashMap<String, String>,
        endpoint: &str,
    ) -> Result<Credentials, ConnectionError>;
}

/// Construction-time pool settings
#[derive(Debug, Clone, Default)]
pub struct PoolSettings {
    /// Serialized membership identity shared by all of the pool's
    /// connections; `None` until the pool has derived one
    pub membership_id: Option<Bytes>,
    /// Socket buffer size applied to new connections
    pub socket_buffer_size: u32,
    /// Proxy hostname used for SNI when connecting through a gateway
    pub sni_proxy: Option<String>,
    /// Whether the pool multiplexes several authenticated users
    pub multi_user_mode: bool,
    /// Whether the server keeps this client's queue alive on close
    pub keep_alive: bool,
}

/// State shared across all connections of one pool
#[derive(Debug)]
pub struct PoolContext {
    settings: PoolSettings,
    primary_queue_size: AtomicI32,
    members: Mutex<Vec<Bytes>>,
}

impl PoolContext {
    /// Create pool state from settings
    pub fn new(settings: PoolSettings) -> Arc<Self> {
        Arc::new(Self {
            settings,
            primary_queue_size: AtomicI32::new(0),
            members: Mutex::new(Vec::new()),
        })
    }

    /// Pool settings
    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Record the queue size reported by the primary server
    pub fn set_primary_server_queue_size(&self, size: i32) {
        self.primary_queue_size.store(size, Ordering::Relaxed);
    }

    /// Last queue size reported by the primary server
    pub fn primary_server_queue_size(&self) -> i32 {
        self.primary_queue_size.load(Ordering::Relaxed)
    }

    /// Register a server's member identity, returning its 1-based id.
    ///
    /// Identities are deduplicated so every endpoint of the same server maps
    /// to the same id.
    pub fn register_member(&self, identity: &[u8]) -> u16 {
        let mut members = self.members.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(index) = members.iter().position(|m| m.as_ref() == identity) {
            return (index + 1) as u16;
        }
        members.push(Bytes::copy_from_slice(identity));
        debug!(member_count = members.len(), "registered server member identity");
        members.len() as u16
    }
}

/// One server address a pool connects to
#[derive(Debug)]
pub struct Endpoint {
    name: String,
    pool: Arc<PoolContext>,
    queue_status: AtomicU8,
    queue_size: AtomicI32,
    distributed_member_id: AtomicU16,
}

impl Endpoint {
    /// Create an endpoint for `name` (`host:port`) within a pool
    pub fn new(name: impl Into<String>, pool: Arc<PoolContext>) -> Self {
        Self {
            name: name.into(),
            pool,
            queue_status: AtomicU8::new(ServerQueueStatus::NonRedundant.as_u8()),
            queue_size: AtomicI32::new(0),
            distributed_member_id: AtomicU16::new(0),
        }
    }

    /// `host:port` address of the server
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hostname portion of the address
    pub fn host(&self) -> &str {
        self.name.split(':').next().unwrap_or(&self.name)
    }

    /// The pool this endpoint belongs to
    pub fn pool(&self) -> &Arc<PoolContext> {
        &self.pool
    }

    /// Record the queue classification and size the server reported
    pub fn set_server_queue_status(&self, status: ServerQueueStatus, size: i32) {
        self.queue_status.store(status.as_u8(), Ordering::Relaxed);
        self.queue_size.store(size, Ordering::Relaxed);
    }

    /// Last queue classification the server reported
    pub fn server_queue_status(&self) -> ServerQueueStatus {
        ServerQueueStatus::from_u8(self.queue_status.load(Ordering::Relaxed))
    }

    /// Last queue size the server reported
    pub fn server_queue_size(&self) -> i32 {
        self.queue_size.load(Ordering::Relaxed)
    }

    /// Pool-wide id of the server's member identity; 0 until cached
    pub fn distributed_member_id(&self) -> u16 {
        self.distributed_member_id.load(Ordering::Relaxed)
    }

    /// Cache the server's member identity the first time it is seen.
    ///
    /// Subsequent handshakes on the same endpoint skip the registration, so
    /// the id is stable for the endpoint's lifetime.
    pub fn cache_member_identity(&self, identity: &[u8]) {
        if self.distributed_member_id.load(Ordering::Relaxed) != 0 {
            return;
        }
        let id = self.pool.register_member(identity);
        self.distributed_member_id.store(id, Ordering::Relaxed);
    }
}

/// Locally bound notification ports shared across a pool's channels.
///
/// Notification handshakes announce every port the client currently has
/// bound so the server can tell the client's channels apart.
#[derive(Debug, Clone, Default)]
pub struct PortSet {
    ports: Arc<Mutex<HashSet<u16>>>,
}

impl PortSet {
    /// Empty port set
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a locally bound port
    pub fn insert(&self, port: u16) {
        self.ports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(port);
    }

    /// Sorted snapshot of the currently recorded ports
    pub fn snapshot(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .ports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect();
        ports.sort_unstable();
        ports
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_member_dedupes() {
        let pool = PoolContext::new(PoolSettings::default());
        assert_eq!(pool.register_member(b"server-a"), 1);
        assert_eq!(pool.register_member(b"server-b"), 2);
        assert_eq!(pool.register_member(b"server-a"), 1);
    }

    #[test]
    fn test_endpoint_caches_member_identity_once() {
        let pool = PoolContext::new(PoolSettings::default());
        let endpoint = Endpoint::new("cache1:40404", pool.clone());
        assert_eq!(endpoint.distributed_member_id(), 0);

        endpoint.cache_member_identity(b"server-a");
        assert_eq!(endpoint.distributed_member_id(), 1);

        // a different identity arriving later does not displace the cache
        endpoint.cache_member_identity(b"server-b");
        assert_eq!(endpoint.distributed_member_id(), 1);
    }

    #[test]
    fn test_endpoint_host() {
        let pool = PoolContext::new(PoolSettings::default());
        let endpoint = Endpoint::new("cache1:40404", pool);
        assert_eq!(endpoint.host(), "cache1");
    }

    #[test]
    fn test_port_set_snapshot_sorted() {
        let ports = PortSet::new();
        ports.insert(40002);
        ports.insert(40001);
        ports.insert(40002);
        assert_eq!(ports.snapshot(), vec![40001, 40002]);
    }
}
