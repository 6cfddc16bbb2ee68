//! Handshake message encoding and protocol constants.
//!
//! The handshake is a one-time exchange performed immediately after the
//! socket is established. This module owns the outbound message layout and
//! the constants both sides dispatch on; driving the exchange (timeouts,
//! socket teardown, response interpretation) belongs to the connection
//! crate.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Protocol version ordinal written right after the channel role byte
pub const PROTOCOL_ORDINAL: i16 = 145;

/// Read-timeout sentinel sent on forward channels.
///
/// Deliberately near-maximal rather than the real timeout; the server adds
/// a small buffer on top, so back off from `i32::MAX` far enough that the
/// addition cannot overflow.
pub const READ_TIMEOUT_SENTINEL: i32 = 0x7fff_ffff - 10_000;

/// Serial type tags used by the handshake encoding
pub mod tags {
    /// Fixed-id marker preceding a registered class id
    pub const FIXED_ID_BYTE: u8 = 1;
    /// Registered class id of the client membership identity
    pub const MEMBERSHIP_ID: u8 = 38;
    /// Null string
    pub const NULL_STRING: u8 = 41;
    /// ASCII string: 2-byte length then that many bytes
    pub const ASCII_STRING: u8 = 42;
}

/// Escape byte for array lengths that need a following i16
pub const ARRAY_LEN_I16: i8 = -2;
/// Escape byte for array lengths that need a following i32
pub const ARRAY_LEN_I32: i8 = -3;

/// Channel role sent as the first handshake byte
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelRole {
    /// Forward request/response channel
    ClientToServer = 100,
    /// Primary notification (subscription) channel
    PrimaryServerToClient = 101,
    /// Secondary notification (subscription) channel
    SecondaryServerToClient = 102,
}

impl ChannelRole {
    /// Whether this role is a notification channel
    pub fn is_notification(self) -> bool {
        matches!(
            self,
            ChannelRole::PrimaryServerToClient | ChannelRole::SecondaryServerToClient
        )
    }
}

/// Acceptance codes the server answers the handshake with
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcceptanceCode {
    /// TLS is required by the server
    SslRequired = 21,
    /// Handshake accepted
    Ok = 59,
    /// Handshake refused
    Refused = 60,
    /// Handshake message considered invalid
    Invalid = 61,
    /// Authentication is required but none was supplied
    AuthenticationRequired = 62,
    /// Supplied credentials were rejected
    AuthenticationFailed = 63,
    /// A durable client with the same id is already connected
    DuplicateDurableClient = 64,
    /// Notification channel accepted
    SuccessfulNotificationChannel = 105,
    /// Notification channel refused
    UnsuccessfulNotificationChannel = 106,
}

impl AcceptanceCode {
    /// Map a raw acceptance byte; `None` for codes this client does not know
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            21 => Some(AcceptanceCode::SslRequired),
            59 => Some(AcceptanceCode::Ok),
            60 => Some(AcceptanceCode::Refused),
            61 => Some(AcceptanceCode::Invalid),
            62 => Some(AcceptanceCode::AuthenticationRequired),
            63 => Some(AcceptanceCode::AuthenticationFailed),
            64 => Some(AcceptanceCode::DuplicateDurableClient),
            105 => Some(AcceptanceCode::SuccessfulNotificationChannel),
            106 => Some(AcceptanceCode::UnsuccessfulNotificationChannel),
            _ => None,
        }
    }
}

/// Security mode byte closing the handshake message
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityMode {
    /// No credentials follow
    CredentialsNone = 0,
    /// Credentials follow, serialized
    CredentialsNormal = 1,
    /// Multi-user notification channel; per-user credentials are exchanged
    /// later on the forward channels, none follow here
    MultiuserNotificationChannel = 3,
}

/// Server-reported classification of this client's event queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServerQueueStatus {
    /// No redundant queue exists for this client
    #[default]
    NonRedundant,
    /// A redundant copy of the queue exists on this server
    Redundant,
    /// This server hosts the primary queue
    Primary,
}

impl ServerQueueStatus {
    /// Map the wire byte; any unknown value means non-redundant
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => ServerQueueStatus::Redundant,
            2 => ServerQueueStatus::Primary,
            _ => ServerQueueStatus::NonRedundant,
        }
    }

    /// Wire byte for this status
    pub fn as_u8(self) -> u8 {
        match self {
            ServerQueueStatus::NonRedundant => 0,
            ServerQueueStatus::Redundant => 1,
            ServerQueueStatus::Primary => 2,
        }
    }
}

/// Write an array length using the escaped 1/2/4-byte encoding.
///
/// Lengths up to 252 fit in the single leading byte; larger values escape
/// to an i16 or i32 suffix. The decode side lives with the handshake reader
/// since lengths arrive interleaved with timed socket reads.
pub fn put_array_len(buf: &mut BytesMut, len: usize) {
    if len <= 252 {
        buf.put_u8(len as u8);
    } else if len <= i16::MAX as usize {
        buf.put_i8(ARRAY_LEN_I16);
        buf.put_i16(len as i16);
    } else {
        buf.put_i8(ARRAY_LEN_I32);
        buf.put_i32(len as i32);
    }
}

/// Write a string with the handshake encoding: type tag, then for ASCII a
/// 2-byte length and the bytes.
pub fn put_ascii_string(buf: &mut BytesMut, value: &str) {
    buf.put_u8(tags::ASCII_STRING);
    buf.put_u16(value.len() as u16);
    buf.put_slice(value.as_bytes());
}

/// Credentials supplied by an auth provider, serialized into the handshake
/// of notification channels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials(BTreeMap<String, String>);

impl Credentials {
    /// Empty credential set
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a property
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Number of properties
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no properties are present
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serialize as an i32 entry count followed by key/value string pairs
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.0.len() as i32);
        for (key, value) in &self.0 {
            put_ascii_string(buf, key);
            put_ascii_string(buf, value);
        }
    }
}

impl FromIterator<(String, String)> for Credentials {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Serialized client membership identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipId(Bytes);

impl MembershipId {
    /// Wrap already-serialized identity bytes (the pool's persistent id)
    pub fn from_bytes(bytes: Bytes) -> Self {
        Self(bytes)
    }

    /// Build a fresh identity from the durable-client configuration
    pub fn for_durable_client(durable_id: &str, durable_timeout: Duration) -> Self {
        let mut buf = BytesMut::new();
        put_ascii_string(&mut buf, durable_id);
        buf.put_i32(durable_timeout.as_secs() as i32);
        Self(buf.freeze())
    }

    /// Serialized identity bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Outbound handshake message.
///
/// `notification_ports` must be `Some` exactly when the channel role is a
/// notification role; forward channels send the read-timeout sentinel in
/// that position instead.
#[derive(Debug)]
pub struct HandshakeRequest<'a> {
    /// Channel role byte
    pub channel: ChannelRole,
    /// Locally bound notification ports, for notification channels only
    pub notification_ports: Option<Vec<u16>>,
    /// Serialized membership identity
    pub membership_id: &'a [u8],
    /// Conflation override byte: 0 none, 1 conflate, 2 do-not-conflate
    pub conflation: u8,
    /// Security mode byte
    pub security_mode: SecurityMode,
    /// Credentials to serialize after the security mode byte, if any
    pub credentials: Option<&'a Credentials>,
}

impl HandshakeRequest<'_> {
    /// Encode the complete handshake message
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.membership_id.len());

        buf.put_u8(self.channel as u8);
        buf.put_i16(PROTOCOL_ORDINAL);
        buf.put_u8(AcceptanceCode::Ok as u8); // reply-ok marker

        match &self.notification_ports {
            Some(ports) => {
                buf.put_i32(ports.len() as i32);
                for port in ports {
                    buf.put_i32(i32::from(*port));
                }
            }
            None => buf.put_i32(READ_TIMEOUT_SENTINEL),
        }

        buf.put_u8(tags::FIXED_ID_BYTE);
        buf.put_u8(tags::MEMBERSHIP_ID);
        put_array_len(&mut buf, self.membership_id.len());
        buf.put_slice(self.membership_id);
        buf.put_i32(1);

        buf.put_u8(self.conflation);
        buf.put_u8(self.security_mode as u8);
        if let Some(credentials) = self.credentials {
            credentials.encode(&mut buf);
        }

        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_status_mapping() {
        assert_eq!(ServerQueueStatus::from_u8(0), ServerQueueStatus::NonRedundant);
        assert_eq!(ServerQueueStatus::from_u8(1), ServerQueueStatus::Redundant);
        assert_eq!(ServerQueueStatus::from_u8(2), ServerQueueStatus::Primary);
        assert_eq!(ServerQueueStatus::from_u8(7), ServerQueueStatus::NonRedundant);
    }

    #[test]
    fn test_acceptance_code_mapping() {
        assert_eq!(AcceptanceCode::from_u8(59), Some(AcceptanceCode::Ok));
        assert_eq!(
            AcceptanceCode::from_u8(106),
            Some(AcceptanceCode::UnsuccessfulNotificationChannel)
        );
        assert_eq!(AcceptanceCode::from_u8(200), None);
    }

    #[test]
    fn test_array_len_forms() {
        let mut buf = BytesMut::new();
        put_array_len(&mut buf, 7);
        assert_eq!(&buf[..], &[7]);

        buf.clear();
        put_array_len(&mut buf, 300);
        assert_eq!(buf[0] as i8, ARRAY_LEN_I16);
        assert_eq!(&buf[1..], 300i16.to_be_bytes());

        buf.clear();
        put_array_len(&mut buf, 100_000);
        assert_eq!(buf[0] as i8, ARRAY_LEN_I32);
        assert_eq!(&buf[1..], 100_000i32.to_be_bytes());
    }

    #[test]
    fn test_forward_request_layout() {
        let member = MembershipId::for_durable_client("client-7", Duration::from_secs(30));
        let request = HandshakeRequest {
            channel: ChannelRole::ClientToServer,
            notification_ports: None,
            membership_id: member.as_bytes(),
            conflation: 0,
            security_mode: SecurityMode::CredentialsNone,
            credentials: None,
        };

        let bytes = request.encode();
        assert_eq!(bytes[0], 100);
        assert_eq!(&bytes[1..3], PROTOCOL_ORDINAL.to_be_bytes());
        assert_eq!(bytes[3], AcceptanceCode::Ok as u8);
        assert_eq!(&bytes[4..8], READ_TIMEOUT_SENTINEL.to_be_bytes());
        assert_eq!(bytes[8], tags::FIXED_ID_BYTE);
        assert_eq!(bytes[9], tags::MEMBERSHIP_ID);
        assert_eq!(bytes[10] as usize, member.as_bytes().len());

        let tail = 11 + member.as_bytes().len();
        assert_eq!(&bytes[tail..tail + 4], 1i32.to_be_bytes());
        assert_eq!(bytes[tail + 4], 0); // conflation
        assert_eq!(bytes[tail + 5], SecurityMode::CredentialsNone as u8);
        assert_eq!(bytes.len(), tail + 6);
    }

    #[test]
    fn test_notification_request_carries_ports_and_credentials() {
        let mut credentials = Credentials::new();
        credentials.insert("security-username", "reader");

        let request = HandshakeRequest {
            channel: ChannelRole::PrimaryServerToClient,
            notification_ports: Some(vec![40001, 40002]),
            membership_id: b"member",
            conflation: 2,
            security_mode: SecurityMode::CredentialsNormal,
            credentials: Some(&credentials),
        };

        let bytes = request.encode();
        assert_eq!(bytes[0], 101);
        assert_eq!(&bytes[4..8], 2i32.to_be_bytes());
        assert_eq!(&bytes[8..12], 40001i32.to_be_bytes());
        assert_eq!(&bytes[12..16], 40002i32.to_be_bytes());

        // credentials count follows the security mode byte
        let tail = 16 + 2 + 1 + 6 + 4 + 1;
        assert_eq!(bytes[tail], SecurityMode::CredentialsNormal as u8);
        assert_eq!(&bytes[tail + 1..tail + 5], 1i32.to_be_bytes());
        assert_eq!(bytes[tail + 5], tags::ASCII_STRING);
    }

    #[test]
    fn test_membership_id_for_durable_client() {
        let member = MembershipId::for_durable_client("durable-1", Duration::from_secs(300));
        let bytes = member.as_bytes();
        assert_eq!(bytes[0], tags::ASCII_STRING);
        assert_eq!(&bytes[1..3], 9u16.to_be_bytes());
        assert_eq!(&bytes[3..12], b"durable-1");
        assert_eq!(&bytes[12..16], 300i32.to_be_bytes());
    }
}
