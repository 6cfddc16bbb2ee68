//! Request message types and encoding.
//!
//! The connection layer itself only builds a handful of messages (the
//! close-connection notice, plus whatever tests need); application-level
//! serialization lives above this crate. The builder emits the standard
//! message shape: a 17-byte header followed by length-prefixed parts.

use crate::header::MESSAGE_HEADER_SIZE;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Message types known to the connection layer
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    /// Generic request
    Request = 1,
    /// Generic single-shot response
    Response = 2,
    /// Streamed (chunked) response
    ChunkedResponse = 3,
    /// Liveness probe
    Ping = 5,
    /// Graceful connection shutdown notice
    CloseConnection = 18,
    /// Query execution
    Query = 22,
    /// Query execution with bind parameters
    QueryWithParameters = 23,
    /// Continuous query registration returning initial results
    ExecuteCqWithInitialResults = 24,
    /// Durable continuous query listing
    GetDurableCqs = 25,
    /// Function execution
    ExecuteFunction = 59,
    /// Function execution scoped to a region
    ExecuteRegionFunction = 60,
    /// Single-hop region function execution
    ExecuteRegionFunctionSingleHop = 61,
    /// Unknown or unset message type
    Invalid = -1,
}

impl MessageType {
    /// Whether replies to this message type carry their own reply timeout
    /// that overrides the caller's send/receive timeouts.
    pub fn uses_reply_timeout(self) -> bool {
        matches!(
            self,
            MessageType::Query
                | MessageType::QueryWithParameters
                | MessageType::ExecuteCqWithInitialResults
                | MessageType::GetDurableCqs
                | MessageType::ExecuteFunction
                | MessageType::ExecuteRegionFunction
                | MessageType::ExecuteRegionFunctionSingleHop
        )
    }

    /// Map a raw wire value to a message type, `Invalid` when unknown
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => MessageType::Request,
            2 => MessageType::Response,
            3 => MessageType::ChunkedResponse,
            5 => MessageType::Ping,
            18 => MessageType::CloseConnection,
            22 => MessageType::Query,
            23 => MessageType::QueryWithParameters,
            24 => MessageType::ExecuteCqWithInitialResults,
            25 => MessageType::GetDurableCqs,
            59 => MessageType::ExecuteFunction,
            60 => MessageType::ExecuteRegionFunction,
            61 => MessageType::ExecuteRegionFunctionSingleHop,
            _ => MessageType::Invalid,
        }
    }
}

impl From<MessageType> for i32 {
    fn from(value: MessageType) -> Self {
        value as i32
    }
}

/// Builder for complete wire messages
#[derive(Debug)]
pub struct MessageBuilder {
    message_type: MessageType,
    transaction_id: i32,
    flags: u8,
    parts: Vec<(bool, Bytes)>,
}

impl MessageBuilder {
    /// Start a message of the given type
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            transaction_id: 0,
            flags: 0,
            parts: Vec::new(),
        }
    }

    /// Set the transaction id carried in the header
    pub fn transaction_id(mut self, transaction_id: i32) -> Self {
        self.transaction_id = transaction_id;
        self
    }

    /// Append a raw-bytes part
    pub fn part(mut self, data: Bytes) -> Self {
        self.parts.push((false, data));
        self
    }

    /// Append a serialized-object part
    pub fn object_part(mut self, data: Bytes) -> Self {
        self.parts.push((true, data));
        self
    }

    /// Encode the message: 17-byte header, then each part as
    /// `[len i32][is_object u8][bytes]`.
    pub fn build(self) -> Bytes {
        let body_len: usize = self.parts.iter().map(|(_, data)| 5 + data.len()).sum();

        let mut buf = BytesMut::with_capacity(MESSAGE_HEADER_SIZE + body_len);
        buf.put_i32(self.message_type.into());
        buf.put_i32(body_len as i32);
        buf.put_i32(self.parts.len() as i32);
        buf.put_i32(self.transaction_id);
        buf.put_u8(self.flags);

        for (is_object, data) in &self.parts {
            buf.put_i32(data.len() as i32);
            buf.put_u8(u8::from(*is_object));
            buf.put_slice(data);
        }

        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::MessageHeader;

    #[test]
    fn test_uses_reply_timeout() {
        assert!(MessageType::Query.uses_reply_timeout());
        assert!(MessageType::ExecuteRegionFunctionSingleHop.uses_reply_timeout());
        assert!(!MessageType::Request.uses_reply_timeout());
        assert!(!MessageType::CloseConnection.uses_reply_timeout());
    }

    #[test]
    fn test_message_type_mapping() {
        assert_eq!(MessageType::from_i32(18), MessageType::CloseConnection);
        assert_eq!(MessageType::from_i32(9999), MessageType::Invalid);
        assert_eq!(i32::from(MessageType::Query), 22);
    }

    #[test]
    fn test_message_builder_shape() {
        let msg = MessageBuilder::new(MessageType::CloseConnection)
            .transaction_id(12)
            .part(Bytes::from_static(&[1]))
            .build();

        assert_eq!(msg.len(), MESSAGE_HEADER_SIZE + 6);

        let header = MessageHeader::decode(&msg).unwrap();
        assert_eq!(header.message_type, 18);
        assert_eq!(header.message_len, 6);

        // part: len=1, is_object=0, keep-alive byte
        assert_eq!(&msg[MESSAGE_HEADER_SIZE..], &[0, 0, 0, 1, 0, 1]);
    }
}
