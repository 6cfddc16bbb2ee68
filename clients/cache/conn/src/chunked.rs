//! Chunked reply handoff between the socket reader and its consumer.
//!
//! Streamed replies are processed concurrently: the connection reads chunk
//! after chunk off the socket and hands each to an independent consumer
//! task. The handoff must guarantee the consumer always observes an end of
//! stream, whatever path the reader exits on, or the consumer would wait
//! forever on a reply that died mid-stream.

use bytes::Bytes;
use cache_wire::ChunkFlags;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// One chunk of a streamed reply
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Chunk body bytes
    pub body: Bytes,
    /// Flags from the chunk header
    pub flags: ChunkFlags,
}

impl Chunk {
    /// Whether this chunk terminates the stream
    pub fn is_last(&self) -> bool {
        self.flags.contains(ChunkFlags::LAST_CHUNK)
    }
}

/// Reader-side handle for one chunked reply.
///
/// Created together with its [`ChunkStream`]; the connection fills in the
/// reply header fields and pushes chunks as they arrive.
#[derive(Debug)]
pub struct ChunkedReply {
    message_type: i32,
    transaction_id: i32,
    request_message_type: i32,
    tx: mpsc::UnboundedSender<Option<Chunk>>,
    consumer_error: Arc<Mutex<Option<String>>>,
}

impl ChunkedReply {
    /// Create a reply handle and the consumer stream it feeds
    pub fn new() -> (Self, ChunkStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let consumer_error = Arc::new(Mutex::new(None));
        let reply = Self {
            message_type: 0,
            transaction_id: 0,
            request_message_type: 0,
            tx,
            consumer_error: consumer_error.clone(),
        };
        let stream = ChunkStream {
            rx,
            consumer_error,
        };
        (reply, stream)
    }

    /// Message type of the streamed reply
    pub fn message_type(&self) -> i32 {
        self.message_type
    }

    /// Transaction id correlating the reply with its request
    pub fn transaction_id(&self) -> i32 {
        self.transaction_id
    }

    /// Message type of the request this reply answers
    pub fn request_message_type(&self) -> i32 {
        self.request_message_type
    }

    pub(crate) fn set_message_type(&mut self, message_type: i32) {
        self.message_type = message_type;
    }

    pub(crate) fn set_transaction_id(&mut self, transaction_id: i32) {
        self.transaction_id = transaction_id;
    }

    /// Record which request message type this reply answers
    pub fn set_request_message_type(&mut self, message_type: i32) {
        self.request_message_type = message_type;
    }

    /// Hand a chunk to the consumer
    pub(crate) fn process_chunk(&self, chunk: Chunk) {
        // a consumer that already hung up is not the reader's problem
        let _ = self.tx.send(Some(chunk));
    }

    /// Take the error the consumer recorded, if any
    pub fn take_consumer_error(&self) -> Option<String> {
        self.consumer_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

/// Consumer side of a chunked reply
#[derive(Debug)]
pub struct ChunkStream {
    rx: mpsc::UnboundedReceiver<Option<Chunk>>,
    consumer_error: Arc<Mutex<Option<String>>>,
}

impl ChunkStream {
    /// Next chunk, or `None` once the stream has ended.
    ///
    /// The end of stream is observed both on the explicit terminator and
    /// when the reader side is dropped outright.
    pub async fn next(&mut self) -> Option<Chunk> {
        self.rx.recv().await.flatten()
    }

    /// Record a processing failure for the reader to pick up after the
    /// stream is drained
    pub fn record_error(&self, message: impl Into<String>) {
        *self
            .consumer_error
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(message.into());
    }
}

/// Scope guard that terminates the chunk stream on drop.
///
/// Constructed before the read loop; whatever path the reader exits on,
/// dropping the guard enqueues the terminator exactly once.
pub(crate) struct FinalizeChunkStream<'a> {
    reply: &'a ChunkedReply,
}

impl<'a> FinalizeChunkStream<'a> {
    pub(crate) fn new(reply: &'a ChunkedReply) -> Self {
        Self { reply }
    }
}

impl Drop for FinalizeChunkStream<'_> {
    fn drop(&mut self) {
        let _ = self.reply.tx.send(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_chunks_then_terminator() {
        let (mut reply, mut stream) = ChunkedReply::new();
        reply.set_message_type(3);
        reply.set_transaction_id(7);

        {
            let _finalize = FinalizeChunkStream::new(&reply);
            for i in 0..3u8 {
                let flags = if i == 2 {
                    ChunkFlags::LAST_CHUNK
                } else {
                    ChunkFlags::empty()
                };
                reply.process_chunk(Chunk {
                    body: Bytes::from(vec![i]),
                    flags,
                });
            }
        }

        for i in 0..3u8 {
            let chunk = stream.next().await.unwrap();
            assert_eq!(chunk.body.as_ref(), &[i]);
            assert_eq!(chunk.is_last(), i == 2);
        }
        assert!(stream.next().await.is_none());
        assert_eq!(reply.message_type(), 3);
        assert_eq!(reply.transaction_id(), 7);
    }

    #[tokio::test]
    async fn test_terminator_fires_on_early_exit() {
        let (reply, mut stream) = ChunkedReply::new();

        // reader bails before delivering a single chunk
        {
            let _finalize = FinalizeChunkStream::new(&reply);
        }

        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_consumer_error_round_trip() {
        let (reply, stream) = ChunkedReply::new();
        assert!(reply.take_consumer_error().is_none());

        stream.record_error("bad chunk payload");
        assert_eq!(reply.take_consumer_error().as_deref(), Some("bad chunk payload"));
        // taking clears it
        assert!(reply.take_consumer_error().is_none());
    }
}
