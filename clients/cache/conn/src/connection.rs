//! One client-server connection: lifecycle, framed I/O, chunked replies.

use bytes::{BufMut, Bytes, BytesMut};
use cache_wire::{
    ChannelRole, ChunkHeader, ChunkedResponseHeader, MessageBuilder, MessageHeader, MessageType,
    CHUNK_HEADER_SIZE, MESSAGE_HEADER_SIZE,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::chunked::{Chunk, ChunkedReply, FinalizeChunkStream};
use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use crate::handshake::{self, HandshakeOutcome};
use crate::health::HealthTracker;
use crate::pool::{AuthProvider, Endpoint, PortSet};
use crate::transport::{self, IoStream, TransportError};
use crate::usage::{UsageGate, UsageState};

/// Connection id before the server assigns one
pub const INITIAL_CONNECTION_ID: u64 = 26739;

/// Base reply timeout the retry extension keys off
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Multiplier applied to header waits carrying the default timeout
pub const DEFAULT_TIMEOUT_RETRIES: u32 = 12;

/// Budget for the best-effort close notice
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// One request handed to [`Connection::send_request_for_chunked_response`]
#[derive(Debug, Clone)]
pub struct Request {
    /// Message type of the request
    pub message_type: MessageType,
    /// Complete encoded request, header included
    pub data: Bytes,
    /// Reply timeout that overrides the receive timeout for message types
    /// that carry one
    pub reply_timeout: Option<Duration>,
}

/// Header waits on replies to the default timeout get extended so that a
/// server taking several retry rounds to answer is not cut off early.
fn calculate_header_timeout(timeout: Duration, retry_extend: bool) -> Duration {
    if retry_extend && timeout == DEFAULT_READ_TIMEOUT {
        timeout * DEFAULT_TIMEOUT_RETRIES
    } else {
        timeout
    }
}

fn send_error(err: TransportError) -> ConnectionError {
    match err {
        TransportError::Timeout => ConnectionError::Timeout("sending request"),
        TransportError::NoData => ConnectionError::Io("connection closed by peer".to_string()),
        TransportError::Io(e) => ConnectionError::Io(e.to_string()),
    }
}

/// A single connection to one cache server endpoint
pub struct Connection {
    id: u64,
    endpoint: Arc<Endpoint>,
    config: ConnectionConfig,
    auth: Option<Arc<dyn AuthProvider>>,
    stream: Option<IoStream>,
    port: u16,
    channel: ChannelRole,
    health: HealthTracker,
    usage: UsageGate,
}

impl Connection {
    /// Create an unconnected connection for an endpoint
    pub fn new(
        endpoint: Arc<Endpoint>,
        config: ConnectionConfig,
        auth: Option<Arc<dyn AuthProvider>>,
    ) -> Self {
        Self {
            id: INITIAL_CONNECTION_ID,
            endpoint,
            config,
            auth,
            stream: None,
            port: 0,
            channel: ChannelRole::ClientToServer,
            health: HealthTracker::new(),
            usage: UsageGate::new(),
        }
    }

    /// Establish the socket and perform the handshake.
    ///
    /// Usable for both fresh connections and reconnects; any previous
    /// stream is discarded first. On `Err` the connection holds no stream.
    pub async fn init_connection(
        &mut self,
        ports: &PortSet,
        channel: ChannelRole,
        connect_timeout: Duration,
    ) -> Result<HandshakeOutcome, ConnectionError> {
        self.stream = None;
        self.channel = channel;
        self.health.update_creation_time();

        let mut stream = self.open_stream(connect_timeout).await?;
        self.port = stream
            .local_port()
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        let outcome = handshake::perform(
            &mut stream,
            &self.endpoint,
            &self.config,
            self.auth.as_ref(),
            ports,
            channel,
            connect_timeout,
        )
        .await?;

        self.stream = Some(stream);
        debug!(
            endpoint = self.endpoint.name(),
            port = self.port,
            ?channel,
            "connection established"
        );
        Ok(outcome)
    }

    async fn open_stream(&self, connect_timeout: Duration) -> Result<IoStream, ConnectionError> {
        let pool_buffer = self.endpoint.pool().settings().socket_buffer_size;
        let buffer_size = if pool_buffer > 0 {
            pool_buffer
        } else {
            self.config.socket_buffer_size
        };

        let tcp = transport::connect_tcp(self.endpoint.name(), buffer_size, connect_timeout)
            .await
            .map_err(|e| match e {
                TransportError::Timeout => ConnectionError::Timeout("connecting"),
                other => ConnectionError::Io(other.to_string()),
            })?;

        if !self.config.ssl_enabled {
            return Ok(IoStream::Plain(tcp));
        }

        #[cfg(feature = "tls")]
        {
            let read_pem = |path: &str| {
                std::fs::read_to_string(path)
                    .map_err(|e| ConnectionError::Io(format!("reading {path}: {e}")))
            };

            let trust_store = read_pem(&self.config.ssl_trust_store)?;
            let client_cert = if self.config.ssl_client_cert.is_empty() {
                None
            } else {
                Some(read_pem(&self.config.ssl_client_cert)?)
            };
            let client_key = if self.config.ssl_client_key.is_empty() {
                None
            } else {
                Some(read_pem(&self.config.ssl_client_key)?)
            };

            let tls_config = transport::tls::make_client_config(
                &trust_store,
                client_cert.as_deref(),
                client_key.as_deref(),
            )
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

            let sni = self
                .endpoint
                .pool()
                .settings()
                .sni_proxy
                .clone()
                .unwrap_or_else(|| self.endpoint.host().to_string());

            transport::tls::connect_tls(tls_config, tcp, &sni)
                .await
                .map_err(|e| ConnectionError::Io(e.to_string()))
        }

        #[cfg(not(feature = "tls"))]
        {
            drop(tcp);
            Err(ConnectionError::Io(
                "ssl_enabled is set but TLS support is not compiled in".to_string(),
            ))
        }
    }

    fn require_stream(&mut self) -> Result<&mut IoStream, ConnectionError> {
        self.stream
            .as_mut()
            .ok_or_else(|| ConnectionError::Io("connection is closed".to_string()))
    }

    /// Send a complete request and wait for the single-shot reply.
    ///
    /// The receive budget shrinks by the time spent sending; a budget
    /// already exhausted before the reply wait begins fails immediately.
    /// The returned buffer is the full reply, 17-byte header included.
    pub async fn send_request(
        &mut self,
        data: &[u8],
        send_timeout: Duration,
        receive_timeout: Duration,
    ) -> Result<Bytes, ConnectionError> {
        let started = Instant::now();
        self.send_bytes(data, send_timeout).await?;

        let remaining = receive_timeout
            .checked_sub(started.elapsed())
            .filter(|d| !d.is_zero())
            .ok_or(ConnectionError::Timeout("waiting for reply"))?;

        let reply = self
            .read_message(remaining, true, false)
            .await?
            .ok_or_else(|| ConnectionError::Io("connection closed by peer".to_string()))?;
        self.health.touch();
        Ok(reply)
    }

    /// Wait for an unsolicited message.
    ///
    /// On notification channels a quiet socket is normal: no header within
    /// the timeout (or an EOF before one) returns `Ok(None)` instead of an
    /// error.
    pub async fn receive(&mut self, timeout: Duration) -> Result<Option<Bytes>, ConnectionError> {
        let notification = self.channel.is_notification();
        let message = self.read_message(timeout, false, notification).await?;
        if message.is_some() {
            self.health.touch();
        }
        Ok(message)
    }

    /// Write raw bytes within the send timeout
    pub async fn send_bytes(
        &mut self,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), ConnectionError> {
        let stream = self.require_stream()?;
        transport::send_all(stream, data, timeout)
            .await
            .map_err(send_error)
    }

    /// Read one framed message: 17-byte header, then the body it announces.
    ///
    /// Once a header has been consumed the stream cannot be resumed, so a
    /// body failure is always fatal; only the header wait gets the
    /// quiet-channel treatment.
    async fn read_message(
        &mut self,
        timeout: Duration,
        retry_extend: bool,
        notification: bool,
    ) -> Result<Option<Bytes>, ConnectionError> {
        let header_timeout = calculate_header_timeout(timeout, retry_extend);
        let stream = self.require_stream()?;

        let mut header = [0u8; MESSAGE_HEADER_SIZE];
        if let Err(e) = transport::receive_exact(stream, &mut header, header_timeout).await {
            return match e {
                TransportError::NoData | TransportError::Timeout if notification => Ok(None),
                TransportError::Timeout => Err(ConnectionError::Timeout(
                    "waiting for response header",
                )),
                TransportError::NoData => {
                    Err(ConnectionError::Io("connection closed by peer".to_string()))
                }
                TransportError::Io(e) => Err(ConnectionError::Io(e.to_string())),
            };
        }

        let decoded =
            MessageHeader::decode(&header).map_err(|e| ConnectionError::Io(e.to_string()))?;
        let body_len = decoded.message_len.max(0) as usize;

        let mut message = BytesMut::with_capacity(MESSAGE_HEADER_SIZE + body_len);
        message.put_slice(&header);
        message.resize(MESSAGE_HEADER_SIZE + body_len, 0);

        if body_len > 0 {
            let body_timeout = if notification {
                timeout * DEFAULT_TIMEOUT_RETRIES
            } else {
                timeout
            };
            if let Err(e) = transport::receive_exact(
                stream,
                &mut message[MESSAGE_HEADER_SIZE..],
                body_timeout,
            )
            .await
            {
                return match e {
                    TransportError::Timeout if !notification => {
                        Err(ConnectionError::Timeout("waiting for response body"))
                    }
                    other => Err(ConnectionError::Io(format!(
                        "reading response body: {other}"
                    ))),
                };
            }
        }

        Ok(Some(message.freeze()))
    }

    /// Send a request whose reply arrives as a chunk stream.
    ///
    /// Chunks are handed to the reply's consumer as they arrive; the
    /// consumer's end-of-stream terminator fires whatever way the read
    /// loop exits.
    pub async fn send_request_for_chunked_response(
        &mut self,
        request: &Request,
        reply: &mut ChunkedReply,
        send_timeout: Duration,
        receive_timeout: Duration,
    ) -> Result<(), ConnectionError> {
        let (send_timeout, receive_timeout) = match request.reply_timeout {
            Some(reply_timeout) if request.message_type.uses_reply_timeout() => {
                (reply_timeout, reply_timeout)
            }
            _ => (send_timeout, receive_timeout),
        };

        let started = Instant::now();
        self.send_bytes(&request.data, send_timeout).await?;

        let remaining = receive_timeout
            .checked_sub(started.elapsed())
            .filter(|d| !d.is_zero())
            .ok_or(ConnectionError::Timeout("waiting for chunked reply"))?;

        reply.set_request_message_type(request.message_type.into());
        self.read_chunked_reply(reply, remaining).await?;
        self.health.touch();
        Ok(())
    }

    async fn read_chunked_reply(
        &mut self,
        reply: &mut ChunkedReply,
        timeout: Duration,
    ) -> Result<(), ConnectionError> {
        let header_timeout = calculate_header_timeout(timeout, true);
        let header = self.read_response_header(header_timeout).await?;

        reply.set_message_type(header.message_type);
        reply.set_transaction_id(header.transaction_id);

        let result = {
            let _finalize = FinalizeChunkStream::new(reply);
            let mut chunk_header = header.chunk;
            loop {
                let chunk = match self.read_chunk_body(chunk_header, timeout).await {
                    Ok(chunk) => chunk,
                    Err(e) => break Err(e),
                };
                let last = chunk.is_last();
                reply.process_chunk(chunk);
                if last {
                    break Ok(());
                }
                chunk_header = match self.read_chunk_header(header_timeout).await {
                    Ok(header) => header,
                    Err(e) => break Err(e),
                };
            }
        };

        if result.is_err() {
            if let Some(message) = reply.take_consumer_error() {
                debug!(%message, "discarding consumer error after failed chunk read");
            }
        }
        result
    }

    async fn read_response_header(
        &mut self,
        timeout: Duration,
    ) -> Result<ChunkedResponseHeader, ConnectionError> {
        let stream = self.require_stream()?;
        let mut buf = [0u8; MESSAGE_HEADER_SIZE];
        transport::receive_exact(stream, &mut buf, timeout)
            .await
            .map_err(|e| match e {
                TransportError::Timeout => {
                    ConnectionError::Timeout("waiting for chunked response header")
                }
                other => ConnectionError::Io(other.to_string()),
            })?;
        ChunkedResponseHeader::decode(&buf).map_err(|e| ConnectionError::Io(e.to_string()))
    }

    async fn read_chunk_header(
        &mut self,
        timeout: Duration,
    ) -> Result<ChunkHeader, ConnectionError> {
        let stream = self.require_stream()?;
        let mut buf = [0u8; CHUNK_HEADER_SIZE];
        transport::receive_exact(stream, &mut buf, timeout)
            .await
            .map_err(|e| match e {
                TransportError::Timeout => ConnectionError::Timeout("waiting for chunk header"),
                other => ConnectionError::Io(other.to_string()),
            })?;
        ChunkHeader::decode(&buf).map_err(|e| ConnectionError::Io(e.to_string()))
    }

    // a chunk header is already consumed here, so even a timeout is fatal
    async fn read_chunk_body(
        &mut self,
        header: ChunkHeader,
        timeout: Duration,
    ) -> Result<Chunk, ConnectionError> {
        let stream = self.require_stream()?;
        let mut body = vec![0u8; header.len as usize];
        transport::receive_exact(stream, &mut body, timeout)
            .await
            .map_err(|e| ConnectionError::Io(format!("reading chunk body: {e}")))?;
        Ok(Chunk {
            body: Bytes::from(body),
            flags: header.flags,
        })
    }

    /// Notify the server and drop the socket.
    ///
    /// Best effort: the server may already be gone, so failures are logged
    /// and swallowed, never raised.
    pub async fn close(&mut self) {
        let Some(mut stream) = self.stream.take() else {
            return;
        };

        let keep_alive = self.endpoint.pool().settings().keep_alive;
        let notice = MessageBuilder::new(MessageType::CloseConnection)
            .part(Bytes::copy_from_slice(&[u8::from(keep_alive)]))
            .build();

        if let Err(e) = transport::send_all(&mut stream, &notice, CLOSE_TIMEOUT).await {
            info!(
                endpoint = self.endpoint.name(),
                error = %e,
                "close notice not delivered"
            );
        }
    }

    /// Whether the connection has outlived `expiry` (variance applied)
    pub fn has_expired(&self, expiry: Duration) -> bool {
        self.health.has_expired(expiry)
    }

    /// Whether the connection has been unused for longer than `idle`
    pub fn is_idle(&self, idle: Duration) -> bool {
        self.health.is_idle(idle)
    }

    /// Record that the connection was just used
    pub fn touch(&self) {
        self.health.touch();
    }

    /// Restart the connection's lifetime clock
    pub fn update_creation_time(&self) {
        self.health.update_creation_time();
    }

    /// Acquire or release the checkout gate; see [`UsageGate`]
    pub fn set_and_get_being_used(&self, want_in_use: bool, for_transaction: bool) -> bool {
        self.usage.set_and_get_being_used(want_in_use, for_transaction)
    }

    /// Current checkout state
    pub fn usage_state(&self) -> UsageState {
        self.usage.state()
    }

    /// Server-assigned connection id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Record the server-assigned connection id
    pub fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    /// The endpoint this connection belongs to
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Locally bound port, 0 before the first `init_connection`
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Channel role established by the last `init_connection`
    pub fn channel(&self) -> ChannelRole {
        self.channel
    }

    /// Queue classification the endpoint last reported
    pub fn server_queue_status(&self) -> cache_wire::ServerQueueStatus {
        self.endpoint.server_queue_status()
    }

    /// Queue size the endpoint last reported
    pub fn server_queue_size(&self) -> i32 {
        self.endpoint.server_queue_size()
    }

    /// Whether a live stream is attached
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_timeout_extension() {
        // only the default timeout gets extended, and only on retrying paths
        assert_eq!(
            calculate_header_timeout(DEFAULT_READ_TIMEOUT, true),
            DEFAULT_READ_TIMEOUT * DEFAULT_TIMEOUT_RETRIES
        );
        assert_eq!(
            calculate_header_timeout(DEFAULT_READ_TIMEOUT, false),
            DEFAULT_READ_TIMEOUT
        );
        assert_eq!(
            calculate_header_timeout(Duration::from_secs(3), true),
            Duration::from_secs(3)
        );
    }
}
