//! TCP and TLS transport for server connections.
//!
//! This module provides the timed socket primitives the connection layer is
//! built on: establishing plain TCP (and optionally TLS) streams, and fully
//! draining reads/writes under a deadline.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tracing::debug;

/// Transport-level read/write failures
#[derive(Error, Debug)]
pub enum TransportError {
    /// The peer closed the stream before any of the requested bytes arrived
    #[error("connection closed by peer")]
    NoData,

    /// The deadline elapsed before the operation completed
    #[error("transport timeout")]
    Timeout,

    /// Socket error
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

/// Unified stream type that can be either plain TCP or TLS
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// TLS client stream
    #[cfg(feature = "tls")]
    TlsClient(tokio_rustls::client::TlsStream<TcpStream>),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl IoStream {
    /// Get the peer address of the underlying stream
    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            IoStream::Plain(stream) => stream.peer_addr(),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => stream.get_ref().0.peer_addr(),
        }
    }

    /// Locally bound port of the underlying stream
    pub fn local_port(&self) -> std::io::Result<u16> {
        let addr = match self {
            IoStream::Plain(stream) => stream.local_addr()?,
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => stream.get_ref().0.local_addr()?,
        };
        Ok(addr.port())
    }
}

/// Resolve and connect to `host:port`, applying socket buffer sizes and
/// disabling Nagle, all within `timeout`.
pub async fn connect_tcp(
    endpoint: &str,
    buffer_size: u32,
    timeout: Duration,
) -> Result<TcpStream, TransportError> {
    let connect = async {
        let mut last_err = None;
        for addr in lookup_host(endpoint).await? {
            let socket = match addr {
                SocketAddr::V4(_) => TcpSocket::new_v4()?,
                SocketAddr::V6(_) => TcpSocket::new_v6()?,
            };
            if buffer_size > 0 {
                socket.set_send_buffer_size(buffer_size)?;
                socket.set_recv_buffer_size(buffer_size)?;
            }
            match socket.connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    debug!(%addr, "connected");
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved")
        }))
    };

    match tokio::time::timeout(timeout, connect).await {
        Ok(result) => result.map_err(TransportError::Io),
        Err(_) => Err(TransportError::Timeout),
    }
}

/// Write the whole buffer and flush, within `timeout`.
///
/// A zero timeout fails immediately rather than writing with no deadline.
pub async fn send_all<S>(stream: &mut S, data: &[u8], timeout: Duration) -> Result<(), TransportError>
where
    S: AsyncWrite + Unpin,
{
    if timeout.is_zero() {
        return Err(TransportError::Timeout);
    }

    let write = async {
        stream.write_all(data).await?;
        stream.flush().await
    };

    match tokio::time::timeout(timeout, write).await {
        Ok(result) => result.map_err(TransportError::Io),
        Err(_) => Err(TransportError::Timeout),
    }
}

/// Read exactly `buf.len()` bytes within `timeout`.
///
/// An EOF before the buffer is full maps to [`TransportError::NoData`]; the
/// caller decides whether that is quiet-channel silence or a hard failure.
pub async fn receive_exact<S>(
    stream: &mut S,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<(), TransportError>
where
    S: AsyncRead + Unpin,
{
    match tokio::time::timeout(timeout, stream.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(TransportError::NoData),
        Ok(Err(e)) => Err(TransportError::Io(e)),
        Err(_) => Err(TransportError::Timeout),
    }
}

// TLS-specific functionality
#[cfg(feature = "tls")]
/// TLS transport for connections to servers requiring encryption
pub mod tls {
    use super::*;
    use anyhow::{Context as AnyhowContext, Result};
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
    use rustls::{ClientConfig, RootCertStore};
    use std::sync::Arc;
    use tokio_rustls::TlsConnector;
    use tracing::info;

    /// Create a TLS client configuration from PEM material.
    ///
    /// The trust store is required; the client certificate and key are
    /// optional and enable mutual authentication when both are present.
    pub fn make_client_config(
        trust_store_pem: &str,
        client_cert_pem: Option<&str>,
        client_key_pem: Option<&str>,
    ) -> Result<ClientConfig> {
        // Install default crypto provider if not already set
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut roots = RootCertStore::empty();
        let ca_results: Result<Vec<_>, _> =
            rustls_pemfile::certs(&mut trust_store_pem.as_bytes()).collect();
        let ca_certs = ca_results.context("Failed to parse trust store certificates")?;

        for ca_cert in ca_certs {
            roots
                .add(CertificateDer::from(ca_cert))
                .context("Failed to add CA certificate to root store")?;
        }

        let builder = ClientConfig::builder().with_root_certificates(roots);

        let config = match (client_cert_pem, client_key_pem) {
            (Some(cert_pem), Some(key_pem)) => {
                let cert_results: Result<Vec<_>, _> =
                    rustls_pemfile::certs(&mut cert_pem.as_bytes()).collect();
                let certs = cert_results
                    .context("Failed to parse client certificate chain")?
                    .into_iter()
                    .map(CertificateDer::from)
                    .collect::<Vec<_>>();

                if certs.is_empty() {
                    anyhow::bail!("No certificates found in client certificate chain");
                }

                let key = {
                    let key_results: Result<Vec<_>, _> =
                        rustls_pemfile::pkcs8_private_keys(&mut key_pem.as_bytes()).collect();
                    let mut keys = key_results.context("Failed to parse client private key")?;
                    if keys.is_empty() {
                        anyhow::bail!("No private key found");
                    }
                    PrivateKeyDer::from(keys.remove(0))
                };

                builder
                    .with_client_auth_cert(certs, key)
                    .context("Failed to configure client certificate")?
            }
            _ => builder.with_no_client_auth(),
        };

        info!("TLS client configuration created");
        Ok(config)
    }

    /// Wrap an established TCP stream in TLS, verifying against `sni`
    pub async fn connect_tls(
        config: ClientConfig,
        tcp_stream: TcpStream,
        sni: &str,
    ) -> Result<IoStream> {
        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(sni.to_owned())
            .map_err(|_| anyhow::anyhow!("Invalid server name: {}", sni))?;

        let tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .with_context(|| format!("TLS handshake failed (SNI: {})", sni))?;

        debug!(sni, "TLS connection established");
        Ok(IoStream::TlsClient(tls_stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_send_receive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let stream = connect_tcp(&addr.to_string(), 32768, Duration::from_secs(5))
            .await
            .unwrap();
        let mut stream = IoStream::Plain(stream);
        assert!(stream.local_port().unwrap() > 0);

        send_all(&mut stream, b"hello", Duration::from_secs(5))
            .await
            .unwrap();

        let mut reply = [0u8; 5];
        receive_exact(&mut stream, &mut reply, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(&reply, b"hello");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_receive_eof_is_no_data() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let stream = connect_tcp(&addr.to_string(), 0, Duration::from_secs(5))
            .await
            .unwrap();
        let mut stream = IoStream::Plain(stream);
        server.await.unwrap();

        let mut buf = [0u8; 4];
        let err = receive_exact(&mut stream, &mut buf, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NoData));
    }

    #[tokio::test]
    async fn test_receive_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = connect_tcp(&addr.to_string(), 0, Duration::from_secs(5))
            .await
            .unwrap();
        let mut stream = IoStream::Plain(stream);

        let mut buf = [0u8; 4];
        let err = receive_exact(&mut stream, &mut buf, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
        drop(listener);
    }

    #[tokio::test]
    async fn test_zero_send_timeout_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = connect_tcp(&addr.to_string(), 0, Duration::from_secs(5))
            .await
            .unwrap();
        let mut stream = IoStream::Plain(stream);

        let err = send_all(&mut stream, b"x", Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
        drop(listener);
    }
}
