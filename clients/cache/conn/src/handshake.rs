//! Handshake exchange with a cache server.
//!
//! Builds the handshake message from the pool, endpoint, and configuration,
//! sends it, and interprets the server's reply. Every failure here means
//! the socket must be discarded; the caller drops the stream on any `Err`.

use bytes::Bytes;
use cache_wire::{
    tags, AcceptanceCode, ChannelRole, HandshakeRequest, MembershipId, SecurityMode,
    ServerQueueStatus, ARRAY_LEN_I16, ARRAY_LEN_I32,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use crate::pool::{AuthProvider, Endpoint, PortSet};
use crate::transport::{self, IoStream, TransportError};

/// What a successful handshake established
#[derive(Debug, Clone, Copy)]
pub struct HandshakeOutcome {
    /// The caller still owes the server an explicit authentication step
    pub requires_follow_up_auth: bool,
    /// Whether the server supports delta propagation; `None` on
    /// notification channels, which do not carry the flag
    pub delta_enabled_on_server: Option<bool>,
    /// Queue classification the server reported
    pub queue_status: ServerQueueStatus,
    /// Queue size the server reported, clamped to zero
    pub queue_size: i32,
}

fn handshake_error(err: TransportError) -> ConnectionError {
    match err {
        TransportError::NoData | TransportError::Timeout => ConnectionError::Timeout("in handshake"),
        TransportError::Io(e) => ConnectionError::Io(e.to_string()),
    }
}

/// Sequential reader over the handshake reply.
///
/// The reply is a stream of length-delimited fields, not a framed message,
/// so each field is pulled off the socket as it is decoded, every read
/// bounded by the handshake timeout.
struct HandshakeReader<'a> {
    stream: &'a mut IoStream,
    timeout: Duration,
}

impl<'a> HandshakeReader<'a> {
    fn new(stream: &'a mut IoStream, timeout: Duration) -> Self {
        Self { stream, timeout }
    }

    async fn read_bytes(&mut self, len: usize) -> Result<Bytes, ConnectionError> {
        let mut buf = vec![0u8; len];
        transport::receive_exact(self.stream, &mut buf, self.timeout)
            .await
            .map_err(handshake_error)?;
        Ok(Bytes::from(buf))
    }

    async fn read_u8(&mut self) -> Result<u8, ConnectionError> {
        let mut buf = [0u8; 1];
        transport::receive_exact(self.stream, &mut buf, self.timeout)
            .await
            .map_err(handshake_error)?;
        Ok(buf[0])
    }

    async fn read_u16(&mut self) -> Result<u16, ConnectionError> {
        let mut buf = [0u8; 2];
        transport::receive_exact(self.stream, &mut buf, self.timeout)
            .await
            .map_err(handshake_error)?;
        Ok(u16::from_be_bytes(buf))
    }

    async fn read_i32(&mut self) -> Result<i32, ConnectionError> {
        let mut buf = [0u8; 4];
        transport::receive_exact(self.stream, &mut buf, self.timeout)
            .await
            .map_err(handshake_error)?;
        Ok(i32::from_be_bytes(buf))
    }

    /// Array length with the 1/2/4-byte escape encoding
    async fn read_array_len(&mut self) -> Result<usize, ConnectionError> {
        let first = self.read_u8().await? as i8;
        let len = if first == ARRAY_LEN_I16 {
            let mut buf = [0u8; 2];
            transport::receive_exact(self.stream, &mut buf, self.timeout)
                .await
                .map_err(handshake_error)?;
            i64::from(i16::from_be_bytes(buf))
        } else if first == ARRAY_LEN_I32 {
            i64::from(self.read_i32().await?)
        } else {
            i64::from(first as u8)
        };
        if len < 0 {
            return Err(ConnectionError::Io(format!(
                "negative array length {len} in handshake reply"
            )));
        }
        Ok(len as usize)
    }

    /// String with the handshake type-tag encoding
    async fn read_string(&mut self) -> Result<Option<String>, ConnectionError> {
        let tag = self.read_u8().await?;
        match tag {
            tags::NULL_STRING => Ok(None),
            tags::ASCII_STRING => {
                let len = self.read_u16().await? as usize;
                let bytes = self.read_bytes(len).await?;
                Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
            }
            other => Err(ConnectionError::Io(format!(
                "unsupported string type tag {other} in handshake reply"
            ))),
        }
    }

    async fn skip(&mut self, len: usize) -> Result<(), ConnectionError> {
        self.read_bytes(len).await?;
        Ok(())
    }

    /// Consume the instantiator-metadata block notification channels carry.
    ///
    /// Three maps of registration metadata kept only for wire compatibility;
    /// nothing in them is used at this layer.
    async fn read_instantiator_data(&mut self) -> Result<(), ConnectionError> {
        let instantiators = self.read_array_len().await?;
        for _ in 0..instantiators {
            self.skip(6).await?;
            let names = self.read_array_len().await?;
            for _ in 0..names {
                self.read_string().await?;
            }
        }

        let serializers = self.read_array_len().await?;
        for _ in 0..serializers {
            self.skip(5).await?;
            self.read_string().await?;
        }

        let fixed_ids = self.read_array_len().await?;
        for _ in 0..fixed_ids {
            self.skip(6).await?;
            let names = self.read_array_len().await?;
            for _ in 0..names {
                self.read_string().await?;
            }
        }

        Ok(())
    }
}

/// Perform the handshake on a freshly established stream.
///
/// On `Err` the stream is poisoned; the caller must drop it.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn perform(
    stream: &mut IoStream,
    endpoint: &Endpoint,
    config: &ConnectionConfig,
    auth: Option<&Arc<dyn AuthProvider>>,
    ports: &PortSet,
    channel: ChannelRole,
    timeout: Duration,
) -> Result<HandshakeOutcome, ConnectionError> {
    let pool = endpoint.pool();
    let notification = channel.is_notification();
    let multi_user = pool.settings().multi_user_mode;
    let security_on = auth.is_some() || multi_user;

    let membership_id = match &pool.settings().membership_id {
        Some(id) => MembershipId::from_bytes(id.clone()),
        None => MembershipId::for_durable_client(&config.durable_client_id, config.durable_timeout()),
    };

    let notification_ports = if notification {
        Some(ports.snapshot())
    } else {
        let port = stream
            .local_port()
            .map_err(|e| ConnectionError::Io(e.to_string()))?;
        ports.insert(port);
        None
    };

    let (security_mode, credentials) = if notification && multi_user {
        (SecurityMode::MultiuserNotificationChannel, None)
    } else if let Some(provider) = auth {
        // forward channels defer credential exchange to a later request
        let credentials = if notification {
            Some(provider.credentials(&config.security_properties, endpoint.host())?)
        } else {
            None
        };
        (SecurityMode::CredentialsNormal, credentials)
    } else {
        (SecurityMode::CredentialsNone, None)
    };

    let request = HandshakeRequest {
        channel,
        notification_ports,
        membership_id: membership_id.as_bytes(),
        conflation: config.conflation_override(),
        security_mode,
        credentials: credentials.as_ref(),
    }
    .encode();

    transport::send_all(stream, &request, timeout)
        .await
        .map_err(handshake_error)?;

    let mut reader = HandshakeReader::new(stream, timeout);

    let acceptance = reader.read_u8().await?;
    if acceptance == AcceptanceCode::SslRequired as u8 && !config.ssl_enabled {
        return Err(ConnectionError::AuthenticationRequired(
            "server requires TLS and ssl_enabled is false".to_string(),
        ));
    }

    let queue_status = ServerQueueStatus::from_u8(reader.read_u8().await?);
    let raw_queue_size = reader.read_i32().await?;
    let queue_size = raw_queue_size.max(0);

    endpoint.set_server_queue_status(queue_status, queue_size);
    if notification
        && matches!(
            queue_status,
            ServerQueueStatus::Primary | ServerQueueStatus::NonRedundant
        )
    {
        pool.set_primary_server_queue_size(raw_queue_size);
    }

    if !notification {
        let len = reader.read_array_len().await?;
        let identity = reader.read_bytes(len).await?;
        endpoint.cache_member_identity(&identity);
    }

    // the trailing blob is opaque framing on success and the reason text
    // on rejection
    let blob_len = reader.read_u16().await? as usize;
    let blob = reader.read_bytes(blob_len).await?;
    let reason = String::from_utf8_lossy(&blob).into_owned();

    let delta_enabled_on_server = if !notification {
        Some(reader.read_u8().await? != 0)
    } else {
        None
    };

    match AcceptanceCode::from_u8(acceptance) {
        Some(AcceptanceCode::Ok) | Some(AcceptanceCode::SuccessfulNotificationChannel) => {
            if notification {
                reader.read_instantiator_data().await?;
            }
            debug!(
                endpoint = endpoint.name(),
                ?channel,
                ?queue_status,
                queue_size,
                "handshake accepted"
            );
            Ok(HandshakeOutcome {
                requires_follow_up_auth: !notification && security_on && !multi_user,
                delta_enabled_on_server,
                queue_status,
                queue_size,
            })
        }
        Some(AcceptanceCode::AuthenticationFailed) => {
            Err(ConnectionError::AuthenticationFailed(reason))
        }
        Some(AcceptanceCode::AuthenticationRequired) => {
            Err(ConnectionError::AuthenticationRequired(reason))
        }
        Some(AcceptanceCode::DuplicateDurableClient) => {
            Err(ConnectionError::DuplicateDurableClient(reason))
        }
        Some(AcceptanceCode::Refused)
        | Some(AcceptanceCode::Invalid)
        | Some(AcceptanceCode::UnsuccessfulNotificationChannel) => {
            warn!(endpoint = endpoint.name(), %reason, "handshake rejected");
            Err(ConnectionError::HandshakeRejected(reason))
        }
        Some(AcceptanceCode::SslRequired) | None => Err(ConnectionError::UnknownServerError {
            code: acceptance,
            reason,
        }),
    }
}
