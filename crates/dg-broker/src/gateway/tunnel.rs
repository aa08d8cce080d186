//! WebSocket tunnel to the gateway

use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::codec::{Decoder, Encoder};
use url::Url;

use dg_core::config::DisplaySize;
use dg_core::traits::{Tunnel, TunnelConnector, TunnelRequest};
use dg_core::{AuthToken, GatewayError};
use dg_protocol::{Instruction, InstructionCodec};

use super::http::GatewayRestClient;

/// WebSocket subprotocol spoken by the gateway tunnel endpoint
pub const TUNNEL_SUBPROTOCOL: &str = "guacamole";

/// Opens WebSocket tunnels, provisioning a gateway connection when the
/// machine has none
pub struct WebSocketTunnelConnector {
    rest: Arc<GatewayRestClient>,
}

impl WebSocketTunnelConnector {
    pub fn new(rest: Arc<GatewayRestClient>) -> Self {
        Self { rest }
    }
}

/// Build the tunnel URL. The result carries the token and must not be logged.
pub fn tunnel_url(
    base: &str,
    token: &AuthToken,
    connection_id: &str,
    display: DisplaySize,
) -> Result<Url, GatewayError> {
    let mut url =
        Url::parse(base).map_err(|e| GatewayError::Handshake(format!("invalid tunnel url: {}", e)))?;
    url.query_pairs_mut()
        .append_pair("token", token.value.expose())
        .append_pair("GUAC_DATA_SOURCE", &token.data_source)
        .append_pair("GUAC_ID", connection_id)
        .append_pair("GUAC_TYPE", "c")
        .append_pair("GUAC_WIDTH", &display.width.to_string())
        .append_pair("GUAC_HEIGHT", &display.height.to_string())
        .append_pair("GUAC_DPI", &display.dpi.to_string());
    Ok(url)
}

fn ws_error(e: tungstenite::Error) -> GatewayError {
    match e {
        tungstenite::Error::Http(resp) => match resp.status().as_u16() {
            401 | 403 => GatewayError::Rejected(format!("tunnel refused with {}", resp.status())),
            status => GatewayError::Http { status },
        },
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            GatewayError::Closed
        }
        tungstenite::Error::Io(io) => GatewayError::Unreachable(io.to_string()),
        other => GatewayError::Transport(other.to_string()),
    }
}

#[async_trait]
impl TunnelConnector for WebSocketTunnelConnector {
    async fn connect(
        &self,
        token: &AuthToken,
        request: &TunnelRequest,
    ) -> Result<Box<dyn Tunnel>, GatewayError> {
        let descriptor = &request.descriptor;
        let (connection_id, provisioned) = match &descriptor.gateway_connection_id {
            Some(id) => (id.clone(), false),
            None => (self.rest.provision_connection(token, descriptor).await?, true),
        };

        // Owns the provisioned record from here on; dropping it deletes the record
        let lease = provisioned.then(|| {
            ConnectionLease::new(Arc::clone(&self.rest), token.clone(), connection_id.clone())
        });

        let stream = match self.open(token, &connection_id, request.display).await {
            Ok(stream) => stream,
            Err(e) => {
                if let Some(lease) = lease {
                    if let Err(cleanup) = lease.release().await {
                        tracing::warn!(
                            "Failed to delete gateway connection {}: {}",
                            connection_id,
                            cleanup
                        );
                    }
                }
                return Err(e);
            }
        };

        tracing::debug!(
            "{} tunnel open for {} (gateway connection {})",
            request.session_id,
            descriptor.machine_id,
            connection_id
        );

        Ok(Box::new(WebSocketTunnel {
            stream,
            codec: InstructionCodec::new(),
            buffer: BytesMut::new(),
            cleanup: lease,
            closed: false,
        }))
    }
}

impl WebSocketTunnelConnector {
    async fn open(
        &self,
        token: &AuthToken,
        connection_id: &str,
        display: DisplaySize,
    ) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, GatewayError> {
        let url = tunnel_url(&self.rest.config().tunnel_url, token, connection_id, display)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| GatewayError::Handshake(e.to_string()))?;
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(TUNNEL_SUBPROTOCOL));

        let (stream, _response) = connect_async(request).await.map_err(ws_error)?;
        Ok(stream)
    }
}

/// Gateway connection record created for one tunnel.
///
/// Deleted by [`ConnectionLease::release`], or from a spawned task when the
/// lease is dropped unreleased (an aborted session actor).
struct ConnectionLease {
    rest: Arc<GatewayRestClient>,
    token: AuthToken,
    identifier: String,
    armed: bool,
}

impl ConnectionLease {
    fn new(rest: Arc<GatewayRestClient>, token: AuthToken, identifier: String) -> Self {
        Self {
            rest,
            token,
            identifier,
            armed: true,
        }
    }

    async fn release(mut self) -> Result<(), GatewayError> {
        self.armed = false;
        self.rest
            .delete_connection(&self.token, &self.identifier)
            .await
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let identifier = std::mem::take(&mut self.identifier);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("Gateway connection {} leaked: no runtime to delete it", identifier);
            return;
        };
        let rest = Arc::clone(&self.rest);
        let token = self.token.clone();
        runtime.spawn(async move {
            match rest.delete_connection(&token, &identifier).await {
                Ok(()) => tracing::debug!("Deleted abandoned gateway connection {}", identifier),
                Err(e) => tracing::warn!(
                    "Failed to delete abandoned gateway connection {}: {}",
                    identifier,
                    e
                ),
            }
        });
    }
}

/// One gateway tunnel over WebSocket
pub struct WebSocketTunnel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    codec: InstructionCodec,
    buffer: BytesMut,
    cleanup: Option<ConnectionLease>,
    closed: bool,
}

#[async_trait]
impl Tunnel for WebSocketTunnel {
    async fn send(&mut self, instruction: Instruction) -> Result<(), GatewayError> {
        if self.closed {
            return Err(GatewayError::Closed);
        }
        let mut buf = BytesMut::with_capacity(instruction.encoded_len());
        self.codec.encode(instruction, &mut buf)?;
        let text = String::from_utf8(buf.to_vec())
            .map_err(|_| GatewayError::Protocol(dg_protocol::ProtocolError::InvalidUtf8))?;

        tracing::trace!("Sending {} bytes on tunnel", text.len());
        self.stream.send(Message::Text(text)).await.map_err(ws_error)
    }

    async fn recv(&mut self) -> Result<Option<Instruction>, GatewayError> {
        loop {
            // Buffered data first; the transport may pack several instructions per message
            if let Some(instruction) = self.codec.decode(&mut self.buffer)? {
                return Ok(Some(instruction));
            }
            if self.closed {
                return Ok(None);
            }

            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => self.buffer.extend_from_slice(text.as_bytes()),
                Some(Ok(Message::Binary(data))) => self.buffer.extend_from_slice(&data),
                Some(Ok(Message::Close(_))) | None => {
                    tracing::debug!("Tunnel closed by gateway");
                    self.closed = true;
                    return Ok(None);
                }
                // Pings are answered by tungstenite on the next read or write
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    self.closed = true;
                    return Err(ws_error(e));
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), GatewayError> {
        if !self.closed {
            self.closed = true;
            if let Err(e) = self.stream.close(None).await {
                tracing::debug!("Tunnel close handshake failed: {}", e);
            }
        }
        if let Some(lease) = self.cleanup.take() {
            lease.release().await?;
        }
        Ok(())
    }
}
