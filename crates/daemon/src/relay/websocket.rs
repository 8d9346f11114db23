// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Devtunnel Host Contributors

// Devtunnel Host - WebSocket Relay Transport
// SSH (russh) running over the relay's websocket connection

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, Stream};
use russh::client::{self, AuthResult, Handle};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{
    HeaderValue, AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL, USER_AGENT,
};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::relay::transport::{
    ChannelKind, DisconnectReason, IncomingChannel, ProtocolVariant, RelayConnection,
    RelayConnector, RelayStream, SessionTransport, TransportEvent,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// SSH user name presented to the relay; the relay ignores it
const RELAY_USER: &str = "tunnel";

/// Byte-stream view of a websocket: binary frames in both directions
pub struct WsIo<S> {
    inner: WebSocketStream<S>,
    read_buf: Vec<u8>,
    read_pos: usize,
}

impl<S> WsIo<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            read_buf: Vec::new(),
            read_pos: 0,
        }
    }
}

fn ws_to_io(err: tungstenite::Error) -> io::Error {
    match err {
        tungstenite::Error::Io(e) => e,
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            io::Error::new(io::ErrorKind::BrokenPipe, err)
        }
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

impl<S> AsyncRead for WsIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.read_pos < this.read_buf.len() {
                let available = &this.read_buf[this.read_pos..];
                let n = available.len().min(buf.remaining());
                buf.put_slice(&available[..n]);
                this.read_pos += n;
                return Poll::Ready(Ok(()));
            }

            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => {
                    this.read_buf = data;
                    this.read_pos = 0;
                }
                Some(Ok(Message::Close(_))) | None => return Poll::Ready(Ok(())),
                // Pings are answered by tungstenite on the next flush
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Poll::Ready(Err(ws_to_io(e))),
            }
        }
    }
}

impl<S> AsyncWrite for WsIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.inner).poll_ready(cx)).map_err(ws_to_io)?;
        Pin::new(&mut this.inner)
            .start_send(Message::Binary(buf.to_vec()))
            .map_err(ws_to_io)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_flush(cx)
            .map_err(ws_to_io)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_close(cx)
            .map_err(ws_to_io)
    }
}

fn map_disconnect(code: russh::Disconnect, message: &str) -> DisconnectReason {
    match code {
        russh::Disconnect::TooManyConnections => DisconnectReason::TooManyConnections,
        russh::Disconnect::ByApplication => DisconnectReason::ByApplication,
        russh::Disconnect::ConnectionLost => DisconnectReason::ConnectionLost,
        other => DisconnectReason::Other(format!("{:?}: {}", other, message)),
    }
}

/// russh client handler feeding the session's event channel
struct RelayClientHandler {
    events: mpsc::UnboundedSender<TransportEvent>,
    key_exchanged: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl RelayClientHandler {
    fn report_closed(&self, reason: DisconnectReason, message: String) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self
                .events
                .send(TransportEvent::Closed { reason, message });
        }
    }
}

impl client::Handler for RelayClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        // The relay is authenticated by TLS and the tunnel access token
        self.key_exchanged.store(true, Ordering::SeqCst);
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: russh::Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "Relay opened forwarded-tcpip channel {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );

        let Ok(port) = u16::try_from(connected_port) else {
            warn!("Ignoring forwarded channel for invalid port {}", connected_port);
            return Ok(());
        };

        let stream: RelayStream = Box::new(channel.into_stream());
        let incoming = IncomingChannel::new(ChannelKind::ForwardedTcpip { port }, stream, None);
        if self.events.send(TransportEvent::ChannelOpen(incoming)).is_err() {
            debug!("Session no longer listening; dropping channel");
        }
        Ok(())
    }

    async fn disconnected(
        &mut self,
        reason: client::DisconnectReason<Self::Error>,
    ) -> Result<(), Self::Error> {
        match reason {
            client::DisconnectReason::ReceivedDisconnect(info) => {
                info!(
                    "Relay disconnected: {:?} {}",
                    info.reason_code, info.message
                );
                self.report_closed(
                    map_disconnect(info.reason_code, &info.message),
                    info.message,
                );
                Ok(())
            }
            client::DisconnectReason::Error(e) => {
                self.report_closed(DisconnectReason::ConnectionLost, e.to_string());
                Err(e)
            }
        }
    }
}

/// SSH session to the relay
struct SshRelayTransport {
    handle: Mutex<Handle<RelayClientHandler>>,
    key_exchanged: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl SessionTransport for SshRelayTransport {
    fn performed_key_exchange(&self) -> bool {
        self.key_exchanged.load(Ordering::SeqCst)
    }

    async fn authenticate(&self) -> Result<bool, RelayError> {
        let mut handle = self.handle.lock().await;
        let result = handle.authenticate_none(RELAY_USER).await?;
        Ok(matches!(result, AuthResult::Success))
    }

    async fn forward_port(&self, bind_host: &str, port: u16) -> Result<bool, RelayError> {
        let mut handle = self.handle.lock().await;
        match handle.tcpip_forward(bind_host, u32::from(port)).await {
            Ok(_) => Ok(true),
            Err(russh::Error::RequestDenied) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn cancel_forward(&self, bind_host: &str, port: u16) -> Result<(), RelayError> {
        let mut handle = self.handle.lock().await;
        match handle.cancel_tcpip_forward(bind_host, u32::from(port)).await {
            Ok(()) | Err(russh::Error::RequestDenied) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn is_connected(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.handle
            .try_lock()
            .map(|handle| !handle.is_closed())
            .unwrap_or(true)
    }

    async fn close(&self, reason: DisconnectReason, message: &str) -> Result<(), RelayError> {
        let code = match reason {
            DisconnectReason::TooManyConnections => russh::Disconnect::TooManyConnections,
            DisconnectReason::ConnectionLost => russh::Disconnect::ConnectionLost,
            DisconnectReason::ByApplication | DisconnectReason::Other(_) => {
                russh::Disconnect::ByApplication
            }
        };

        self.closed.store(true, Ordering::SeqCst);
        let handle = self.handle.lock().await;
        if handle.is_closed() {
            return Ok(());
        }
        handle.disconnect(code, message, "en").await?;
        Ok(())
    }
}

/// Connects to the relay over `wss://` and runs SSH on top
#[derive(Debug, Clone)]
pub struct WebSocketRelayConnector {
    user_agent: String,
}

impl WebSocketRelayConnector {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
        }
    }

    fn ssh_config() -> Arc<client::Config> {
        Arc::new(client::Config {
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        })
    }
}

/// Drop variants this transport cannot carry traffic for. The legacy
/// protocol delivers clients as nested SSH sessions, which russh cannot accept.
fn servable_protocols(protocols: &[ProtocolVariant]) -> Result<Vec<ProtocolVariant>, RelayError> {
    let servable: Vec<ProtocolVariant> = protocols
        .iter()
        .copied()
        .filter(|p| p.capabilities().direct_forwarding)
        .collect();

    if servable.len() < protocols.len() {
        warn!("Not offering the legacy relay protocol: client sessions are unsupported");
    }
    if servable.is_empty() {
        return Err(RelayError::Negotiation(
            "no offered protocol is supported by the websocket transport".to_string(),
        ));
    }
    Ok(servable)
}

/// Map the relay's `Sec-WebSocket-Protocol` answer to one of the offered variants
fn selected_protocol(
    header: Option<&HeaderValue>,
    offered: &[ProtocolVariant],
    preferred: ProtocolVariant,
) -> Result<ProtocolVariant, RelayError> {
    let Some(value) = header else {
        return Ok(preferred);
    };

    let variant = value
        .to_str()
        .ok()
        .and_then(ProtocolVariant::from_subprotocol)
        .ok_or_else(|| {
            RelayError::Negotiation(format!("relay selected unknown protocol {:?}", value))
        })?;

    if !offered.contains(&variant) {
        return Err(RelayError::Negotiation(format!(
            "relay selected {} which was not offered",
            variant
        )));
    }
    Ok(variant)
}

fn header_value(value: &str) -> Result<HeaderValue, RelayError> {
    HeaderValue::from_str(value)
        .map_err(|e| RelayError::Negotiation(format!("invalid header value: {}", e)))
}

#[async_trait]
impl RelayConnector for WebSocketRelayConnector {
    async fn connect(
        &self,
        relay_uri: &str,
        access_token: &str,
        protocols: &[ProtocolVariant],
    ) -> Result<RelayConnection, RelayError> {
        let protocols = servable_protocols(protocols)?;
        let preferred = protocols[0];

        let offered = protocols
            .iter()
            .map(|p| p.subprotocol())
            .collect::<Vec<_>>()
            .join(", ");

        let mut request = relay_uri.into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(SEC_WEBSOCKET_PROTOCOL, header_value(&offered)?);
        headers.insert(
            AUTHORIZATION,
            header_value(&format!("tunnel {}", access_token))?,
        );
        headers.insert(USER_AGENT, header_value(&self.user_agent)?);

        info!("Connecting to relay {} (offering {})", relay_uri, offered);
        let (ws, response) =
            match tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(request))
                .await
            {
                Ok(Ok(connected)) => connected,
                Ok(Err(tungstenite::Error::Http(response))) => {
                    return Err(RelayError::Rejected(response.status().as_u16()))
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    return Err(RelayError::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "relay connection timed out",
                    )))
                }
            };

        let variant = selected_protocol(
            response.headers().get(SEC_WEBSOCKET_PROTOCOL),
            &protocols,
            preferred,
        )?;
        debug!("Relay selected protocol {}", variant);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let key_exchanged = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));
        let handler = RelayClientHandler {
            events: events_tx,
            key_exchanged: key_exchanged.clone(),
            closed: closed.clone(),
        };

        let handle = client::connect_stream(Self::ssh_config(), WsIo::new(ws), handler).await?;

        Ok(RelayConnection {
            variant,
            transport: Arc::new(SshRelayTransport {
                handle: Mutex::new(handle),
                key_exchanged,
                closed,
            }),
            events: events_rx,
        })
    }

    async fn accept_client_session(
        &self,
        _stream: RelayStream,
    ) -> Result<RelayConnection, RelayError> {
        Err(RelayError::Unsupported("client-ssh-session-stream"))
    }
}

/// Generate a host key and return its public half as base64 wire bytes
pub fn generate_host_public_key() -> Result<String, RelayError> {
    use russh::keys::{Algorithm, PrivateKey, PublicKeyBase64};

    let key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
        .map_err(|e| RelayError::Key(e.to_string()))?;
    Ok(key.public_key().public_key_base64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_tungstenite::tungstenite::protocol::Role;

    #[tokio::test]
    async fn test_ws_io_carries_bytes_both_ways() {
        let (a, b) = tokio::io::duplex(4096);
        let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(b, Role::Server, None).await;

        let mut client = WsIo::new(client);
        let mut server = WsIo::new(server);

        client.write_all(b"SSH-2.0-test\r\n").await.unwrap();
        client.flush().await.unwrap();

        let mut buf = [0u8; 14];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"SSH-2.0-test\r\n");

        server.write_all(b"pong").await.unwrap();
        server.flush().await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn test_legacy_is_never_offered() {
        assert_eq!(
            servable_protocols(&[ProtocolVariant::Current, ProtocolVariant::Legacy]).unwrap(),
            vec![ProtocolVariant::Current]
        );
        assert!(matches!(
            servable_protocols(&[ProtocolVariant::Legacy]),
            Err(RelayError::Negotiation(_))
        ));
        assert!(matches!(servable_protocols(&[]), Err(RelayError::Negotiation(_))));
    }

    #[test]
    fn test_legacy_selection_fails_negotiation() {
        let offered = [ProtocolVariant::Current];
        let current = ProtocolVariant::Current;

        let legacy = HeaderValue::from_static(ProtocolVariant::LEGACY_SUBPROTOCOL);
        assert!(matches!(
            selected_protocol(Some(&legacy), &offered, current),
            Err(RelayError::Negotiation(_))
        ));

        let unknown = HeaderValue::from_static("tunnel-relay-host-v9");
        assert!(matches!(
            selected_protocol(Some(&unknown), &offered, current),
            Err(RelayError::Negotiation(_))
        ));

        let selected = HeaderValue::from_static(current.subprotocol());
        assert_eq!(selected_protocol(Some(&selected), &offered, current).unwrap(), current);
        assert_eq!(selected_protocol(None, &offered, current).unwrap(), current);
    }

    #[test]
    fn test_generate_host_public_key() {
        let a = generate_host_public_key().unwrap();
        let b = generate_host_public_key().unwrap();
        assert!(!a.is_empty());
        assert_ne!(a, b);
    }

    #[test]
    fn test_map_disconnect() {
        assert_eq!(
            map_disconnect(russh::Disconnect::TooManyConnections, ""),
            DisconnectReason::TooManyConnections
        );
        assert_eq!(
            map_disconnect(russh::Disconnect::ByApplication, "bye"),
            DisconnectReason::ByApplication
        );
    }

    #[tokio::test]
    async fn test_client_session_streams_unsupported() {
        let connector = WebSocketRelayConnector::new("test");
        let (stream, _peer) = tokio::io::duplex(64);
        let err = connector
            .accept_client_session(Box::new(stream))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Unsupported(_)));
    }
}
