// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Devtunnel Host Contributors

// Devtunnel Host - Relay Transport
// Primitives the session engine needs from a relay connection

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

use crate::error::RelayError;

/// Byte stream of one accepted channel
pub trait RelayIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> RelayIo for T {}

pub type RelayStream = Box<dyn RelayIo>;

/// Relay protocol flavour, negotiated through websocket subprotocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolVariant {
    /// Host forwards ports on its own session
    Current,
    /// Host accepts one client sub-session per connecting client
    Legacy,
}

/// What a protocol variant lets the host do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Ports are forwarded on the host session itself
    pub direct_forwarding: bool,
    /// The host session authenticates (after a key exchange)
    pub session_level_auth: bool,
}

impl ProtocolVariant {
    pub const CURRENT_SUBPROTOCOL: &'static str = "tunnel-relay-host-v2-dev";
    pub const LEGACY_SUBPROTOCOL: &'static str = "tunnel-relay-host";

    pub fn subprotocol(self) -> &'static str {
        match self {
            ProtocolVariant::Current => Self::CURRENT_SUBPROTOCOL,
            ProtocolVariant::Legacy => Self::LEGACY_SUBPROTOCOL,
        }
    }

    pub fn from_subprotocol(value: &str) -> Option<Self> {
        match value.trim() {
            Self::CURRENT_SUBPROTOCOL => Some(ProtocolVariant::Current),
            Self::LEGACY_SUBPROTOCOL => Some(ProtocolVariant::Legacy),
            _ => None,
        }
    }

    pub fn capabilities(self) -> Capabilities {
        match self {
            ProtocolVariant::Current => Capabilities {
                direct_forwarding: true,
                session_level_auth: true,
            },
            ProtocolVariant::Legacy => Capabilities {
                direct_forwarding: false,
                session_level_auth: false,
            },
        }
    }
}

impl fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.subprotocol())
    }
}

/// Why a transport went away
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    ByApplication,
    ConnectionLost,
    /// Another host took over the tunnel
    TooManyConnections,
    Other(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ByApplication => f.write_str("closed by application"),
            DisconnectReason::ConnectionLost => f.write_str("connection lost"),
            DisconnectReason::TooManyConnections => f.write_str("too many connections"),
            DisconnectReason::Other(reason) => f.write_str(reason),
        }
    }
}

/// Channel types the relay may open towards the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    /// Inbound connection for a port this session forwarded
    ForwardedTcpip { port: u16 },
    /// Client asks for a connection to a specific port
    DirectTcpip { port: u16 },
    /// Legacy per-client sub-session stream
    ClientSessionStream,
    Session,
    Other(String),
}

impl ChannelKind {
    pub fn channel_type(&self) -> &str {
        match self {
            ChannelKind::ForwardedTcpip { .. } => "forwarded-tcpip",
            ChannelKind::DirectTcpip { .. } => "direct-tcpip",
            ChannelKind::ClientSessionStream => "client-ssh-session-stream",
            ChannelKind::Session => "session",
            ChannelKind::Other(kind) => kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOpenFailure {
    AdministrativelyProhibited,
    ConnectFailed(String),
    UnknownChannelType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelDecision {
    Accept,
    Reject(ChannelOpenFailure),
}

/// A channel-open request waiting for a decision
pub struct IncomingChannel {
    pub kind: ChannelKind,
    stream: RelayStream,
    reply: Option<oneshot::Sender<ChannelDecision>>,
}

impl IncomingChannel {
    pub fn new(
        kind: ChannelKind,
        stream: RelayStream,
        reply: Option<oneshot::Sender<ChannelDecision>>,
    ) -> Self {
        Self {
            kind,
            stream,
            reply,
        }
    }

    /// Report the decision to the transport; accepted channels hand back their stream
    pub fn resolve(mut self, decision: ChannelDecision) -> Option<RelayStream> {
        let accepted = decision == ChannelDecision::Accept;
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(decision);
        }
        accepted.then_some(self.stream)
    }
}

impl fmt::Debug for IncomingChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingChannel")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Notifications a transport pushes to its session
#[derive(Debug)]
pub enum TransportEvent {
    ChannelOpen(IncomingChannel),
    /// Peer attempts to log in; reply `true` to approve
    Authenticating {
        method: String,
        reply: oneshot::Sender<bool>,
    },
    Authenticated,
    SessionRequest {
        request_type: String,
        reply: oneshot::Sender<bool>,
    },
    Closed {
        reason: DisconnectReason,
        message: String,
    },
}

/// Secured multiplexed connection to the relay
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Whether the transport went through a key exchange
    fn performed_key_exchange(&self) -> bool;

    /// No-credential login; strong auth already happened at the relay layer
    async fn authenticate(&self) -> Result<bool, RelayError>;

    /// Ask the peer to forward `port`. `Ok(false)` means the peer declined.
    async fn forward_port(&self, bind_host: &str, port: u16) -> Result<bool, RelayError>;

    async fn cancel_forward(&self, bind_host: &str, port: u16) -> Result<(), RelayError>;

    fn is_connected(&self) -> bool;

    async fn close(&self, reason: DisconnectReason, message: &str) -> Result<(), RelayError>;
}

/// A connected transport plus its event feed
pub struct RelayConnection {
    pub variant: ProtocolVariant,
    pub transport: Arc<dyn SessionTransport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConnection")
            .field("variant", &self.variant)
            .finish_non_exhaustive()
    }
}

/// Opens relay transports
#[async_trait]
pub trait RelayConnector: Send + Sync {
    /// Connect to the relay offering `protocols` in preference order
    async fn connect(
        &self,
        relay_uri: &str,
        access_token: &str,
        protocols: &[ProtocolVariant],
    ) -> Result<RelayConnection, RelayError>;

    /// Run a client sub-session over a legacy per-client stream channel
    async fn accept_client_session(
        &self,
        stream: RelayStream,
    ) -> Result<RelayConnection, RelayError>;
}
