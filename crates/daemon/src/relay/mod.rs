// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Devtunnel Host Contributors

// Devtunnel Host - Relay Module

pub mod transport;
pub mod websocket;

pub use transport::{
    ChannelDecision, ChannelKind, ChannelOpenFailure, DisconnectReason, IncomingChannel,
    ProtocolVariant, RelayConnection, RelayConnector, RelayStream, SessionTransport,
    TransportEvent,
};
pub use websocket::{generate_host_public_key, WebSocketRelayConnector};
