// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Devtunnel Host Contributors

// Devtunnel Host - Error Module
// Error classes surfaced by the host engine

use devtunnel_host_common::SessionState;
use thiserror::Error;

/// Errors raised by tunnel hosting, login and the token lifecycle
#[derive(Error, Debug)]
pub enum HostError {
    /// The directory answered 401 or no credential could be derived
    #[error("Not logged in")]
    NotLoggedIn,

    #[error("Login failed: {0}")]
    LoginFailed(String),

    /// Another host registered for the same tunnel; never auto-reconnect after this
    #[error("The tunnel is hosted by another connection (too many connections)")]
    TooManyConnections,

    #[error("Forwarding of port {port} was rejected by the relay")]
    ForwardingRejected { port: u16 },

    /// Operation on a session or host that has been disposed
    #[error("Operation cancelled: the host is disposed")]
    Cancelled,

    #[error("Tunnel {0} is already being hosted")]
    AlreadyHosting(String),

    #[error("Tunnel {0} is not being hosted")]
    HostNotFound(String),

    #[error("Relay transport error: {0}")]
    Transport(#[from] RelayError),

    #[error("Management API error: {0}")]
    Management(ManagementError),

    #[error("Authentication helper error: {0}")]
    Helper(String),

    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },
}

impl HostError {
    /// Machine readable class reported by the REST API
    pub fn kind(&self) -> &'static str {
        match self {
            HostError::NotLoggedIn => "not_logged_in",
            HostError::LoginFailed(_) => "login_failed",
            HostError::TooManyConnections => "too_many_connections",
            HostError::ForwardingRejected { .. } => "forwarding_rejected",
            HostError::Cancelled => "cancelled",
            HostError::AlreadyHosting(_) => "already_hosting",
            HostError::HostNotFound(_) => "host_not_found",
            HostError::Transport(_) => "transport",
            HostError::Management(_) => "management",
            HostError::Helper(_) => "helper",
            HostError::InvalidTransition { .. } => "invalid_transition",
        }
    }

    pub fn is_not_logged_in(&self) -> bool {
        matches!(self, HostError::NotLoggedIn)
    }
}

/// Directory failures are re-classified here: 401 becomes `NotLoggedIn`,
/// everything else passes through unchanged.
impl From<ManagementError> for HostError {
    fn from(err: ManagementError) -> Self {
        match err {
            ManagementError::Status { status: 401, .. } => HostError::NotLoggedIn,
            ManagementError::Credential(inner) => *inner,
            other => HostError::Management(other),
        }
    }
}

/// Errors from the tunnel-management HTTP adapter.
/// Status codes are reported as-is; classification happens in `HostError`.
#[derive(Error, Debug)]
pub enum ManagementError {
    #[error("request failed with status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The token store could not provide a credential
    #[error("credential unavailable: {0}")]
    Credential(Box<HostError>),
}

/// Errors from the relay transport
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("relay refused the connection with status {0}")]
    Rejected(u16),

    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("protocol negotiation failed: {0}")]
    Negotiation(String),

    #[error("relay authentication failed")]
    AuthenticationFailed,

    #[error("host key error: {0}")]
    Key(String),

    #[error("{0} is not supported by this transport")]
    Unsupported(&'static str),

    #[error("transport is closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unauthorized_maps_to_not_logged_in() {
        let err: HostError = ManagementError::Status {
            status: 401,
            message: "Unauthorized".to_string(),
        }
        .into();
        assert!(err.is_not_logged_in());
    }

    #[test]
    fn test_other_status_passes_through() {
        let err: HostError = ManagementError::Status {
            status: 404,
            message: "Tunnel not found".to_string(),
        }
        .into();
        match err {
            HostError::Management(ManagementError::Status { status, .. }) => assert_eq!(status, 404),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_credential_failure_unwraps() {
        let err: HostError = ManagementError::Credential(Box::new(HostError::NotLoggedIn)).into();
        assert!(err.is_not_logged_in());
        assert_eq!(err.kind(), "not_logged_in");
    }
}
