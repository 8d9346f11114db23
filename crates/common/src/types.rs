// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Devtunnel Host Contributors

// Common types for Devtunnel Host

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::network::ForwardTarget;

/// Access token scope used by the relay when a host connects
pub const HOST_SCOPE: &str = "host";

/// Tunnel as returned by the management directory.
///
/// Only the fields consumed by the host are modelled; unknown fields are
/// ignored on deserialization.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tunnel {
    pub tunnel_id: String,
    pub cluster_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub ports: Vec<TunnelPort>,
    #[serde(default)]
    pub endpoints: Vec<TunnelEndpoint>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub access_tokens: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_control: Option<TunnelAccessControl>,
}

impl Tunnel {
    pub fn tunnel_ref(&self) -> TunnelRef {
        TunnelRef::new(&self.tunnel_id, Some(self.cluster_id.clone()))
    }

    /// Whether any declared port speaks SSH
    pub fn has_ssh_port(&self) -> bool {
        self.ports.iter().any(TunnelPort::is_ssh)
    }

    /// Declared port numbers in tunnel order
    pub fn port_numbers(&self) -> Vec<u16> {
        self.ports.iter().map(|p| p.port_number).collect()
    }

    pub fn port(&self, port_number: u16) -> Option<&TunnelPort> {
        self.ports.iter().find(|p| p.port_number == port_number)
    }

    pub fn declares_port(&self, port_number: u16) -> bool {
        self.port(port_number).is_some()
    }

    /// Relay access token issued for the host scope
    pub fn host_access_token(&self) -> Option<&str> {
        self.access_tokens.get(HOST_SCOPE).map(String::as_str)
    }
}

// Access tokens are credentials, keep them out of logs
impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scopes: Vec<&String> = self.access_tokens.keys().collect();
        f.debug_struct("Tunnel")
            .field("tunnel_id", &self.tunnel_id)
            .field("cluster_id", &self.cluster_id)
            .field("name", &self.name)
            .field("domain", &self.domain)
            .field("description", &self.description)
            .field("ports", &self.ports)
            .field("endpoints", &self.endpoints)
            .field("access_token_scopes", &scopes)
            .field("access_control", &self.access_control)
            .finish()
    }
}

/// A declared tunnel port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelPort {
    pub port_number: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// Free text; `"<host>:<port>"` names an explicit relay destination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TunnelPort {
    pub fn new(port_number: u16) -> Self {
        Self {
            port_number,
            protocol: None,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn is_ssh(&self) -> bool {
        self.protocol
            .as_deref()
            .is_some_and(|p| p.eq_ignore_ascii_case("ssh"))
    }

    /// Where inbound connections on this port are relayed to
    pub fn target(&self) -> ForwardTarget {
        ForwardTarget::for_port(self.port_number, self.description.as_deref())
    }
}

/// How clients reach a host endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TunnelConnectionMode {
    LocalNetwork,
    #[default]
    TunnelRelay,
}

/// A host's relay registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelEndpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub host_id: String,
    #[serde(default)]
    pub host_public_keys: Vec<String>,
    #[serde(default)]
    pub connection_mode: TunnelConnectionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_relay_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_relay_uri: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelAccessControl {
    #[serde(default)]
    pub entries: Vec<TunnelAccessControlEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelAccessControlEntry {
    #[serde(rename = "type")]
    pub entry_type: String,
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub is_deny: bool,
}

/// Identifies a tunnel in the directory
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelRef {
    pub tunnel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
}

impl TunnelRef {
    pub fn new(tunnel_id: impl Into<String>, cluster_id: Option<String>) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            cluster_id,
        }
    }
}

impl fmt::Display for TunnelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cluster_id {
            Some(cluster) => write!(f, "{}.{}", self.tunnel_id, cluster),
            None => f.write_str(&self.tunnel_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDetails {
    pub cluster_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure_location: Option<String>,
}

/// One entry of the signed-in user's service limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLimit {
    pub name: String,
    #[serde(default)]
    pub limit: u64,
    #[serde(default)]
    pub current_value: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_seconds: Option<u64>,
}

/// Lifecycle of a relay session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Active,
    Closing,
    Reconnecting,
    Disposed,
}

impl SessionState {
    /// Whether moving from `self` to `next` is a legal step.
    /// `Disposed` is reachable from anywhere and left by nothing.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        if self == Disposed {
            return false;
        }
        if next == Disposed {
            return true;
        }

        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Authenticating)
                | (Connecting, Disconnected)
                | (Authenticating, Active)
                | (Authenticating, Disconnected)
                | (Active, Closing)
                | (Active, Reconnecting)
                | (Active, Disconnected)
                | (Closing, Disconnected)
                | (Closing, Reconnecting)
                | (Reconnecting, Connecting)
                | (Reconnecting, Disconnected)
        )
    }

    pub fn is_active(self) -> bool {
        self == SessionState::Active
    }

    pub fn is_disposed(self) -> bool {
        self == SessionState::Disposed
    }

    /// Check if the state represents a transitional state
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            SessionState::Connecting
                | SessionState::Authenticating
                | SessionState::Closing
                | SessionState::Reconnecting
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Authenticating => "authenticating",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Disposed => "disposed",
        };
        f.write_str(s)
    }
}

/// Events emitted by the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostEvent {
    /// Host started connecting
    Starting {
        tunnel_id: String,
        timestamp: DateTime<Utc>,
    },

    /// Relay session is active
    Connected {
        tunnel_id: String,
        protocol: String,
        timestamp: DateTime<Utc>,
    },

    Reconnecting {
        tunnel_id: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },

    PortForwarded {
        tunnel_id: String,
        port: u16,
        target: String,
        timestamp: DateTime<Utc>,
    },

    /// The relay declined to forward a port
    PortRejected {
        tunnel_id: String,
        port: u16,
        timestamp: DateTime<Utc>,
    },

    PortRemoved {
        tunnel_id: String,
        port: u16,
        timestamp: DateTime<Utc>,
    },

    /// One line of authentication helper output
    LoginOutput {
        line: String,
        timestamp: DateTime<Utc>,
    },

    /// Host disposed and removed from the registry
    Stopped {
        tunnel_id: String,
        reason: String,
        /// Another host took over the tunnel
        superseded: bool,
        timestamp: DateTime<Utc>,
    },

    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tunnel_id: Option<String>,
        error: String,
        timestamp: DateTime<Utc>,
    },

    Heartbeat {
        timestamp: DateTime<Utc>,
    },
}

impl HostEvent {
    pub fn tunnel_id(&self) -> Option<&str> {
        match self {
            HostEvent::Starting { tunnel_id, .. }
            | HostEvent::Connected { tunnel_id, .. }
            | HostEvent::Reconnecting { tunnel_id, .. }
            | HostEvent::PortForwarded { tunnel_id, .. }
            | HostEvent::PortRejected { tunnel_id, .. }
            | HostEvent::PortRemoved { tunnel_id, .. }
            | HostEvent::Stopped { tunnel_id, .. } => Some(tunnel_id),
            HostEvent::Error { tunnel_id, .. } => tunnel_id.as_deref(),
            HostEvent::LoginOutput { .. } | HostEvent::Heartbeat { .. } => None,
        }
    }
}

/// A live forwarder as reported by the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedPort {
    pub port: u16,
    pub target: ForwardTarget,
}

/// Status of a running tunnel host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSummary {
    pub tunnel_id: String,
    pub cluster_id: String,
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default)]
    pub forwarded_ports: Vec<ForwardedPort>,
    #[serde(default)]
    pub client_sessions: usize,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
}

/// Login flavours understood by the authentication helper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LoginPlatform {
    #[default]
    Github,
    GithubCode,
    Aad,
    AadCode,
}

impl LoginPlatform {
    /// Helper flags selecting this login flow
    pub fn helper_args(self) -> &'static [&'static str] {
        match self {
            LoginPlatform::Github => &["-g"],
            LoginPlatform::GithubCode => &["-g", "-d"],
            LoginPlatform::Aad => &["-a"],
            LoginPlatform::AadCode => &["-a", "-d"],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LoginPlatform::Github => "github",
            LoginPlatform::GithubCode => "github-code",
            LoginPlatform::Aad => "aad",
            LoginPlatform::AadCode => "aad-code",
        }
    }
}

impl fmt::Display for LoginPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoginPlatform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "github" | "gh" => Ok(LoginPlatform::Github),
            "github-code" => Ok(LoginPlatform::GithubCode),
            "aad" | "microsoft" => Ok(LoginPlatform::Aad),
            "aad-code" | "microsoft-code" => Ok(LoginPlatform::AadCode),
            other => Err(format!("unknown login provider '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub platform: LoginPlatform,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartHostRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
}

/// Sign-in status reported by the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserStatus {
    pub logged_in: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

/// Error body returned by the daemon API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Machine readable error class (`not_logged_in`, `too_many_connections`, ...)
    pub kind: String,
}
