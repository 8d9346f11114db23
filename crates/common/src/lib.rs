// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Devtunnel Host Contributors

// Devtunnel Host - Common Library
// Shared tunnel data model, port target parsing and daemon client plumbing

pub mod daemon_client;
pub mod error;
pub mod network;
pub mod sse;
pub mod types;

pub use daemon_client::{create_daemon_client, DaemonClient, DaemonClientConfig};
pub use error::{Error, Result};
pub use network::{format_host_port, is_loopback_address, ForwardTarget, DEFAULT_TARGET_HOST};
pub use sse::EventListener;
pub use types::{
    ClusterDetails, ErrorResponse, ForwardedPort, HostEvent, HostSummary, LoginPlatform,
    LoginRequest, SessionState, StartHostRequest, Tunnel, TunnelAccessControl,
    TunnelAccessControlEntry, TunnelConnectionMode, TunnelEndpoint, TunnelPort, TunnelRef,
    UserLimit, UserStatus, HOST_SCOPE,
};

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
