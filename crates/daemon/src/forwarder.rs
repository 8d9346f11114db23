// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Devtunnel Host Contributors

// Devtunnel Host - Port Forwarder
// Relays accepted relay channels to the port's local target

use std::fmt;
use std::io;

use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use devtunnel_host_common::ForwardTarget;

use crate::relay::RelayStream;

/// Address the host asks the relay to bind forwarded ports on.
/// Custom targets only change the relay destination, never this.
pub const LOOPBACK_BIND: &str = "127.0.0.1";

/// Live forwarding of one declared port on one session
pub struct PortForwarder {
    session_id: Uuid,
    port: u16,
    target: ForwardTarget,
    cancel: CancellationToken,
}

impl PortForwarder {
    pub fn new(session_id: Uuid, port: u16, target: ForwardTarget) -> Self {
        Self {
            session_id,
            port,
            target,
            cancel: CancellationToken::new(),
        }
    }

    /// (session, local port) pair this forwarder is registered under
    pub fn key(&self) -> (Uuid, u16) {
        (self.session_id, self.port)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn target(&self) -> &ForwardTarget {
        &self.target
    }

    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Relay one accepted channel to the target in the background
    pub fn relay(&self, stream: RelayStream) {
        let target = self.target.clone();
        let cancel = self.cancel.child_token();
        let port = self.port;

        tokio::spawn(async move {
            match relay_connection(&target, stream, cancel).await {
                Ok((to_target, from_target)) => debug!(
                    "Port {} connection closed: {} bytes to {}, {} bytes back",
                    port, to_target, target, from_target
                ),
                Err(e) => debug!("Port {} connection to {} ended: {}", port, target, e),
            }
        });
    }

    /// Stop relaying; open connections are torn down
    pub fn dispose(&self) {
        self.cancel.cancel();
    }
}

impl Drop for PortForwarder {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for PortForwarder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortForwarder")
            .field("session_id", &self.session_id)
            .field("port", &self.port)
            .field("target", &self.target)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Connect to `target` and copy bytes both ways until either side closes or `cancel` fires
pub async fn relay_connection(
    target: &ForwardTarget,
    mut stream: RelayStream,
    cancel: CancellationToken,
) -> io::Result<(u64, u64)> {
    let mut tcp = tokio::select! {
        _ = cancel.cancelled() => return Err(io::Error::new(io::ErrorKind::Interrupted, "forwarder disposed")),
        tcp = TcpStream::connect(target.address()) => tcp?,
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(io::Error::new(io::ErrorKind::Interrupted, "forwarder disposed")),
        copied = copy_bidirectional(&mut stream, &mut tcp) => copied,
    }
}
