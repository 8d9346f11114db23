// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Devtunnel Host Contributors

// Devtunnel Host - Session Module
// One secured relay connection, its state machine and its port forwarders

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use devtunnel_host_common::{ForwardedPort, HostEvent, SessionState, Tunnel, TunnelPort};

use crate::error::{HostError, RelayError};
use crate::forwarder::{PortForwarder, LOOPBACK_BIND};
use crate::relay::{
    ChannelDecision, ChannelKind, ChannelOpenFailure, DisconnectReason, ProtocolVariant,
    RelayConnection, RelayConnector, RelayStream, SessionTransport, TransportEvent,
};

/// Failure message for channels opened while the host shuts down
pub const HOST_DISCONNECTING: &str = "The host is disconnecting.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// The host's own outbound session
    Host,
    /// Inbound per-client sub-session (legacy protocol)
    Client,
}

/// Result of a forwarding request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    Forwarded,
    AlreadyForwarded,
    /// The relay declined; nothing was registered
    Rejected,
}

/// Decide whether an inbound channel is accepted
pub fn evaluate_channel_open(
    role: SessionRole,
    variant: ProtocolVariant,
    disposed: bool,
    kind: &ChannelKind,
    tunnel: Option<&Tunnel>,
) -> ChannelDecision {
    if disposed {
        return ChannelDecision::Reject(ChannelOpenFailure::ConnectFailed(
            HOST_DISCONNECTING.to_string(),
        ));
    }

    let declared = |port: u16| tunnel.is_some_and(|t| t.declares_port(port));

    match (role, kind) {
        (_, ChannelKind::DirectTcpip { port }) => {
            if declared(*port) {
                ChannelDecision::Accept
            } else {
                ChannelDecision::Reject(ChannelOpenFailure::AdministrativelyProhibited)
            }
        }
        (SessionRole::Host, ChannelKind::ForwardedTcpip { .. })
            if variant.capabilities().direct_forwarding =>
        {
            ChannelDecision::Accept
        }
        (SessionRole::Host, ChannelKind::ClientSessionStream)
            if variant == ProtocolVariant::Legacy =>
        {
            ChannelDecision::Accept
        }
        (SessionRole::Client, ChannelKind::ForwardedTcpip { .. })
        | (SessionRole::Client, ChannelKind::Session) => ChannelDecision::Accept,
        _ => ChannelDecision::Reject(ChannelOpenFailure::UnknownChannelType),
    }
}

/// A relay session.
///
/// The state only moves along the edges allowed by `SessionState`; once
/// `Disposed`, every operation fails with `HostError::Cancelled`.
pub struct RelaySession {
    id: Uuid,
    tunnel_id: String,
    role: SessionRole,
    state: watch::Sender<SessionState>,
    transport: RwLock<Option<Arc<dyn SessionTransport>>>,
    variant: RwLock<Option<ProtocolVariant>>,
    authenticated: AtomicBool,
    forwarders: Mutex<HashMap<u16, PortForwarder>>,
    /// Forwarding requests on one transport are issued one at a time
    forward_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<HostEvent>,
}

impl RelaySession {
    pub fn new(
        tunnel_id: impl Into<String>,
        role: SessionRole,
        events: broadcast::Sender<HostEvent>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            id: Uuid::new_v4(),
            tunnel_id: tunnel_id.into(),
            role,
            state,
            transport: RwLock::new(None),
            variant: RwLock::new(None),
            authenticated: AtomicBool::new(false),
            forwarders: Mutex::new(HashMap::new()),
            forward_lock: tokio::sync::Mutex::new(()),
            events,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    #[cfg(test)]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn is_disposed(&self) -> bool {
        self.state().is_disposed()
    }

    pub fn variant(&self) -> Option<ProtocolVariant> {
        *self.variant.read().unwrap_or_else(|p| p.into_inner())
    }

    /// Active with a live transport and a completed login
    pub fn is_ready(&self) -> bool {
        self.state().is_active()
            && self.authenticated.load(Ordering::SeqCst)
            && self.transport().is_some_and(|t| t.is_connected())
    }

    pub fn mark_authenticated(&self) {
        self.authenticated.store(true, Ordering::SeqCst);
    }

    fn transport(&self) -> Option<Arc<dyn SessionTransport>> {
        self.transport
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn replace_transport(
        &self,
        transport: Option<Arc<dyn SessionTransport>>,
    ) -> Option<Arc<dyn SessionTransport>> {
        std::mem::replace(
            &mut *self.transport.write().unwrap_or_else(|p| p.into_inner()),
            transport,
        )
    }

    fn forwarders(&self) -> MutexGuard<'_, HashMap<u16, PortForwarder>> {
        self.forwarders.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Fails once disposal has begun
    fn ensure_not_disposed(&self) -> Result<(), HostError> {
        if matches!(self.state(), SessionState::Closing | SessionState::Disposed) {
            Err(HostError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Move to `next`. Re-entering the current state is a no-op.
    pub fn transition(&self, next: SessionState) -> Result<(), HostError> {
        let mut result = Ok(());
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if current.is_disposed() {
                result = Err(HostError::Cancelled);
                return false;
            }
            if !current.can_transition_to(next) {
                result = Err(HostError::InvalidTransition {
                    from: *current,
                    to: next,
                });
                return false;
            }
            debug!("[{}] Session {} {} -> {}", self.tunnel_id, self.id, current, next);
            *current = next;
            true
        });
        result
    }

    /// Open a transport to the relay and bring the session to `Active`.
    /// Returns the transport's event feed.
    pub async fn connect(
        &self,
        connector: &dyn RelayConnector,
        relay_uri: &str,
        access_token: &str,
        protocols: &[ProtocolVariant],
    ) -> Result<mpsc::UnboundedReceiver<TransportEvent>, HostError> {
        self.ensure_not_disposed()?;
        self.transition(SessionState::Connecting)?;

        if let Some(stale) = self.replace_transport(None) {
            if stale.is_connected() {
                let _ = stale.close(DisconnectReason::ByApplication, "reconnecting").await;
            }
        }
        self.authenticated.store(false, Ordering::SeqCst);

        let connection = match connector.connect(relay_uri, access_token, protocols).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!("[{}] Relay connection failed: {}", self.tunnel_id, e);
                let _ = self.transition(SessionState::Disconnected);
                return Err(e.into());
            }
        };

        self.establish(connection).await
    }

    /// Run an already-open connection (a legacy client sub-session) through the handshake
    pub async fn attach(
        &self,
        connection: RelayConnection,
    ) -> Result<mpsc::UnboundedReceiver<TransportEvent>, HostError> {
        self.ensure_not_disposed()?;
        self.transition(SessionState::Connecting)?;
        self.establish(connection).await
    }

    async fn establish(
        &self,
        connection: RelayConnection,
    ) -> Result<mpsc::UnboundedReceiver<TransportEvent>, HostError> {
        let RelayConnection {
            variant,
            transport,
            events,
        } = connection;

        if self.is_disposed() {
            let _ = transport.close(DisconnectReason::ByApplication, HOST_DISCONNECTING).await;
            return Err(HostError::Cancelled);
        }

        *self.variant.write().unwrap_or_else(|p| p.into_inner()) = Some(variant);
        self.replace_transport(Some(transport.clone()));
        self.transition(SessionState::Authenticating)?;

        if let Err(e) = self.authenticate(variant, transport.as_ref()).await {
            let _ = transport.close(DisconnectReason::ByApplication, "authentication failed").await;
            self.replace_transport(None);
            let _ = self.transition(SessionState::Disconnected);
            return Err(e);
        }

        self.transition(SessionState::Active)?;
        info!(
            "[{}] Session {} active ({:?}, {})",
            self.tunnel_id, self.id, self.role, variant
        );
        Ok(events)
    }

    async fn authenticate(
        &self,
        variant: ProtocolVariant,
        transport: &dyn SessionTransport,
    ) -> Result<(), HostError> {
        match self.role {
            // Clients log in to us; the login is approved from the event feed
            SessionRole::Client => Ok(()),
            SessionRole::Host => {
                let capabilities = variant.capabilities();
                if capabilities.session_level_auth && transport.performed_key_exchange() {
                    debug!("[{}] Authenticating host session", self.tunnel_id);
                    if !transport.authenticate().await? {
                        return Err(RelayError::AuthenticationFailed.into());
                    }
                } else {
                    debug!(
                        "[{}] Skipping session authentication ({})",
                        self.tunnel_id, variant
                    );
                }
                self.mark_authenticated();
                Ok(())
            }
        }
    }

    /// Forward one declared port. Repeated calls for a forwarded port do nothing.
    /// `remote_address` and `remote_port` replace the matching part of the
    /// target derived from the port's description.
    pub async fn forward_port(
        &self,
        port: &TunnelPort,
        remote_address: Option<&str>,
        remote_port: Option<u16>,
    ) -> Result<ForwardOutcome, HostError> {
        self.ensure_not_disposed()?;
        let _serial = self.forward_lock.lock().await;
        self.ensure_not_disposed()?;

        let port_number = port.port_number;
        if self.forwarders().contains_key(&port_number) {
            debug!("[{}] Port {} already forwarded", self.tunnel_id, port_number);
            return Ok(ForwardOutcome::AlreadyForwarded);
        }

        if !self.state().is_active() {
            return Err(RelayError::Closed.into());
        }
        let transport = self.transport().ok_or(RelayError::Closed)?;
        let mut target = port.target();
        if let Some(address) = remote_address.filter(|a| !a.is_empty()) {
            target.host = address.to_string();
        }
        if let Some(remote_port) = remote_port.filter(|p| *p != 0) {
            target.port = remote_port;
        }

        let accepted = transport.forward_port(LOOPBACK_BIND, port_number).await?;
        self.ensure_not_disposed()?;

        if !accepted {
            warn!(
                "[{}] {}",
                self.tunnel_id,
                HostError::ForwardingRejected { port: port_number }
            );
            self.emit(HostEvent::PortRejected {
                tunnel_id: self.tunnel_id.clone(),
                port: port_number,
                timestamp: Utc::now(),
            });
            return Ok(ForwardOutcome::Rejected);
        }

        info!(
            "[{}] Forwarding port {} -> {}",
            self.tunnel_id, port_number, target
        );
        let forwarder = PortForwarder::new(self.id, port_number, target.clone());
        debug!("[{}] Registered forwarder {:?}", self.tunnel_id, forwarder.key());
        self.forwarders().insert(port_number, forwarder);
        self.emit(HostEvent::PortForwarded {
            tunnel_id: self.tunnel_id.clone(),
            port: port_number,
            target: target.to_string(),
            timestamp: Utc::now(),
        });
        Ok(ForwardOutcome::Forwarded)
    }

    /// Remove forwarders for ports that are no longer declared
    pub async fn retain_ports(&self, declared: &[u16]) -> Vec<u16> {
        let _serial = self.forward_lock.lock().await;

        let stale: Vec<PortForwarder> = {
            let mut forwarders = self.forwarders();
            let ports: Vec<u16> = forwarders
                .keys()
                .filter(|port| !declared.contains(port))
                .copied()
                .collect();
            ports
                .into_iter()
                .filter_map(|port| forwarders.remove(&port))
                .collect()
        };

        let transport = self.transport();
        let mut removed = Vec::with_capacity(stale.len());
        for forwarder in stale {
            let port = forwarder.port();
            forwarder.dispose();

            if let Some(transport) = transport.as_ref().filter(|t| t.is_connected()) {
                if let Err(e) = transport.cancel_forward(LOOPBACK_BIND, port).await {
                    debug!("[{}] Cancelling forward of {} failed: {}", self.tunnel_id, port, e);
                }
            }

            info!("[{}] Stopped forwarding port {}", self.tunnel_id, port);
            self.emit(HostEvent::PortRemoved {
                tunnel_id: self.tunnel_id.clone(),
                port,
                timestamp: Utc::now(),
            });
            removed.push(port);
        }
        removed
    }

    /// Make the forwarder set equal to `ports`: forward missing ports in list
    /// order, then drop forwarders for undeclared ones.
    pub async fn reconcile_ports(&self, ports: &[TunnelPort]) -> Result<(), HostError> {
        for port in ports {
            self.forward_port(port, None, None).await?;
        }

        let declared: Vec<u16> = ports.iter().map(|p| p.port_number).collect();
        self.retain_ports(&declared).await;
        Ok(())
    }

    pub fn forwarded_ports(&self) -> Vec<ForwardedPort> {
        let mut ports: Vec<ForwardedPort> = self
            .forwarders()
            .values()
            .map(|f| ForwardedPort {
                port: f.port(),
                target: f.target().clone(),
            })
            .collect();
        ports.sort_by_key(|p| p.port);
        ports
    }

    pub fn is_forwarding(&self, port: u16) -> bool {
        self.forwarders().contains_key(&port)
    }

    /// Hand an accepted `forwarded-tcpip` channel to its forwarder
    pub fn relay_forwarded(&self, port: u16, stream: RelayStream) -> bool {
        match self.forwarders().get(&port) {
            Some(forwarder) => {
                forwarder.relay(stream);
                true
            }
            None => false,
        }
    }

    /// Tear down every forwarder without touching the transport
    pub fn release_forwarders(&self) {
        let released: Vec<PortForwarder> = self.forwarders().drain().map(|(_, f)| f).collect();
        for forwarder in &released {
            forwarder.dispose();
        }
        if !released.is_empty() {
            debug!(
                "[{}] Released {} forwarder(s) of session {}",
                self.tunnel_id,
                released.len(),
                self.id
            );
        }
    }

    /// Mark the transport as gone after the peer closed it
    pub fn transport_closed(&self) {
        self.release_forwarders();
        self.replace_transport(None);
        self.authenticated.store(false, Ordering::SeqCst);
    }

    /// Terminal. Safe to call more than once.
    pub async fn dispose(&self) {
        if self.is_disposed() {
            return;
        }
        // Only an active session closes gracefully; anything else is cut short
        let next = if self.state().is_active() {
            SessionState::Closing
        } else {
            SessionState::Disposed
        };
        let _ = self.transition(next);

        self.release_forwarders();
        if let Some(transport) = self.replace_transport(None) {
            if transport.is_connected() {
                if let Err(e) = transport
                    .close(DisconnectReason::ByApplication, HOST_DISCONNECTING)
                    .await
                {
                    debug!("[{}] Closing transport failed: {}", self.tunnel_id, e);
                }
            }
        }
        self.authenticated.store(false, Ordering::SeqCst);

        let _ = self.transition(SessionState::Disposed);
        debug!("[{}] Session {} disposed", self.tunnel_id, self.id);
    }

    fn emit(&self, event: HostEvent) {
        if let Err(e) = self.events.send(event) {
            debug!("[{}] No event subscribers: {}", self.tunnel_id, e);
        }
    }
}

impl std::fmt::Debug for RelaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySession")
            .field("id", &self.id)
            .field("tunnel_id", &self.tunnel_id)
            .field("role", &self.role)
            .field("state", &self.state())
            .field("variant", &self.variant())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeConnector, FakeTransport};
    use std::time::Duration;

    const RELAY_URI: &str = "wss://relay.test/host";

    fn session() -> (RelaySession, broadcast::Receiver<HostEvent>) {
        let (tx, rx) = broadcast::channel(64);
        (RelaySession::new("t1", SessionRole::Host, tx), rx)
    }

    async fn connected(connector: &FakeConnector) -> (RelaySession, Arc<FakeTransport>) {
        let (session, _rx) = session();
        session
            .connect(connector, RELAY_URI, "token", &[ProtocolVariant::Current])
            .await
            .unwrap();
        (session, connector.transport(0))
    }

    #[tokio::test]
    async fn test_connect_reaches_active() {
        let connector = FakeConnector::new(ProtocolVariant::Current);
        let (session, transport) = connected(&connector).await;

        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.variant(), Some(ProtocolVariant::Current));
        assert!(session.is_ready());
        // Key exchange happened, so the current protocol logs in once
        assert_eq!(transport.auth_calls(), 1);
    }

    #[tokio::test]
    async fn test_legacy_skips_authentication() {
        let connector = FakeConnector::new(ProtocolVariant::Legacy);
        let (session, _rx) = session();
        session
            .connect(&connector, RELAY_URI, "token", &[ProtocolVariant::Legacy])
            .await
            .unwrap();

        assert_eq!(connector.transport(0).auth_calls(), 0);
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_authentication_failure_disconnects() {
        let connector = FakeConnector::new(ProtocolVariant::Current).failing_auth();
        let (session, _rx) = session();
        let err = session
            .connect(&connector, RELAY_URI, "token", &[ProtocolVariant::Current])
            .await
            .unwrap_err();

        assert!(matches!(err, HostError::Transport(RelayError::AuthenticationFailed)));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!connector.transport(0).is_connected());
    }

    #[tokio::test]
    async fn test_forward_port_is_idempotent() {
        let connector = FakeConnector::new(ProtocolVariant::Current);
        let (session, transport) = connected(&connector).await;
        let port = TunnelPort::new(8080);

        assert_eq!(
            session.forward_port(&port, None, None).await.unwrap(),
            ForwardOutcome::Forwarded
        );
        assert_eq!(
            session.forward_port(&port, None, None).await.unwrap(),
            ForwardOutcome::AlreadyForwarded
        );

        assert_eq!(transport.forward_requests(), vec![8080]);
        assert_eq!(session.forwarded_ports().len(), 1);
    }

    #[tokio::test]
    async fn test_forward_targets_follow_port_description() {
        let connector = FakeConnector::new(ProtocolVariant::Current);
        let (session, transport) = connected(&connector).await;

        let ports = vec![
            TunnelPort::new(8080),
            TunnelPort::new(9000).with_description("10.0.0.5:80"),
        ];
        session.reconcile_ports(&ports).await.unwrap();

        let forwarded = session.forwarded_ports();
        assert_eq!(forwarded.len(), 2);
        assert_eq!(forwarded[0].port, 8080);
        assert_eq!(forwarded[0].target.address(), "localhost:8080");
        assert_eq!(forwarded[1].port, 9000);
        assert_eq!(forwarded[1].target.address(), "10.0.0.5:80");

        // The bind side never follows the custom target
        assert!(transport.bind_hosts().iter().all(|h| h == LOOPBACK_BIND));
    }

    #[tokio::test]
    async fn test_remote_overrides_replace_derived_target() {
        let connector = FakeConnector::new(ProtocolVariant::Current);
        let (session, transport) = connected(&connector).await;

        let described = TunnelPort::new(9000).with_description("10.0.0.5:80");
        session
            .forward_port(&described, None, Some(8443))
            .await
            .unwrap();
        session
            .forward_port(&TunnelPort::new(3000), Some("db.internal"), None)
            .await
            .unwrap();

        let forwarded = session.forwarded_ports();
        assert_eq!(forwarded[0].port, 3000);
        assert_eq!(forwarded[0].target.address(), "db.internal:3000");
        assert_eq!(forwarded[1].port, 9000);
        assert_eq!(forwarded[1].target.address(), "10.0.0.5:8443");

        assert_eq!(transport.forward_requests(), vec![9000, 3000]);
        assert!(transport.bind_hosts().iter().all(|h| h == LOOPBACK_BIND));
    }

    #[tokio::test]
    async fn test_rejected_port_is_skipped() {
        let connector = FakeConnector::new(ProtocolVariant::Current).rejecting(&[22]);
        let (session, mut rx) = session();
        session
            .connect(&connector, RELAY_URI, "token", &[ProtocolVariant::Current])
            .await
            .unwrap();

        let ports = vec![TunnelPort::new(22), TunnelPort::new(3000)];
        session.reconcile_ports(&ports).await.unwrap();

        assert!(!session.is_forwarding(22));
        assert!(session.is_forwarding(3000));

        let mut rejected = false;
        while let Ok(event) = rx.try_recv() {
            if let HostEvent::PortRejected { port, .. } = event {
                assert_eq!(port, 22);
                rejected = true;
            }
        }
        assert!(rejected);
    }

    #[tokio::test]
    async fn test_reconcile_matches_declared_set() {
        let connector = FakeConnector::new(ProtocolVariant::Current);
        let (session, transport) = connected(&connector).await;

        session
            .reconcile_ports(&[TunnelPort::new(8080), TunnelPort::new(9000)])
            .await
            .unwrap();
        session
            .reconcile_ports(&[TunnelPort::new(9000), TunnelPort::new(7000)])
            .await
            .unwrap();

        let ports: Vec<u16> = session.forwarded_ports().iter().map(|p| p.port).collect();
        assert_eq!(ports, vec![7000, 9000]);
        assert_eq!(transport.cancelled(), vec![8080]);
        // 9000 was not requested twice
        assert_eq!(transport.forward_requests(), vec![8080, 9000, 7000]);
    }

    #[tokio::test]
    async fn test_forwarding_is_sequential() {
        let connector =
            FakeConnector::new(ProtocolVariant::Current).with_forward_delay(Duration::from_millis(20));
        let (session, transport) = connected(&connector).await;

        let a = TunnelPort::new(1000);
        let b = TunnelPort::new(2000);
        let (ra, rb) = tokio::join!(
            session.forward_port(&a, None, None),
            session.forward_port(&b, None, None)
        );
        ra.unwrap();
        rb.unwrap();

        assert_eq!(transport.max_in_flight(), 1);
        assert_eq!(session.forwarded_ports().len(), 2);
    }

    #[tokio::test]
    async fn test_disposal_is_terminal() {
        let connector = FakeConnector::new(ProtocolVariant::Current);
        let (session, transport) = connected(&connector).await;
        session.forward_port(&TunnelPort::new(8080), None, None).await.unwrap();

        session.dispose().await;
        session.dispose().await;

        assert_eq!(session.state(), SessionState::Disposed);
        assert!(session.forwarded_ports().is_empty());
        assert_eq!(transport.closed_with(), Some(DisconnectReason::ByApplication));

        let err = session
            .connect(&connector, RELAY_URI, "token", &[ProtocolVariant::Current])
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::Cancelled));

        let err = session
            .forward_port(&TunnelPort::new(8080), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::Cancelled));

        assert!(matches!(
            session.transition(SessionState::Connecting),
            Err(HostError::Cancelled)
        ));
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_dispose_passes_through_closing() {
        let connector = FakeConnector::new(ProtocolVariant::Current);
        let (session, transport) = connected(&connector).await;
        session.forward_port(&TunnelPort::new(8080), None, None).await.unwrap();

        let mut state = session.subscribe_state();
        let observer = tokio::spawn(async move {
            let mut seen = Vec::new();
            while state.changed().await.is_ok() {
                let current = *state.borrow_and_update();
                seen.push(current);
                if current == SessionState::Disposed {
                    break;
                }
            }
            seen
        });
        tokio::task::yield_now().await;

        session.dispose().await;

        let seen = observer.await.unwrap();
        assert_eq!(seen, vec![SessionState::Closing, SessionState::Disposed]);
        assert!(session.forwarded_ports().is_empty());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_dispose_before_connect_skips_closing() {
        let (session, _rx) = session();
        let mut state = session.subscribe_state();

        session.dispose().await;

        assert!(state.has_changed().unwrap());
        assert_eq!(*state.borrow_and_update(), SessionState::Disposed);
    }

    #[test]
    fn test_illegal_transition_is_refused() {
        let (session, _rx) = session();
        let err = session.transition(SessionState::Active).unwrap_err();
        assert!(matches!(
            err,
            HostError::InvalidTransition {
                from: SessionState::Disconnected,
                to: SessionState::Active
            }
        ));
        // Same state is a no-op
        session.transition(SessionState::Disconnected).unwrap();
    }

    #[test]
    fn test_channel_open_decisions() {
        let tunnel = Tunnel {
            tunnel_id: "t1".to_string(),
            ports: vec![TunnelPort::new(8080)],
            ..Default::default()
        };
        let current = ProtocolVariant::Current;
        let legacy = ProtocolVariant::Legacy;
        let prohibited = ChannelDecision::Reject(ChannelOpenFailure::AdministrativelyProhibited);
        let unknown = ChannelDecision::Reject(ChannelOpenFailure::UnknownChannelType);

        let decide = |role, variant, kind: ChannelKind| {
            evaluate_channel_open(role, variant, false, &kind, Some(&tunnel))
        };

        assert_eq!(
            decide(SessionRole::Host, current, ChannelKind::ForwardedTcpip { port: 8080 }),
            ChannelDecision::Accept
        );
        assert_eq!(
            decide(SessionRole::Host, current, ChannelKind::DirectTcpip { port: 8080 }),
            ChannelDecision::Accept
        );
        assert_eq!(
            decide(SessionRole::Host, current, ChannelKind::DirectTcpip { port: 9999 }),
            prohibited
        );
        assert_eq!(
            decide(SessionRole::Host, legacy, ChannelKind::ClientSessionStream),
            ChannelDecision::Accept
        );
        assert_eq!(
            decide(SessionRole::Host, current, ChannelKind::ClientSessionStream),
            unknown
        );
        assert_eq!(
            decide(SessionRole::Client, legacy, ChannelKind::Session),
            ChannelDecision::Accept
        );
        assert_eq!(
            decide(SessionRole::Host, current, ChannelKind::Other("x11".to_string())),
            unknown
        );

        assert_eq!(
            evaluate_channel_open(
                SessionRole::Host,
                current,
                true,
                &ChannelKind::ForwardedTcpip { port: 8080 },
                Some(&tunnel)
            ),
            ChannelDecision::Reject(ChannelOpenFailure::ConnectFailed(
                HOST_DISCONNECTING.to_string()
            ))
        );
    }
}
