// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Devtunnel Host Contributors

// Devtunnel Host - Tunnel Host
// Drives one tunnel: endpoint registration, the host session, client
// sub-sessions, port refresh, reconnects and disposal

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use devtunnel_host_common::{
    HostEvent, HostSummary, SessionState, Tunnel, TunnelConnectionMode, TunnelEndpoint,
    TunnelRef,
};

use crate::error::{HostError, ManagementError};
use crate::forwarder::relay_connection;
use crate::management::{ManagementClient, TunnelRequestOptions};
use crate::relay::{
    generate_host_public_key, ChannelDecision, ChannelKind, DisconnectReason, IncomingChannel,
    ProtocolVariant, RelayConnector, RelayStream, TransportEvent,
};
use crate::session::{evaluate_channel_open, RelaySession, SessionRole};

/// Session request a client sends after changing the tunnel's ports
pub const REFRESH_PORTS_REQUEST: &str = "RefreshPorts";

/// SSH login method carrying no credential
const NO_CREDENTIAL_METHOD: &str = "none";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub delay: Duration,
    /// 0 retries forever
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            delay: Duration::from_secs(2),
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostOptions {
    /// Offered in preference order
    pub protocols: Vec<ProtocolVariant>,
    pub reconnect: ReconnectPolicy,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            protocols: vec![ProtocolVariant::Current, ProtocolVariant::Legacy],
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Idempotency key for endpoint registration
pub fn endpoint_signature(tunnel: &Tunnel, host_id: &str, public_keys: &[String]) -> String {
    format!(
        "{}.{}:{}.{}:{}:{}:{}",
        tunnel.tunnel_id,
        tunnel.cluster_id,
        tunnel.name.as_deref().unwrap_or_default(),
        tunnel.domain.as_deref().unwrap_or_default(),
        tunnel.has_ssh_port(),
        host_id,
        public_keys.join(",")
    )
}

#[derive(Debug, Clone)]
struct Registration {
    signature: String,
    relay_uri: String,
}

struct ClientEntry {
    session: Arc<RelaySession>,
    task: Option<JoinHandle<()>>,
}

struct HostInner {
    tunnel_ref: TunnelRef,
    host_id: String,
    endpoint_id: String,
    public_key: String,
    management: Arc<dyn ManagementClient>,
    connector: Arc<dyn RelayConnector>,
    options: HostOptions,
    events: broadcast::Sender<HostEvent>,
    session: Arc<RelaySession>,
    tunnel: RwLock<Option<Tunnel>>,
    registration: tokio::sync::Mutex<Option<Registration>>,
    clients: Mutex<HashMap<Uuid, ClientEntry>>,
    too_many_connections: AtomicBool,
    stop_reason: Mutex<Option<String>>,
    connect_lock: tokio::sync::Mutex<()>,
    dispose_lock: tokio::sync::Mutex<()>,
    disposed: watch::Sender<bool>,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
    connected_at: RwLock<Option<DateTime<Utc>>>,
}

/// Host for one tunnel. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TunnelHost {
    inner: Arc<HostInner>,
}

impl TunnelHost {
    pub fn new(
        tunnel_ref: TunnelRef,
        management: Arc<dyn ManagementClient>,
        connector: Arc<dyn RelayConnector>,
        options: HostOptions,
        events: broadcast::Sender<HostEvent>,
    ) -> Result<Self, HostError> {
        let host_id = Uuid::new_v4().to_string();
        let public_key = generate_host_public_key()?;
        let session = Arc::new(RelaySession::new(
            tunnel_ref.tunnel_id.clone(),
            SessionRole::Host,
            events.clone(),
        ));
        let (disposed, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(HostInner {
                endpoint_id: format!("{}-relay", host_id),
                host_id,
                public_key,
                tunnel_ref,
                management,
                connector,
                options,
                events,
                session,
                tunnel: RwLock::new(None),
                registration: tokio::sync::Mutex::new(None),
                clients: Mutex::new(HashMap::new()),
                too_many_connections: AtomicBool::new(false),
                stop_reason: Mutex::new(None),
                connect_lock: tokio::sync::Mutex::new(()),
                dispose_lock: tokio::sync::Mutex::new(()),
                disposed,
                cancel: CancellationToken::new(),
                started_at: Utc::now(),
                connected_at: RwLock::new(None),
            }),
        })
    }

    pub fn tunnel_id(&self) -> &str {
        &self.inner.tunnel_ref.tunnel_id
    }

    pub fn host_id(&self) -> &str {
        &self.inner.host_id
    }

    pub fn endpoint_id(&self) -> &str {
        &self.inner.endpoint_id
    }

    pub fn session(&self) -> &Arc<RelaySession> {
        &self.inner.session
    }

    pub fn is_disposed(&self) -> bool {
        *self.inner.disposed.borrow()
    }

    /// Another host took over the tunnel
    pub fn was_superseded(&self) -> bool {
        self.inner.too_many_connections.load(Ordering::SeqCst)
    }

    pub fn stop_reason(&self) -> Option<String> {
        lock(&self.inner.stop_reason).clone()
    }

    pub fn tunnel(&self) -> Option<Tunnel> {
        self.inner
            .tunnel
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn store_tunnel(&self, tunnel: Tunnel) {
        *self.inner.tunnel.write().unwrap_or_else(|p| p.into_inner()) = Some(tunnel);
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<Uuid, ClientEntry>> {
        lock(&self.inner.clients)
    }

    pub fn client_session_count(&self) -> usize {
        self.clients().len()
    }

    /// Resolves once the host is disposed
    pub async fn wait_disposed(&self) {
        let mut rx = self.inner.disposed.subscribe();
        let _ = rx.wait_for(|disposed| *disposed).await;
    }

    fn check_connectable(&self) -> Result<(), HostError> {
        if self.was_superseded() {
            return Err(HostError::TooManyConnections);
        }
        if self.is_disposed() || self.inner.session.is_disposed() {
            return Err(HostError::Cancelled);
        }
        Ok(())
    }

    /// Register with the directory and bring the host session up.
    ///
    /// Fails with `TooManyConnections` once another host has evicted this one,
    /// and with `Cancelled` after disposal.
    pub async fn connect(&self) -> Result<(), HostError> {
        let _guard = self.inner.connect_lock.lock().await;
        self.check_connectable()?;
        self.establish().await
    }

    async fn establish(&self) -> Result<(), HostError> {
        let tunnel_id = self.tunnel_id().to_string();

        let tunnel = self
            .inner
            .management
            .get_tunnel(&self.inner.tunnel_ref, &TunnelRequestOptions::for_host())
            .await?;
        self.store_tunnel(tunnel.clone());

        let relay_uri = self.ensure_endpoint(&tunnel).await?;
        let access_token = tunnel.host_access_token().ok_or_else(|| {
            HostError::Management(ManagementError::InvalidResponse(
                "tunnel has no host access token".to_string(),
            ))
        })?;

        self.check_connectable()?;
        let session = self.inner.session.clone();
        let events = session
            .connect(
                self.inner.connector.as_ref(),
                &relay_uri,
                access_token,
                &self.inner.options.protocols,
            )
            .await?;

        let variant = session.variant().unwrap_or(ProtocolVariant::Current);
        self.spawn_session_loop(session.clone(), events);

        if variant.capabilities().direct_forwarding {
            if let Err(e) = session.reconcile_ports(&tunnel.ports).await {
                if matches!(e, HostError::Cancelled) {
                    return Err(e);
                }
                warn!("[{}] Forwarding ports failed: {}", tunnel_id, e);
            }
        }

        *self
            .inner
            .connected_at
            .write()
            .unwrap_or_else(|p| p.into_inner()) = Some(Utc::now());
        info!("[{}] Hosting via {}", tunnel_id, variant);
        self.emit(HostEvent::Connected {
            tunnel_id,
            protocol: variant.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Register the relay endpoint unless the cached registration still matches
    async fn ensure_endpoint(&self, tunnel: &Tunnel) -> Result<String, HostError> {
        let public_keys = vec![self.inner.public_key.clone()];
        let signature = endpoint_signature(tunnel, &self.inner.host_id, &public_keys);

        let mut registration = self.inner.registration.lock().await;
        if let Some(current) = registration.as_ref() {
            if current.signature == signature {
                debug!("[{}] Endpoint registration unchanged", self.tunnel_id());
                return Ok(current.relay_uri.clone());
            }
        }

        let endpoint = TunnelEndpoint {
            id: Some(self.inner.endpoint_id.clone()),
            host_id: self.inner.host_id.clone(),
            host_public_keys: public_keys,
            connection_mode: TunnelConnectionMode::TunnelRelay,
            host_relay_uri: None,
            client_relay_uri: None,
        };

        let registered = self
            .inner
            .management
            .update_tunnel_endpoint(tunnel, &endpoint)
            .await?;
        let relay_uri = registered
            .host_relay_uri
            .filter(|uri| !uri.is_empty())
            .ok_or_else(|| {
                HostError::Management(ManagementError::InvalidResponse(
                    "endpoint registration returned no host relay URI".to_string(),
                ))
            })?;

        info!(
            "[{}] Registered relay endpoint {}",
            self.tunnel_id(),
            self.inner.endpoint_id
        );
        *registration = Some(Registration {
            signature,
            relay_uri: relay_uri.clone(),
        });
        Ok(relay_uri)
    }

    /// Re-read the declared ports and reconcile every ready session with them
    pub async fn refresh_ports(&self) -> Result<(), HostError> {
        self.check_connectable()?;

        let tunnel = self
            .inner
            .management
            .get_tunnel(&self.inner.tunnel_ref, &TunnelRequestOptions::for_host())
            .await?;
        self.store_tunnel(tunnel.clone());

        let mut sessions: Vec<Arc<RelaySession>> = self
            .clients()
            .values()
            .map(|c| c.session.clone())
            .filter(|s| s.is_ready())
            .collect();
        let host = &self.inner.session;
        let direct = host
            .variant()
            .is_some_and(|v| v.capabilities().direct_forwarding);
        if direct && host.is_ready() {
            sessions.push(host.clone());
        }

        debug!(
            "[{}] Refreshing ports on {} session(s)",
            self.tunnel_id(),
            sessions.len()
        );

        let results = join_all(sessions.iter().map(|s| s.reconcile_ports(&tunnel.ports))).await;
        for result in results {
            if let Err(e) = result {
                if self.is_disposed() {
                    return Err(HostError::Cancelled);
                }
                warn!("[{}] Port refresh failed on a session: {}", self.tunnel_id(), e);
            }
        }
        Ok(())
    }

    fn spawn_refresh(&self) {
        let host = self.clone();
        tokio::spawn(async move {
            if let Err(e) = host.refresh_ports().await {
                warn!("[{}] Port refresh failed: {}", host.tunnel_id(), e);
            }
        });
    }

    fn spawn_session_loop(
        &self,
        session: Arc<RelaySession>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        // Boxed so the loop's future type does not depend on `establish`
        let task: BoxFuture<'static, ()> = Box::pin(self.clone().run_session(session, events));
        tokio::spawn(task);
    }

    async fn run_session(
        self,
        session: Arc<RelaySession>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                TransportEvent::ChannelOpen(channel) => self.handle_channel_open(&session, channel),
                TransportEvent::Authenticating { method, reply } => {
                    // The relay already validated the access token; only the
                    // credential-less login is approved
                    let approved = method == NO_CREDENTIAL_METHOD;
                    if approved {
                        debug!("[{}] Approving '{}' login", self.tunnel_id(), method);
                    } else {
                        warn!("[{}] Rejecting '{}' login", self.tunnel_id(), method);
                    }
                    let _ = reply.send(approved);
                }
                TransportEvent::Authenticated => self.on_authenticated(&session),
                TransportEvent::SessionRequest {
                    request_type,
                    reply,
                } => {
                    let refresh = request_type == REFRESH_PORTS_REQUEST;
                    let _ = reply.send(refresh);
                    if refresh {
                        self.spawn_refresh();
                    } else {
                        debug!(
                            "[{}] Ignoring session request '{}'",
                            self.tunnel_id(),
                            request_type
                        );
                    }
                }
                TransportEvent::Closed { reason, message } => {
                    match session.role() {
                        SessionRole::Host => self.on_host_closed(reason, message).await,
                        SessionRole::Client => {
                            debug!("[{}] Client session closed: {}", self.tunnel_id(), reason);
                            session.dispose().await;
                        }
                    }
                    break;
                }
            }
        }
    }

    fn on_authenticated(&self, session: &Arc<RelaySession>) {
        if session.role() != SessionRole::Client {
            return;
        }
        session.mark_authenticated();

        let Some(tunnel) = self.tunnel() else {
            return;
        };
        let session = session.clone();
        let tunnel_id = self.tunnel_id().to_string();
        tokio::spawn(async move {
            if let Err(e) = session.reconcile_ports(&tunnel.ports).await {
                debug!("[{}] Client session forwarding stopped: {}", tunnel_id, e);
            }
        });
    }

    fn handle_channel_open(&self, session: &Arc<RelaySession>, channel: IncomingChannel) {
        let tunnel = self.tunnel();
        let variant = session.variant().unwrap_or(ProtocolVariant::Current);
        let decision = evaluate_channel_open(
            session.role(),
            variant,
            self.is_disposed() || session.is_disposed(),
            &channel.kind,
            tunnel.as_ref(),
        );

        let kind = channel.kind.clone();
        if let ChannelDecision::Reject(failure) = &decision {
            warn!(
                "[{}] Rejected {} channel: {:?}",
                self.tunnel_id(),
                kind.channel_type(),
                failure
            );
        }
        let Some(stream) = channel.resolve(decision) else {
            return;
        };

        match kind {
            ChannelKind::ForwardedTcpip { port } => {
                if !session.relay_forwarded(port, stream) {
                    debug!(
                        "[{}] No forwarder for port {}; dropping channel",
                        self.tunnel_id(),
                        port
                    );
                }
            }
            ChannelKind::DirectTcpip { port } => {
                let Some(target) = tunnel.as_ref().and_then(|t| t.port(port)).map(|p| p.target())
                else {
                    return;
                };
                let cancel = self.inner.cancel.child_token();
                let tunnel_id = self.tunnel_id().to_string();
                tokio::spawn(async move {
                    if let Err(e) = relay_connection(&target, stream, cancel).await {
                        debug!("[{}] Direct connection to {} ended: {}", tunnel_id, target, e);
                    }
                });
            }
            ChannelKind::ClientSessionStream => self.start_client_session(stream),
            // Interactive sessions are accepted but carry nothing
            ChannelKind::Session | ChannelKind::Other(_) => drop(stream),
        }
    }

    fn start_client_session(&self, stream: RelayStream) {
        let session = Arc::new(RelaySession::new(
            self.tunnel_id().to_string(),
            SessionRole::Client,
            self.inner.events.clone(),
        ));
        let id = session.id();
        self.clients().insert(
            id,
            ClientEntry {
                session: session.clone(),
                task: None,
            },
        );

        let host = self.clone();
        let task = tokio::spawn(async move {
            let connection = match host.inner.connector.accept_client_session(stream).await {
                Ok(connection) => connection,
                Err(e) => {
                    warn!("[{}] Client session failed: {}", host.tunnel_id(), e);
                    session.dispose().await;
                    host.clients().remove(&id);
                    return;
                }
            };

            match session.attach(connection).await {
                Ok(events) => {
                    info!("[{}] Client session {} connected", host.tunnel_id(), id);
                    host.clone().run_session(session.clone(), events).await;
                }
                Err(e) => debug!("[{}] Client session {} ended: {}", host.tunnel_id(), id, e),
            }

            session.dispose().await;
            host.clients().remove(&id);
        });

        if let Some(entry) = self.clients().get_mut(&id) {
            entry.task = Some(task);
        }
    }

    async fn on_host_closed(&self, reason: DisconnectReason, message: String) {
        let session = &self.inner.session;
        session.transport_closed();
        if self.is_disposed() || self.inner.cancel.is_cancelled() || session.is_disposed() {
            return;
        }

        if reason == DisconnectReason::TooManyConnections {
            self.inner.too_many_connections.store(true, Ordering::SeqCst);
            warn!(
                "[{}] Another host connected to this tunnel; not reconnecting",
                self.tunnel_id()
            );
            self.emit_error(HostError::TooManyConnections.to_string());
            self.dispose_with(&HostError::TooManyConnections.to_string())
                .await;
            return;
        }

        warn!(
            "[{}] Relay connection closed ({}): {}",
            self.tunnel_id(),
            reason,
            message
        );
        self.reconnect(reason).await;
    }

    async fn reconnect(&self, reason: DisconnectReason) {
        let policy = self.inner.options.reconnect.clone();
        let session = &self.inner.session;

        if !policy.enabled {
            let _ = session.transition(SessionState::Disconnected);
            self.dispose_with(&format!("connection closed: {}", reason))
                .await;
            return;
        }
        if let Err(e) = session.transition(SessionState::Reconnecting) {
            debug!("[{}] Not reconnecting: {}", self.tunnel_id(), e);
            return;
        }

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if policy.max_attempts != 0 && attempt > policy.max_attempts {
                error!(
                    "[{}] Giving up after {} reconnect attempts",
                    self.tunnel_id(),
                    policy.max_attempts
                );
                self.emit_error(format!("reconnect failed after {} attempts", policy.max_attempts));
                self.dispose_with("reconnect attempts exhausted").await;
                return;
            }

            info!("[{}] Reconnecting (attempt {})", self.tunnel_id(), attempt);
            self.emit(HostEvent::Reconnecting {
                tunnel_id: self.tunnel_id().to_string(),
                attempt,
                timestamp: Utc::now(),
            });

            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => return,
                _ = tokio::time::sleep(policy.delay) => {}
            }

            let result = {
                let _guard = self.inner.connect_lock.lock().await;
                match self.check_connectable() {
                    Ok(()) => self.establish().await,
                    Err(e) => Err(e),
                }
            };

            match result {
                Ok(()) => {
                    info!("[{}] Reconnected", self.tunnel_id());
                    return;
                }
                Err(HostError::Cancelled) | Err(HostError::TooManyConnections) => return,
                Err(HostError::NotLoggedIn) => {
                    error!("[{}] Reconnect failed: not logged in", self.tunnel_id());
                    self.emit_error(HostError::NotLoggedIn.to_string());
                    self.dispose_with(&HostError::NotLoggedIn.to_string()).await;
                    return;
                }
                Err(e) => warn!(
                    "[{}] Reconnect attempt {} failed: {}",
                    self.tunnel_id(),
                    attempt,
                    e
                ),
            }
        }
    }

    /// Stop hosting. Idempotent; later `connect` calls fail with `Cancelled`.
    pub async fn dispose(&self) {
        self.dispose_with("stopped").await;
    }

    pub async fn dispose_with(&self, reason: &str) {
        let _guard = self.inner.dispose_lock.lock().await;
        if self.is_disposed() {
            return;
        }
        info!("[{}] Disposing host: {}", self.tunnel_id(), reason);
        lock(&self.inner.stop_reason).get_or_insert_with(|| reason.to_string());

        self.inner.cancel.cancel();
        self.inner.session.dispose().await;

        let clients: Vec<ClientEntry> = self.clients().drain().map(|(_, c)| c).collect();
        for client in &clients {
            client.session.dispose().await;
        }
        for client in clients {
            if let Some(task) = client.task {
                if let Err(e) = task.await {
                    debug!("[{}] Client session task failed: {}", self.tunnel_id(), e);
                }
            }
        }

        let registered = self.inner.registration.lock().await.take().is_some();
        if registered && !self.was_superseded() {
            if let Some(tunnel) = self.tunnel() {
                match self
                    .inner
                    .management
                    .delete_tunnel_endpoints(&tunnel, &self.inner.endpoint_id)
                    .await
                {
                    Ok(()) => debug!("[{}] Deleted relay endpoint", self.tunnel_id()),
                    Err(e) => warn!(
                        "[{}] Failed to delete relay endpoint: {}",
                        self.tunnel_id(),
                        e
                    ),
                }
            }
        }

        self.inner.disposed.send_replace(true);
    }

    pub fn summary(&self) -> HostSummary {
        let session = &self.inner.session;
        let mut forwarded_ports = session.forwarded_ports();
        for client in self.clients().values() {
            for port in client.session.forwarded_ports() {
                if !forwarded_ports.iter().any(|p| p.port == port.port) {
                    forwarded_ports.push(port);
                }
            }
        }
        forwarded_ports.sort_by_key(|p| p.port);

        let state = if self.is_disposed() {
            SessionState::Disposed
        } else {
            session.state()
        };
        let cluster_id = self
            .tunnel()
            .map(|t| t.cluster_id)
            .or_else(|| self.inner.tunnel_ref.cluster_id.clone())
            .unwrap_or_default();

        HostSummary {
            tunnel_id: self.tunnel_id().to_string(),
            cluster_id,
            state,
            protocol: session.variant().map(|v| v.to_string()),
            forwarded_ports,
            client_sessions: self.client_session_count(),
            started_at: self.inner.started_at,
            connected_at: *self
                .inner
                .connected_at
                .read()
                .unwrap_or_else(|p| p.into_inner()),
        }
    }

    fn emit(&self, event: HostEvent) {
        if let Err(e) = self.inner.events.send(event) {
            debug!("[{}] No event subscribers: {}", self.tunnel_id(), e);
        }
    }

    fn emit_error(&self, error: String) {
        self.emit(HostEvent::Error {
            tunnel_id: Some(self.tunnel_id().to_string()),
            error,
            timestamp: Utc::now(),
        });
    }
}

impl std::fmt::Debug for TunnelHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelHost")
            .field("tunnel", &self.inner.tunnel_ref)
            .field("host_id", &self.inner.host_id)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}
