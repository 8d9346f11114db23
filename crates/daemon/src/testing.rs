// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Devtunnel Host Contributors

// Devtunnel Host - Test Doubles
// Recording fakes for the relay, the directory and the auth helper

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use devtunnel_host_common::{
    ClusterDetails, LoginPlatform, Tunnel, TunnelEndpoint, TunnelPort, TunnelRef, UserLimit,
    HOST_SCOPE,
};

use crate::error::{HostError, ManagementError, RelayError};
use crate::management::{ManagementClient, TunnelRequestOptions};
use crate::relay::{
    ChannelDecision, ChannelKind, DisconnectReason, IncomingChannel, ProtocolVariant,
    RelayConnection, RelayConnector, RelayStream, SessionTransport, TransportEvent,
};
use crate::token::AuthHelper;

pub const GITHUB_WHOAMI: &str =
    "Welcome to dev tunnels!\nLogged in as alice using GitHub.\nUserId: 123\nabc\n";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Transport that records every request
#[derive(Default)]
pub struct FakeTransport {
    key_exchange: bool,
    auth_succeeds: bool,
    reject: HashSet<u16>,
    forward_delay: Duration,
    connected: AtomicBool,
    auth_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    forwards: Mutex<Vec<(String, u16)>>,
    cancels: Mutex<Vec<u16>>,
    closed_with: Mutex<Option<DisconnectReason>>,
}

impl FakeTransport {
    pub fn auth_calls(&self) -> usize {
        self.auth_calls.load(Ordering::SeqCst)
    }

    pub fn forward_requests(&self) -> Vec<u16> {
        lock(&self.forwards).iter().map(|(_, port)| *port).collect()
    }

    pub fn bind_hosts(&self) -> Vec<String> {
        lock(&self.forwards).iter().map(|(host, _)| host.clone()).collect()
    }

    pub fn cancelled(&self) -> Vec<u16> {
        lock(&self.cancels).clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn closed_with(&self) -> Option<DisconnectReason> {
        lock(&self.closed_with).clone()
    }

    /// Simulate the peer dropping the connection
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionTransport for FakeTransport {
    fn performed_key_exchange(&self) -> bool {
        self.key_exchange
    }

    async fn authenticate(&self) -> Result<bool, RelayError> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.auth_succeeds)
    }

    async fn forward_port(&self, bind_host: &str, port: u16) -> Result<bool, RelayError> {
        if !self.is_connected() {
            return Err(RelayError::Closed);
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.forward_delay.is_zero() {
            tokio::time::sleep(self.forward_delay).await;
        }
        lock(&self.forwards).push((bind_host.to_string(), port));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(!self.reject.contains(&port))
    }

    async fn cancel_forward(&self, _bind_host: &str, port: u16) -> Result<(), RelayError> {
        lock(&self.cancels).push(port);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self, reason: DisconnectReason, _message: &str) -> Result<(), RelayError> {
        tokio::task::yield_now().await;
        self.connected.store(false, Ordering::SeqCst);
        *lock(&self.closed_with) = Some(reason);
        Ok(())
    }
}

/// An opened fake connection: the transport plus the sender feeding its session
pub struct FakeLink {
    pub transport: Arc<FakeTransport>,
    pub events: mpsc::UnboundedSender<TransportEvent>,
}

impl FakeLink {
    pub fn send(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Peer closes the transport
    pub fn close(&self, reason: DisconnectReason) {
        self.transport.drop_connection();
        self.send(TransportEvent::Closed {
            reason,
            message: String::new(),
        });
    }

    /// Open a channel and return the decision plus the far end of its stream
    pub fn open_channel(
        &self,
        kind: ChannelKind,
    ) -> (oneshot::Receiver<ChannelDecision>, tokio::io::DuplexStream) {
        let (tx, rx) = oneshot::channel();
        let (near, far) = tokio::io::duplex(4096);
        self.send(TransportEvent::ChannelOpen(IncomingChannel::new(
            kind,
            Box::new(near),
            Some(tx),
        )));
        (rx, far)
    }
}

/// Connector handing out [`FakeTransport`]s
pub struct FakeConnector {
    variant: ProtocolVariant,
    key_exchange: bool,
    auth_succeeds: bool,
    reject: HashSet<u16>,
    forward_delay: Duration,
    failures: AtomicUsize,
    links: Mutex<Vec<FakeLink>>,
    clients: Mutex<Vec<FakeLink>>,
    offered: Mutex<Vec<Vec<ProtocolVariant>>>,
    tokens: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn new(variant: ProtocolVariant) -> Self {
        Self {
            variant,
            key_exchange: true,
            auth_succeeds: true,
            reject: HashSet::new(),
            forward_delay: Duration::ZERO,
            failures: AtomicUsize::new(0),
            links: Mutex::new(Vec::new()),
            clients: Mutex::new(Vec::new()),
            offered: Mutex::new(Vec::new()),
            tokens: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_auth(mut self) -> Self {
        self.auth_succeeds = false;
        self
    }

    pub fn rejecting(mut self, ports: &[u16]) -> Self {
        self.reject.extend(ports.iter().copied());
        self
    }

    pub fn with_forward_delay(mut self, delay: Duration) -> Self {
        self.forward_delay = delay;
        self
    }

    /// Make the next `count` connection attempts fail
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    fn transport_template(&self) -> FakeTransport {
        FakeTransport {
            key_exchange: self.key_exchange,
            auth_succeeds: self.auth_succeeds,
            reject: self.reject.clone(),
            forward_delay: self.forward_delay,
            connected: AtomicBool::new(true),
            ..Default::default()
        }
    }

    pub fn connect_count(&self) -> usize {
        lock(&self.links).len()
    }

    pub fn client_count(&self) -> usize {
        lock(&self.clients).len()
    }

    pub fn transport(&self, index: usize) -> Arc<FakeTransport> {
        lock(&self.links)[index].transport.clone()
    }

    pub fn link(&self, index: usize) -> FakeLink {
        let links = lock(&self.links);
        FakeLink {
            transport: links[index].transport.clone(),
            events: links[index].events.clone(),
        }
    }

    pub fn client(&self, index: usize) -> FakeLink {
        let clients = lock(&self.clients);
        FakeLink {
            transport: clients[index].transport.clone(),
            events: clients[index].events.clone(),
        }
    }

    pub fn offered(&self) -> Vec<Vec<ProtocolVariant>> {
        lock(&self.offered).clone()
    }

    pub fn access_tokens(&self) -> Vec<String> {
        lock(&self.tokens).clone()
    }

    fn open(&self, variant: ProtocolVariant) -> (FakeLink, RelayConnection) {
        let transport = Arc::new(self.transport_template());
        let (tx, rx) = mpsc::unbounded_channel();
        let link = FakeLink {
            transport: transport.clone(),
            events: tx,
        };
        let connection = RelayConnection {
            variant,
            transport,
            events: rx,
        };
        (link, connection)
    }
}

#[async_trait]
impl RelayConnector for FakeConnector {
    async fn connect(
        &self,
        _relay_uri: &str,
        access_token: &str,
        protocols: &[ProtocolVariant],
    ) -> Result<RelayConnection, RelayError> {
        lock(&self.offered).push(protocols.to_vec());
        lock(&self.tokens).push(access_token.to_string());

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RelayError::Rejected(503));
        }

        let variant = if protocols.contains(&self.variant) {
            self.variant
        } else {
            protocols.first().copied().unwrap_or(self.variant)
        };
        let (link, connection) = self.open(variant);
        lock(&self.links).push(link);
        Ok(connection)
    }

    async fn accept_client_session(
        &self,
        _stream: RelayStream,
    ) -> Result<RelayConnection, RelayError> {
        let (link, connection) = self.open(ProtocolVariant::Legacy);
        lock(&self.clients).push(link);
        Ok(connection)
    }
}

/// In-memory tunnel directory
pub struct FakeManagement {
    tunnel: Mutex<Tunnel>,
    unauthorized: AtomicBool,
    get_calls: AtomicUsize,
    updates: Mutex<Vec<TunnelEndpoint>>,
    deletes: Mutex<Vec<String>>,
}

impl FakeManagement {
    pub fn new(ports: Vec<TunnelPort>) -> Self {
        let mut access_tokens = HashMap::new();
        access_tokens.insert(HOST_SCOPE.to_string(), "host-token".to_string());

        Self {
            tunnel: Mutex::new(Tunnel {
                tunnel_id: "t1".to_string(),
                cluster_id: "asse".to_string(),
                name: Some("demo".to_string()),
                ports,
                access_tokens,
                ..Default::default()
            }),
            unauthorized: AtomicBool::new(false),
            get_calls: AtomicUsize::new(0),
            updates: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
        }
    }

    pub fn set_ports(&self, ports: Vec<TunnelPort>) {
        lock(&self.tunnel).ports = ports;
    }

    pub fn set_name(&self, name: &str) {
        lock(&self.tunnel).name = Some(name.to_string());
    }

    pub fn set_unauthorized(&self, unauthorized: bool) {
        self.unauthorized.store(unauthorized, Ordering::SeqCst);
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn endpoint_updates(&self) -> Vec<TunnelEndpoint> {
        lock(&self.updates).clone()
    }

    pub fn endpoint_deletes(&self) -> Vec<String> {
        lock(&self.deletes).clone()
    }

    fn check_auth(&self) -> Result<(), ManagementError> {
        if self.unauthorized.load(Ordering::SeqCst) {
            return Err(ManagementError::Status {
                status: 401,
                message: "Unauthorized".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ManagementClient for FakeManagement {
    async fn get_tunnel(
        &self,
        tunnel: &TunnelRef,
        _options: &TunnelRequestOptions,
    ) -> Result<Tunnel, ManagementError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.check_auth()?;

        let mut found = lock(&self.tunnel).clone();
        found.tunnel_id = tunnel.tunnel_id.clone();
        Ok(found)
    }

    async fn update_tunnel_endpoint(
        &self,
        _tunnel: &Tunnel,
        endpoint: &TunnelEndpoint,
    ) -> Result<TunnelEndpoint, ManagementError> {
        self.check_auth()?;
        lock(&self.updates).push(endpoint.clone());

        let mut registered = endpoint.clone();
        registered.host_relay_uri = Some(format!("wss://relay.test/host/{}", endpoint.host_id));
        Ok(registered)
    }

    async fn delete_tunnel_endpoints(
        &self,
        _tunnel: &Tunnel,
        endpoint_id: &str,
    ) -> Result<(), ManagementError> {
        self.check_auth()?;
        lock(&self.deletes).push(endpoint_id.to_string());
        Ok(())
    }

    async fn create_or_update_tunnel_port(
        &self,
        _tunnel: &Tunnel,
        port: &TunnelPort,
    ) -> Result<TunnelPort, ManagementError> {
        self.check_auth()?;
        let mut tunnel = lock(&self.tunnel);
        tunnel.ports.retain(|p| p.port_number != port.port_number);
        tunnel.ports.push(port.clone());
        Ok(port.clone())
    }

    async fn delete_tunnel_port(
        &self,
        _tunnel: &Tunnel,
        port_number: u16,
    ) -> Result<(), ManagementError> {
        self.check_auth()?;
        lock(&self.tunnel).ports.retain(|p| p.port_number != port_number);
        Ok(())
    }

    async fn user_limits(&self) -> Result<Vec<UserLimit>, ManagementError> {
        self.check_auth()?;
        Ok(vec![UserLimit {
            name: "TunnelsPerUser".to_string(),
            limit: 10,
            current_value: 1,
            period_seconds: None,
        }])
    }

    async fn list_clusters(&self) -> Result<Vec<ClusterDetails>, ManagementError> {
        Ok(vec![ClusterDetails {
            cluster_id: "asse".to_string(),
            uri: Some("https://asse.rel.tunnels.api.visualstudio.com".to_string()),
            azure_location: Some("SoutheastAsia".to_string()),
        }])
    }
}

/// Auth helper with canned output
pub struct StaticHelper {
    pub output: String,
    pub whoami_calls: AtomicUsize,
}

impl StaticHelper {
    pub fn logged_in() -> Self {
        Self {
            output: GITHUB_WHOAMI.to_string(),
            whoami_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl AuthHelper for StaticHelper {
    async fn whoami(&self) -> Result<String, HostError> {
        self.whoami_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.output.clone())
    }

    async fn login(
        &self,
        _platform: LoginPlatform,
        output: mpsc::UnboundedSender<String>,
    ) -> Result<(), HostError> {
        let _ = output.send("Logged in as alice using GitHub.".to_string());
        Ok(())
    }
}
