// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Devtunnel Host Contributors

// Devtunnel Host - Host Registry
// Process-wide map of hosted tunnels

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info};

use devtunnel_host_common::{HostEvent, HostSummary, TunnelRef};

use crate::error::HostError;
use crate::host::{HostOptions, TunnelHost};
use crate::management::ManagementClient;
use crate::relay::RelayConnector;
use crate::token::TokenStore;

const EVENT_CAPACITY: usize = 256;

struct HostEntry {
    host: TunnelHost,
    /// Distinguishes a restarted host from the one a watcher was spawned for
    generation: u64,
}

struct RegistryInner {
    hosts: RwLock<HashMap<String, HostEntry>>,
    /// Tunnels another host took over; cleared by an explicit stop
    superseded: Mutex<HashSet<String>>,
    next_generation: AtomicU64,
    management: Arc<dyn ManagementClient>,
    connector: Arc<dyn RelayConnector>,
    tokens: TokenStore,
    options: HostOptions,
    default_cluster: String,
    event_tx: broadcast::Sender<HostEvent>,
}

/// Registry of running tunnel hosts
#[derive(Clone)]
pub struct HostRegistry {
    inner: Arc<RegistryInner>,
}

impl HostRegistry {
    pub fn new(
        management: Arc<dyn ManagementClient>,
        connector: Arc<dyn RelayConnector>,
        tokens: TokenStore,
        options: HostOptions,
        default_cluster: impl Into<String>,
        event_tx: broadcast::Sender<HostEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                hosts: RwLock::new(HashMap::new()),
                superseded: Mutex::new(HashSet::new()),
                next_generation: AtomicU64::new(1),
                management,
                connector,
                tokens,
                options,
                default_cluster: default_cluster.into(),
                event_tx,
            }),
        }
    }

    /// Event channel shared by the registry, its hosts and the token store
    pub fn event_channel() -> broadcast::Sender<HostEvent> {
        broadcast::channel(EVENT_CAPACITY).0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.inner.event_tx.subscribe()
    }

    fn superseded(&self) -> MutexGuard<'_, HashSet<String>> {
        self.inner
            .superseded
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }

    fn emit(&self, event: HostEvent) {
        if let Err(e) = self.inner.event_tx.send(event) {
            debug!("No event subscribers: {}", e);
        }
    }

    /// Start hosting `tunnel_id`. Resolves once the host session is up.
    pub async fn start_tunnel(
        &self,
        tunnel_id: &str,
        cluster_id: Option<String>,
    ) -> Result<HostSummary, HostError> {
        if self.superseded().contains(tunnel_id) {
            return Err(HostError::TooManyConnections);
        }

        let cluster_id = cluster_id.unwrap_or_else(|| self.inner.default_cluster.clone());
        let (host, generation) = {
            let mut hosts = self.inner.hosts.write().await;
            if let Some(entry) = hosts.get(tunnel_id) {
                if !entry.host.is_disposed() {
                    return Err(HostError::AlreadyHosting(tunnel_id.to_string()));
                }
            }

            let host = TunnelHost::new(
                TunnelRef::new(tunnel_id, Some(cluster_id)),
                self.inner.management.clone(),
                self.inner.connector.clone(),
                self.inner.options.clone(),
                self.inner.event_tx.clone(),
            )?;
            let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
            hosts.insert(
                tunnel_id.to_string(),
                HostEntry {
                    host: host.clone(),
                    generation,
                },
            );
            (host, generation)
        };

        info!("[{}] Starting host {}", tunnel_id, host.host_id());
        self.emit(HostEvent::Starting {
            tunnel_id: tunnel_id.to_string(),
            timestamp: Utc::now(),
        });
        self.spawn_watcher(tunnel_id.to_string(), host.clone(), generation);

        match host.connect().await {
            Ok(()) => Ok(host.summary()),
            Err(e) => {
                error!("[{}] Failed to start host: {}", tunnel_id, e);
                if e.is_not_logged_in() {
                    self.inner.tokens.invalidate();
                }
                self.emit(HostEvent::Error {
                    tunnel_id: Some(tunnel_id.to_string()),
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
                host.dispose_with(&format!("start failed: {}", e)).await;
                self.finish(tunnel_id, generation, &host).await;
                Err(e)
            }
        }
    }

    /// Remove the entry once its host disposes on its own
    fn spawn_watcher(&self, tunnel_id: String, host: TunnelHost, generation: u64) {
        let registry = self.clone();
        tokio::spawn(async move {
            host.wait_disposed().await;
            registry.finish(&tunnel_id, generation, &host).await;
        });
    }

    /// Drop the entry for `generation` and announce the stop. Only the first caller emits.
    async fn finish(&self, tunnel_id: &str, generation: u64, host: &TunnelHost) {
        let removed = {
            let mut hosts = self.inner.hosts.write().await;
            let current = hosts
                .get(tunnel_id)
                .is_some_and(|entry| entry.generation == generation);
            if current {
                hosts.remove(tunnel_id);
                if host.was_superseded() {
                    self.superseded().insert(tunnel_id.to_string());
                }
            }
            current
        };

        if removed {
            let superseded = host.was_superseded();
            let reason = host.stop_reason().unwrap_or_else(|| "stopped".to_string());
            info!("[{}] Host stopped: {}", tunnel_id, reason);
            self.emit(HostEvent::Stopped {
                tunnel_id: tunnel_id.to_string(),
                reason,
                superseded,
                timestamp: Utc::now(),
            });
        }
    }

    async fn entry(&self, tunnel_id: &str) -> Option<(TunnelHost, u64)> {
        self.inner
            .hosts
            .read()
            .await
            .get(tunnel_id)
            .map(|entry| (entry.host.clone(), entry.generation))
    }

    /// Stop hosting and forget any takeover by another host
    pub async fn stop_tunnel(&self, tunnel_id: &str) -> Result<(), HostError> {
        let was_superseded = self.superseded().remove(tunnel_id);

        match self.entry(tunnel_id).await {
            Some((host, generation)) => {
                host.dispose_with("stopped by request").await;
                self.finish(tunnel_id, generation, &host).await;
                Ok(())
            }
            None if was_superseded => Ok(()),
            None => Err(HostError::HostNotFound(tunnel_id.to_string())),
        }
    }

    pub async fn is_started(&self, tunnel_id: &str) -> bool {
        self.entry(tunnel_id)
            .await
            .is_some_and(|(host, _)| !host.is_disposed())
    }

    pub async fn status(&self, tunnel_id: &str) -> Result<HostSummary, HostError> {
        self.entry(tunnel_id)
            .await
            .map(|(host, _)| host.summary())
            .ok_or_else(|| HostError::HostNotFound(tunnel_id.to_string()))
    }

    pub async fn list(&self) -> Vec<HostSummary> {
        let hosts = self.inner.hosts.read().await;
        let mut summaries: Vec<HostSummary> = hosts.values().map(|e| e.host.summary()).collect();
        summaries.sort_by(|a, b| a.tunnel_id.cmp(&b.tunnel_id));
        summaries
    }

    pub async fn refresh_ports(&self, tunnel_id: &str) -> Result<HostSummary, HostError> {
        let (host, _) = self
            .entry(tunnel_id)
            .await
            .ok_or_else(|| HostError::HostNotFound(tunnel_id.to_string()))?;

        if let Err(e) = host.refresh_ports().await {
            if e.is_not_logged_in() {
                self.inner.tokens.invalidate();
            }
            return Err(e);
        }
        Ok(host.summary())
    }

    /// Dispose every host (daemon shutdown)
    pub async fn stop_all(&self) {
        let entries: Vec<(String, TunnelHost, u64)> = {
            let hosts = self.inner.hosts.read().await;
            hosts
                .iter()
                .map(|(id, e)| (id.clone(), e.host.clone(), e.generation))
                .collect()
        };

        if entries.is_empty() {
            return;
        }
        info!("Stopping {} host(s)", entries.len());

        join_all(entries.iter().map(|(id, host, generation)| async move {
            host.dispose_with("daemon shutting down").await;
            self.finish(id, *generation, host).await;
        }))
        .await;
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.inner.tokens
    }

    pub fn management(&self) -> &Arc<dyn ManagementClient> {
        &self.inner.management
    }
}
