// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Devtunnel Host Contributors

// Devtunnel Host - Daemon Client Module
// Typed HTTP access to the daemon's local REST API

use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{
    ClusterDetails, ErrorResponse, HostSummary, LoginPlatform, LoginRequest, StartHostRequest,
    UserLimit, UserStatus,
};

/// Client configuration for connecting to daemon
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonClientConfig {
    /// Daemon host (the daemon only listens on loopback)
    #[serde(default = "default_daemon_host")]
    pub daemon_host: String,

    #[serde(default = "default_daemon_port")]
    pub daemon_port: u16,

    /// Request timeout in seconds; login requests are exempt
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_daemon_host() -> String {
    "127.0.0.1".to_string()
}

fn default_daemon_port() -> u16 {
    3460
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for DaemonClientConfig {
    fn default() -> Self {
        Self {
            daemon_host: default_daemon_host(),
            daemon_port: default_daemon_port(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl DaemonClientConfig {
    /// Get the daemon base URL
    pub fn daemon_base_url(&self) -> Result<String> {
        if self.daemon_host.trim().is_empty() {
            return Err(Error::Config("daemon_host must not be empty".to_string()));
        }
        let host_port = crate::format_host_port(self.daemon_host.trim(), self.daemon_port);
        Ok(format!("http://{}", host_port))
    }
}

/// Create an HTTP client configured to connect to the daemon
pub fn create_daemon_client(config: &DaemonClientConfig) -> Result<Client> {
    // No overall timeout here: SSE streams and interactive logins stay open.
    Client::builder()
        .connect_timeout(Duration::from_secs(config.timeout_secs.clamp(1, 10)))
        .build()
        .map_err(Error::from)
}

/// Typed wrapper over the daemon REST API
#[derive(Debug, Clone)]
pub struct DaemonClient {
    client: Client,
    config: DaemonClientConfig,
    base_url: String,
}

impl DaemonClient {
    pub fn new(config: DaemonClientConfig) -> Result<Self> {
        let client = create_daemon_client(&config)?;
        let base_url = config.daemon_base_url()?;
        Ok(Self {
            client,
            config,
            base_url,
        })
    }

    pub fn config(&self) -> &DaemonClientConfig {
        &self.config
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs.max(1))
    }

    /// Check that the daemon is reachable
    pub async fn health(&self) -> Result<()> {
        let resp = self
            .client
            .get(self.url("/api/health"))
            .timeout(self.timeout())
            .send()
            .await?;
        check_status(resp).await.map(|_| ())
    }

    /// Run the interactive login flow; completes when the helper finishes
    pub async fn login(&self, platform: LoginPlatform) -> Result<UserStatus> {
        let request = self
            .client
            .post(self.url("/api/login"))
            .json(&LoginRequest { platform });
        send_json(request).await
    }

    pub async fn user(&self) -> Result<UserStatus> {
        send_json(self.client.get(self.url("/api/user")).timeout(self.timeout())).await
    }

    pub async fn limits(&self) -> Result<Vec<UserLimit>> {
        send_json(self.client.get(self.url("/api/limits")).timeout(self.timeout())).await
    }

    pub async fn clusters(&self) -> Result<Vec<ClusterDetails>> {
        send_json(
            self.client
                .get(self.url("/api/clusters"))
                .timeout(self.timeout()),
        )
        .await
    }

    pub async fn list_hosts(&self) -> Result<Vec<HostSummary>> {
        send_json(self.client.get(self.url("/api/hosts")).timeout(self.timeout())).await
    }

    /// Fetch one host's status, `None` when it is not running
    pub async fn host_status(&self, tunnel_id: &str) -> Result<Option<HostSummary>> {
        let resp = self
            .client
            .get(self.url(&format!("/api/hosts/{}", tunnel_id)))
            .timeout(self.timeout())
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = check_status(resp).await?;
        Ok(Some(resp.json().await?))
    }

    pub async fn start_host(
        &self,
        tunnel_id: &str,
        cluster_id: Option<String>,
    ) -> Result<HostSummary> {
        let request = self
            .client
            .post(self.url(&format!("/api/hosts/{}/start", tunnel_id)))
            .timeout(self.timeout())
            .json(&StartHostRequest { cluster_id });
        send_json(request).await
    }

    /// Stop a host; succeeds if it was not running
    pub async fn stop_host(&self, tunnel_id: &str) -> Result<()> {
        let resp = self
            .client
            .post(self.url(&format!("/api/hosts/{}/stop", tunnel_id)))
            .timeout(self.timeout())
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(resp).await.map(|_| ())
    }

    pub async fn refresh_ports(&self, tunnel_id: &str) -> Result<HostSummary> {
        send_json(
            self.client
                .post(self.url(&format!("/api/hosts/{}/refresh", tunnel_id)))
                .timeout(self.timeout()),
        )
        .await
    }

    /// Open the raw event stream response
    pub(crate) async fn open_event_stream(&self) -> Result<Response> {
        let resp = self
            .client
            .get(self.url("/api/events"))
            .header("Accept", "text/event-stream")
            .send()
            .await?;
        check_status(resp).await
    }
}

async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T> {
    let resp = check_status(request.send().await?).await?;
    Ok(resp.json().await?)
}

/// Turn non-success responses into `Error::Daemon`, preferring the daemon's error body
async fn check_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(err) => err.error,
        Err(_) if body.is_empty() => status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string(),
        Err(_) => body,
    };

    Err(Error::Daemon {
        status: status.as_u16(),
        message,
    })
}

impl Error {
    /// Whether the daemon reported that nobody is signed in
    pub fn is_not_logged_in(&self) -> bool {
        matches!(self, Error::Daemon { status: 401, .. })
    }
}
