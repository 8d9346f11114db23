// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Devtunnel Host Contributors

// Devtunnel Host - Management Module
// Client for the tunnel-management directory service

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, USER_AGENT};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::debug;

use devtunnel_host_common::{
    ClusterDetails, Tunnel, TunnelEndpoint, TunnelPort, TunnelRef, UserLimit, HOST_SCOPE,
};

use crate::error::ManagementError;
use crate::token::TokenStore;

/// Options for `get_tunnel`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelRequestOptions {
    pub include_ports: bool,
    /// Access token scopes the directory should issue with the tunnel
    pub token_scopes: Vec<String>,
}

impl TunnelRequestOptions {
    /// What a host needs: ports plus host and connect tokens
    pub fn for_host() -> Self {
        Self {
            include_ports: true,
            token_scopes: vec![HOST_SCOPE.to_string(), "connect".to_string()],
        }
    }
}

/// Directory operations consumed by the host.
///
/// Implementations report HTTP status codes verbatim through
/// `ManagementError::Status`; callers decide what a 401 means.
#[async_trait]
pub trait ManagementClient: Send + Sync {
    async fn get_tunnel(
        &self,
        tunnel: &TunnelRef,
        options: &TunnelRequestOptions,
    ) -> Result<Tunnel, ManagementError>;

    async fn update_tunnel_endpoint(
        &self,
        tunnel: &Tunnel,
        endpoint: &TunnelEndpoint,
    ) -> Result<TunnelEndpoint, ManagementError>;

    async fn delete_tunnel_endpoints(
        &self,
        tunnel: &Tunnel,
        endpoint_id: &str,
    ) -> Result<(), ManagementError>;

    async fn create_or_update_tunnel_port(
        &self,
        tunnel: &Tunnel,
        port: &TunnelPort,
    ) -> Result<TunnelPort, ManagementError>;

    async fn delete_tunnel_port(
        &self,
        tunnel: &Tunnel,
        port_number: u16,
    ) -> Result<(), ManagementError>;

    async fn user_limits(&self) -> Result<Vec<UserLimit>, ManagementError>;

    async fn list_clusters(&self) -> Result<Vec<ClusterDetails>, ManagementError>;
}

/// Settings for the HTTP directory client
#[derive(Debug, Clone)]
pub struct ManagementSettings {
    pub service_uri: String,
    pub api_version: String,
    pub user_agent: String,
    pub default_cluster: String,
}

/// `reqwest` implementation of [`ManagementClient`]
pub struct HttpManagementClient {
    client: Client,
    settings: ManagementSettings,
    tokens: TokenStore,
}

impl HttpManagementClient {
    pub fn new(settings: ManagementSettings, tokens: TokenStore) -> Result<Self, ManagementError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(15))
            .build()?;

        Ok(Self {
            client,
            settings,
            tokens,
        })
    }

    fn base_uri(&self, cluster_id: Option<&str>) -> String {
        match cluster_id {
            Some(cluster) => cluster_uri(&self.settings.service_uri, cluster),
            None => self.settings.service_uri.trim_end_matches('/').to_string(),
        }
    }

    fn tunnel_uri(&self, tunnel: &TunnelRef) -> String {
        let cluster = tunnel
            .cluster_id
            .as_deref()
            .unwrap_or(&self.settings.default_cluster);
        format!("{}/tunnels/{}", self.base_uri(Some(cluster)), tunnel.tunnel_id)
    }

    /// Build an authenticated request carrying the api-version query parameter
    async fn request(&self, method: Method, url: &str) -> Result<RequestBuilder, ManagementError> {
        let token = self
            .tokens
            .get_token()
            .await
            .map_err(|e| ManagementError::Credential(Box::new(e)))?;

        debug!("{} {}", method, url);
        Ok(self
            .client
            .request(method, url)
            .query(&[("api-version", self.settings.api_version.as_str())])
            .header(USER_AGENT, &self.settings.user_agent)
            .header(AUTHORIZATION, token.authorization().as_str()))
    }
}

#[async_trait]
impl ManagementClient for HttpManagementClient {
    async fn get_tunnel(
        &self,
        tunnel: &TunnelRef,
        options: &TunnelRequestOptions,
    ) -> Result<Tunnel, ManagementError> {
        let mut request = self.request(Method::GET, &self.tunnel_uri(tunnel)).await?;
        if options.include_ports {
            request = request.query(&[("includePorts", "true")]);
        }
        if !options.token_scopes.is_empty() {
            request = request.query(&[("tokenScopes", options.token_scopes.join(","))]);
        }
        read_json(request.send().await?).await
    }

    async fn update_tunnel_endpoint(
        &self,
        tunnel: &Tunnel,
        endpoint: &TunnelEndpoint,
    ) -> Result<TunnelEndpoint, ManagementError> {
        let endpoint_id = endpoint.id.as_deref().unwrap_or(&endpoint.host_id);
        let url = format!(
            "{}/endpoints/{}",
            self.tunnel_uri(&tunnel.tunnel_ref()),
            endpoint_id
        );

        let mut request = self.request(Method::PUT, &url).await?.json(endpoint);
        if tunnel.has_ssh_port() {
            request = request.query(&[("includeSshGatewayPublicKey", "true")]);
        }
        read_json(request.send().await?).await
    }

    async fn delete_tunnel_endpoints(
        &self,
        tunnel: &Tunnel,
        endpoint_id: &str,
    ) -> Result<(), ManagementError> {
        let url = format!(
            "{}/endpoints/{}",
            self.tunnel_uri(&tunnel.tunnel_ref()),
            endpoint_id
        );
        let response = self.request(Method::DELETE, &url).await?.send().await?;
        check_status(response).await.map(|_| ())
    }

    async fn create_or_update_tunnel_port(
        &self,
        tunnel: &Tunnel,
        port: &TunnelPort,
    ) -> Result<TunnelPort, ManagementError> {
        let url = format!(
            "{}/ports/{}",
            self.tunnel_uri(&tunnel.tunnel_ref()),
            port.port_number
        );
        let request = self.request(Method::PUT, &url).await?.json(port);
        read_json(request.send().await?).await
    }

    async fn delete_tunnel_port(
        &self,
        tunnel: &Tunnel,
        port_number: u16,
    ) -> Result<(), ManagementError> {
        let url = format!(
            "{}/ports/{}",
            self.tunnel_uri(&tunnel.tunnel_ref()),
            port_number
        );
        let response = self.request(Method::DELETE, &url).await?.send().await?;
        check_status(response).await.map(|_| ())
    }

    async fn user_limits(&self) -> Result<Vec<UserLimit>, ManagementError> {
        let url = format!("{}/userlimits", self.base_uri(None));
        read_json(self.request(Method::GET, &url).await?.send().await?).await
    }

    async fn list_clusters(&self) -> Result<Vec<ClusterDetails>, ManagementError> {
        let url = format!("{}/clusters", self.base_uri(None));
        read_json(self.request(Method::GET, &url).await?.send().await?).await
    }
}

/// Cluster-specific service URI: `https://global.rel...` becomes `https://<cluster>.rel...`
pub fn cluster_uri(service_uri: &str, cluster_id: &str) -> String {
    let service_uri = service_uri.trim_end_matches('/');
    match service_uri.split_once("://") {
        Some((scheme, rest)) if rest.starts_with("global.") => {
            format!("{}://{}.{}", scheme, cluster_id, &rest["global.".len()..])
        }
        _ => service_uri.to_string(),
    }
}

async fn check_status(response: Response) -> Result<Response, ManagementError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = if body.trim().is_empty() {
        status.canonical_reason().unwrap_or("request failed").to_string()
    } else {
        body
    };

    Err(ManagementError::Status {
        status: status.as_u16(),
        message,
    })
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, ManagementError> {
    let response = check_status(response).await?;
    let body = response.bytes().await?;
    serde_json::from_slice(&body).map_err(|e| ManagementError::InvalidResponse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_uri() {
        assert_eq!(
            cluster_uri("https://global.rel.tunnels.api.visualstudio.com", "asse"),
            "https://asse.rel.tunnels.api.visualstudio.com"
        );
        assert_eq!(
            cluster_uri("https://global.rel.tunnels.api.visualstudio.com/", "usw2"),
            "https://usw2.rel.tunnels.api.visualstudio.com"
        );
        // Non-global service URIs are used as-is
        assert_eq!(
            cluster_uri("http://localhost:9900", "asse"),
            "http://localhost:9900"
        );
    }

    #[test]
    fn test_host_request_options() {
        let options = TunnelRequestOptions::for_host();
        assert!(options.include_ports);
        assert_eq!(options.token_scopes, vec!["host", "connect"]);
    }
}
