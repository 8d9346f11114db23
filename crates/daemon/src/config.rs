// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Devtunnel Host Contributors

// Devtunnel Host - Daemon Config Module
// Daemon configuration (API listener, directory service, relay protocol, reconnects)

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::host::{HostOptions, ReconnectPolicy};
use crate::management::ManagementSettings;
use crate::relay::ProtocolVariant;

/// Environment override for the relay protocol: `1` legacy only, `2` current only
pub const PROTOCOL_ENV: &str = "DEVTUNNELS_PROTOCOL_VERSION";

/// Which relay protocols the host offers
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolPreference {
    /// Prefer the current protocol, fall back to legacy
    #[default]
    Auto,
    Current,
    Legacy,
}

impl ProtocolPreference {
    /// Apply the environment override, if it names a known version
    pub fn with_override(self, version: Option<&str>) -> Self {
        match version.map(str::trim) {
            Some("1") => ProtocolPreference::Legacy,
            Some("2") => ProtocolPreference::Current,
            Some(other) if !other.is_empty() => {
                warn!("Ignoring unknown {} value '{}'", PROTOCOL_ENV, other);
                self
            }
            _ => self,
        }
    }

    pub fn protocols(self) -> Vec<ProtocolVariant> {
        match self {
            ProtocolPreference::Auto => vec![ProtocolVariant::Current, ProtocolVariant::Legacy],
            ProtocolPreference::Current => vec![ProtocolVariant::Current],
            ProtocolPreference::Legacy => vec![ProtocolVariant::Legacy],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ReconnectConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Pause before each attempt
    #[serde(default = "default_reconnect_delay")]
    pub delay_secs: u64,

    /// 0 = retry forever
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            delay_secs: default_reconnect_delay(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    /// Address of the local REST API. Must be loopback: the API is unauthenticated.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// The `devtunnel` executable used for login and credential queries
    #[serde(default = "default_devtunnel_path")]
    pub devtunnel_path: PathBuf,

    /// Global tunnel service URI; cluster URIs are derived from it
    #[serde(default = "default_service_uri")]
    pub service_uri: String,

    #[serde(default = "default_api_version")]
    pub api_version: String,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Cluster used when a start request names none
    #[serde(default = "default_cluster")]
    pub default_cluster: String,

    #[serde(default)]
    pub protocol: ProtocolPreference,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Forced release interval of the token refresh lock
    #[serde(default = "default_token_lock_timeout")]
    pub token_lock_timeout_secs: u64,

    /// Default tracing level when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_true() -> bool {
    true
}

fn default_reconnect_delay() -> u64 {
    2
}

fn default_max_attempts() -> u32 {
    5
}

fn default_bind_address() -> String {
    "127.0.0.1:3460".to_string()
}

fn default_devtunnel_path() -> PathBuf {
    PathBuf::from("devtunnel")
}

fn default_service_uri() -> String {
    "https://global.rel.tunnels.api.visualstudio.com".to_string()
}

fn default_api_version() -> String {
    "2023-09-27-preview".to_string()
}

fn default_user_agent() -> String {
    format!("devtunnel-host/{}", env!("CARGO_PKG_VERSION"))
}

fn default_cluster() -> String {
    "asse".to_string()
}

fn default_token_lock_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            devtunnel_path: default_devtunnel_path(),
            service_uri: default_service_uri(),
            api_version: default_api_version(),
            user_agent: default_user_agent(),
            default_cluster: default_cluster(),
            protocol: ProtocolPreference::default(),
            reconnect: ReconnectConfig::default(),
            token_lock_timeout_secs: default_token_lock_timeout(),
            log_level: default_log_level(),
        }
    }
}

impl DaemonConfig {
    /// Validate the daemon configuration
    pub fn validate(&self) -> Result<()> {
        let addr = self.socket_addr()?;
        if !addr.ip().is_loopback() {
            anyhow::bail!(
                "Security violation: bind_address {} is not a loopback address.\n\
                 The daemon API has no authentication and must only listen on 127.0.0.1 or ::1.",
                self.bind_address
            );
        }

        if !self.service_uri.starts_with("https://") && !self.service_uri.starts_with("http://") {
            anyhow::bail!("service_uri must be an http(s) URI, got '{}'", self.service_uri);
        }
        if self.default_cluster.trim().is_empty() {
            anyhow::bail!("default_cluster must not be empty");
        }
        if self.token_lock_timeout_secs == 0 {
            anyhow::bail!("token_lock_timeout_secs must be greater than zero");
        }

        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.bind_address
            .parse()
            .with_context(|| format!("Invalid bind_address '{}'", self.bind_address))
    }

    /// Protocols to offer, after the environment override
    pub fn protocols(&self) -> Vec<ProtocolVariant> {
        let version = std::env::var(PROTOCOL_ENV).ok();
        self.protocol.with_override(version.as_deref()).protocols()
    }

    pub fn host_options(&self) -> HostOptions {
        HostOptions {
            protocols: self.protocols(),
            reconnect: ReconnectPolicy {
                enabled: self.reconnect.enabled,
                delay: Duration::from_secs(self.reconnect.delay_secs),
                max_attempts: self.reconnect.max_attempts,
            },
        }
    }

    pub fn management_settings(&self) -> ManagementSettings {
        ManagementSettings {
            service_uri: self.service_uri.clone(),
            api_version: self.api_version.clone(),
            user_agent: self.user_agent.clone(),
            default_cluster: self.default_cluster.clone(),
        }
    }

    pub fn token_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.token_lock_timeout_secs)
    }

    /// Load daemon configuration from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from `path`, writing defaults there on first run
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No daemon configuration found, using defaults");
            info!("Configuration will be saved to: {}", path.display());
            let config = Self::default();
            config.save_to(path)?;
            return Ok(config);
        }

        let contents =
            fs::read_to_string(path).context("Failed to read daemon configuration")?;

        let config: Self =
            toml::from_str(&contents).context("Failed to parse daemon configuration")?;

        config
            .validate()
            .context("Configuration validation failed")?;

        info!("Loaded daemon configuration from: {}", path.display());
        Ok(config)
    }

    /// Save daemon configuration to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create configuration directory")?;
        }

        let contents =
            toml::to_string_pretty(self).context("Failed to serialize daemon configuration")?;

        fs::write(path, contents).context("Failed to write daemon configuration")?;

        // Set restrictive permissions on config file (Unix only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, permissions)
                .context("Failed to set config file permissions")?;
        }

        info!("Saved daemon configuration to: {}", path.display());
        Ok(())
    }

    /// Get the path to the daemon configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("devtunnel-host").join("daemon.toml"))
    }
}
