// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Devtunnel Host Contributors

// Devtunnel Host - CLI Config Module
// Where the CLI finds the daemon; command-line flags win over the file

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub use devtunnel_host_common::DaemonClientConfig;
use devtunnel_host_common::is_loopback_address;

/// CLI configuration (wrapper around DaemonClientConfig with file I/O)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CliConfig {
    #[serde(flatten)]
    pub daemon_config: DaemonClientConfig,
}

/// Values given on the command line
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub daemon_host: Option<String>,
    pub daemon_port: Option<u16>,
}

impl CliConfig {
    /// Load CLI configuration from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from `path`; a missing file yields the defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read CLI configuration {}", path.display()))?;

        toml::from_str(&contents).context("Failed to parse CLI configuration")
    }

    pub fn apply(mut self, overrides: CliOverrides) -> Self {
        if let Some(host) = overrides.daemon_host {
            self.daemon_config.daemon_host = host;
        }
        if let Some(port) = overrides.daemon_port {
            self.daemon_config.daemon_port = port;
        }
        self
    }

    /// Whether the configured daemon is on this machine
    pub fn is_local(&self) -> bool {
        is_loopback_address(self.daemon_config.daemon_host.trim())
    }

    /// Get the path to the CLI configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("devtunnel-host").join("cli.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = CliConfig::load_from(&dir.path().join("cli.toml")).unwrap();
        assert_eq!(
            config.daemon_config.daemon_base_url().unwrap(),
            "http://127.0.0.1:3460"
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cli.toml");
        fs::write(&path, "daemon_port = 4100\ntimeout_secs = 5\n").unwrap();

        let config = CliConfig::load_from(&path).unwrap();
        assert_eq!(config.daemon_config.daemon_port, 4100);
        assert_eq!(config.daemon_config.timeout_secs, 5);
    }

    #[test]
    fn test_flags_override_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cli.toml");
        fs::write(&path, "daemon_port = 4100\n").unwrap();

        let config = CliConfig::load_from(&path).unwrap().apply(CliOverrides {
            daemon_host: Some("::1".to_string()),
            daemon_port: None,
        });
        assert_eq!(
            config.daemon_config.daemon_base_url().unwrap(),
            "http://[::1]:4100"
        );
    }

    #[test]
    fn test_remote_daemon_host_is_not_local() {
        assert!(CliConfig::default().is_local());

        let remote = CliConfig::default().apply(CliOverrides {
            daemon_host: Some("192.168.1.20".to_string()),
            daemon_port: None,
        });
        assert!(!remote.is_local());

        let named = CliConfig::default().apply(CliOverrides {
            daemon_host: Some("localhost".to_string()),
            daemon_port: None,
        });
        assert!(named.is_local());
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cli.toml");
        fs::write(&path, "daemon_port = \"not a port\"\n").unwrap();
        assert!(CliConfig::load_from(&path).is_err());
    }
}
