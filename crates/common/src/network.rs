// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Devtunnel Host Contributors

// Network utility functions

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Host used when a port does not name an explicit target
pub const DEFAULT_TARGET_HOST: &str = "localhost";

/// Check if a host address is a loopback address
/// Supports IPv4 (127.0.0.1, 127.x.x.x), IPv6 (::1), and hostname (localhost)
pub fn is_loopback_address(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback();
    }

    // Unparseable hosts are treated as non-loopback
    false
}

/// Join a host and port, bracketing IPv6 literals ("::1" -> "[::1]:80")
pub fn format_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Destination a forwarded port relays its inbound connections to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForwardTarget {
    pub host: String,
    pub port: u16,
}

impl ForwardTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Derive the relay destination for a declared port.
    ///
    /// A description of the form `<host>:<port>` (exactly one colon) names an
    /// explicit target. An empty host part means `localhost`, and a port part
    /// that is not a non-zero number falls back to the declared port number.
    /// Any other description (or none) targets `localhost:<port_number>`.
    pub fn for_port(port_number: u16, description: Option<&str>) -> Self {
        let Some((host, port)) = description.and_then(split_target) else {
            return Self::new(DEFAULT_TARGET_HOST, port_number);
        };

        let host = if host.is_empty() {
            DEFAULT_TARGET_HOST
        } else {
            host
        };
        let port = port
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .unwrap_or(port_number);

        Self::new(host, port)
    }

    /// Whether the description field overrides the default target
    pub fn is_custom(description: Option<&str>) -> bool {
        description.and_then(split_target).is_some()
    }

    pub fn address(&self) -> String {
        format_host_port(&self.host, self.port)
    }
}

impl fmt::Display for ForwardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address())
    }
}

fn split_target(description: &str) -> Option<(&str, &str)> {
    let mut parts = description.split(':');
    let host = parts.next()?;
    let port = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some((host.trim(), port.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_loopback_address() {
        assert!(is_loopback_address("127.0.0.1"));
        assert!(is_loopback_address("127.255.255.255"));
        assert!(is_loopback_address("::1"));
        assert!(is_loopback_address("LocalHost"));

        assert!(!is_loopback_address("0.0.0.0"));
        assert!(!is_loopback_address("10.0.0.1"));
        assert!(!is_loopback_address("example.com"));
        assert!(!is_loopback_address("::"));
    }

    #[test]
    fn test_format_host_port() {
        assert_eq!(format_host_port("127.0.0.1", 80), "127.0.0.1:80");
        assert_eq!(format_host_port("::1", 80), "[::1]:80");
        assert_eq!(format_host_port("[::1]", 80), "[::1]:80");
    }

    #[test]
    fn test_target_without_description_is_same_port_on_localhost() {
        assert_eq!(
            ForwardTarget::for_port(8080, None),
            ForwardTarget::new("localhost", 8080)
        );
        assert_eq!(
            ForwardTarget::for_port(8080, Some("web server")),
            ForwardTarget::new("localhost", 8080)
        );
    }

    #[test]
    fn test_target_from_description() {
        let target = ForwardTarget::for_port(9000, Some("10.0.0.5:80"));
        assert_eq!(target, ForwardTarget::new("10.0.0.5", 80));
        assert_eq!(target.to_string(), "10.0.0.5:80");
        assert!(ForwardTarget::is_custom(Some("10.0.0.5:80")));
    }

    #[test]
    fn test_target_description_edge_cases() {
        // Empty host part keeps the loopback default
        assert_eq!(
            ForwardTarget::for_port(3000, Some(":4000")),
            ForwardTarget::new("localhost", 4000)
        );
        // Non-numeric port part keeps the declared port
        assert_eq!(
            ForwardTarget::for_port(3000, Some("db:postgres")),
            ForwardTarget::new("db", 3000)
        );
        // More than one colon is not a target
        assert_eq!(
            ForwardTarget::for_port(3000, Some("fe80::1:22")),
            ForwardTarget::new("localhost", 3000)
        );
        assert!(!ForwardTarget::is_custom(Some("a:b:c")));
    }
}
