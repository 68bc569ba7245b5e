//! Relay configuration

use meshcall_core::RegistryConfig;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};

/// Default HTTP port of the relay
pub const DEFAULT_PORT: u16 = 8080;

/// Relay server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Address the HTTP endpoint listens on
    pub bind_addr: SocketAddr,
    /// Session expiry and sweep settings
    pub registry: RegistryConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            registry: RegistryConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr.port(), 8080);
        assert!(config.bind_addr.ip().is_loopback());
        assert_eq!(config.registry.session_ttl, Duration::from_secs(86_400));
        assert_eq!(config.registry.sweep_interval, Duration::from_secs(3_600));
    }
}
