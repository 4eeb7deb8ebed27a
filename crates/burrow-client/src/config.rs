//! Client configuration

use burrow_proto::{TransportKind, MAX_POLL_WAIT_SECS};
use std::path::PathBuf;
use std::time::Duration;

use crate::reconnect::ReconnectConfig;

/// Tunnel client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay base URL, e.g. `https://burrow.dev`
    pub relay_url: String,
    pub subdomain: String,
    /// Local service requests are forwarded to, e.g. `http://127.0.0.1:3000`
    pub local_url: String,
    /// Key material file, created on first use
    pub key_file: PathBuf,
    pub transport: TransportKind,
    /// Account token binding the claim to its owner
    pub auth_token: Option<String>,
    /// Wait requested per poll (the relay caps it)
    pub poll_wait: Duration,
    /// Relay silence after which a socket is considered dead
    pub heartbeat_timeout: Duration,
    /// Deadline for the local service to answer
    pub local_timeout: Duration,
    /// Requests forwarded to the local service at once
    pub max_concurrent: usize,
    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "http://localhost:8080".to_string(),
            subdomain: String::new(),
            local_url: "http://127.0.0.1:3000".to_string(),
            key_file: PathBuf::from("burrow-key.json"),
            transport: TransportKind::Socket,
            auth_token: None,
            poll_wait: Duration::from_secs(MAX_POLL_WAIT_SECS),
            heartbeat_timeout: Duration::from_secs(45),
            local_timeout: Duration::from_secs(30),
            max_concurrent: 32,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Relay URL without a trailing slash
    pub fn relay_base(&self) -> &str {
        self.relay_url.trim_end_matches('/')
    }

    /// WebSocket flavour of the relay URL: `http` becomes `ws`, `https` becomes `wss`
    pub fn socket_base(&self) -> Option<String> {
        let base = self.relay_base();
        if let Some(rest) = base.strip_prefix("https://") {
            Some(format!("wss://{}", rest))
        } else {
            base.strip_prefix("http://")
                .map(|rest| format!("ws://{}", rest))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_base() {
        let mut config = ClientConfig {
            relay_url: "http://127.0.0.1:8080/".to_string(),
            ..Default::default()
        };
        assert_eq!(config.relay_base(), "http://127.0.0.1:8080");
        assert_eq!(config.socket_base().as_deref(), Some("ws://127.0.0.1:8080"));

        config.relay_url = "https://burrow.dev".to_string();
        assert_eq!(config.socket_base().as_deref(), Some("wss://burrow.dev"));

        config.relay_url = "ftp://burrow.dev".to_string();
        assert_eq!(config.socket_base(), None);
    }
}
