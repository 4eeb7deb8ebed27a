//! Tunnel client for the burrow relay
//!
//! Registers a subdomain with a signed handshake, then carries public
//! requests to a local service over a WebSocket or by long polling.
//! Dropped sessions are re-established with exponential backoff.

pub mod client;
pub mod config;
pub mod forward;
pub mod keyfile;
pub mod reconnect;

pub use client::TunnelClient;
pub use config::ClientConfig;
pub use forward::LocalForwarder;
pub use keyfile::load_or_generate;
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};

use burrow_auth::KeypairError;
use burrow_proto::ProtoError;
use thiserror::Error;

/// Tunnel client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Key file error: {0}")]
    KeyFile(String),

    #[error("Invalid key material: {0}")]
    Keypair(#[from] KeypairError),

    #[error("Relay rejected registration ({status}): {message}")]
    Rejected {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("Session ended: {0}")]
    SessionEnded(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Reconnect failed: {0}")]
    Reconnect(#[from] ReconnectError),
}

impl ClientError {
    /// Whether retrying the same registration cannot succeed
    pub fn is_fatal(&self) -> bool {
        match self {
            ClientError::Rejected { status, .. } => matches!(status, 400 | 401 | 403 | 409),
            ClientError::KeyFile(_) | ClientError::Keypair(_) | ClientError::Config(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(status: u16) -> ClientError {
        ClientError::Rejected {
            status,
            code: None,
            message: String::new(),
        }
    }

    #[test]
    fn test_fatal_errors() {
        assert!(rejected(409).is_fatal());
        assert!(rejected(401).is_fatal());
        assert!(!rejected(500).is_fatal());
        assert!(!rejected(502).is_fatal());
        assert!(!ClientError::SessionEnded("gone".to_string()).is_fatal());
        assert!(ClientError::Config("bad".to_string()).is_fatal());
    }
}
