//! Burrow wire protocol
//!
//! Frames exchanged over the socket transport, payloads of the registration
//! handshake and of the polling transport, and the protocol-wide defaults.

pub mod messages;

pub use messages::*;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Per-request deadline applied by the relay when no override is configured
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Accepted clock skew (either direction) for handshake timestamps
pub const HANDSHAKE_WINDOW_SECS: i64 = 30;

/// Upper bound for a single polling pull
pub const MAX_POLL_WAIT_SECS: u64 = 25;

/// Window within which enrichment jobs with the same request id coalesce
pub const ENRICHMENT_DEDUP_WINDOW_SECS: u64 = 60;

/// Errors raised while decoding frames at the transport boundary
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}
