//! Tunnel control and data plane
//!
//! - [`RequestCorrelator`] pairs public requests with tunnel responses
//! - [`Transport`] delivers requests to a connected client (socket or polling)
//! - [`TunnelRegistry`] runs the handshake and owns subdomain claims

pub mod correlator;
pub mod registry;
pub mod transport;

pub use correlator::{CorrelationError, InboundRequest, Outcome, PendingStatus, RequestCorrelator};
pub use registry::{
    Handshake, RegistryConfig, RegistryError, SessionInfo, SessionStatus, TunnelRegistry,
};
pub use transport::{
    PollingTransport, SessionEnd, SocketDriver, SocketTransport, Transport, TransportError,
    TransportHandle,
};
