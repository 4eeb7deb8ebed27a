//! Transports carrying forwarded requests to a connected tunnel client

pub mod polling;
pub mod socket;

pub use polling::PollingTransport;
pub use socket::{SessionEnd, SocketDriver, SocketTransport};

use async_trait::async_trait;
use burrow_proto::{ForwardRequest, ForwardResponse, RequestId, TransportKind};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::correlator::{CorrelationError, Outcome, RequestCorrelator};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Tunnel client did not answer in time")]
    Timeout,

    #[error("Tunnel disconnected")]
    Disconnected,

    #[error("Correlation error: {0}")]
    Correlation(#[from] CorrelationError),
}

/// Delivers requests to one connected client
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn subdomain(&self) -> &str;

    /// Session this transport was installed on
    fn session_id(&self) -> Uuid;

    fn correlator(&self) -> &Arc<RequestCorrelator>;

    /// Hand a request to the client without waiting for the answer
    async fn dispatch(&self, request: ForwardRequest) -> Result<(), TransportError>;

    /// Stop accepting requests. Teardown of pending requests is the
    /// registry's job.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// True when the client has gone quiet for longer than `idle_limit`
    fn is_stale(&self, _idle_limit: Duration) -> bool {
        false
    }

    /// Push a pending request to the client and suspend until its outcome.
    ///
    /// The request deadline covers the hand-off too: a client that stops
    /// draining its queue cannot hold the caller past the deadline.
    async fn deliver(&self, request_id: RequestId) -> Result<ForwardResponse, TransportError> {
        let correlator = self.correlator();

        let request = correlator
            .dispatch(request_id)
            .ok_or(CorrelationError::UnknownRequest(request_id))?;

        let wait = correlator.wait(request_id);
        tokio::pin!(wait);

        let outcome = tokio::select! {
            outcome = &mut wait => outcome?,
            sent = self.dispatch(request) => {
                if let Err(e) = sent {
                    debug!("Dispatch of {} failed: {}", request_id, e);
                    correlator.cancel(request_id);
                }
                wait.await?
            }
        };

        match outcome {
            Outcome::Response(response) => Ok(response),
            Outcome::TimedOut => Err(TransportError::Timeout),
            Outcome::Disconnected => Err(TransportError::Disconnected),
        }
    }
}

/// The transport installed on a session, by variant
#[derive(Clone)]
pub enum TransportHandle {
    Socket(Arc<SocketTransport>),
    Polling(Arc<PollingTransport>),
}

impl TransportHandle {
    pub fn as_transport(&self) -> Arc<dyn Transport> {
        match self {
            TransportHandle::Socket(t) => t.clone(),
            TransportHandle::Polling(t) => t.clone(),
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            TransportHandle::Socket(_) => TransportKind::Socket,
            TransportHandle::Polling(_) => TransportKind::Polling,
        }
    }

    pub fn close(&self) {
        match self {
            TransportHandle::Socket(t) => t.close(),
            TransportHandle::Polling(t) => t.close(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            TransportHandle::Socket(t) => t.is_closed(),
            TransportHandle::Polling(t) => t.is_closed(),
        }
    }

    pub fn is_stale(&self, idle_limit: Duration) -> bool {
        match self {
            TransportHandle::Socket(t) => t.is_stale(idle_limit),
            TransportHandle::Polling(t) => t.is_stale(idle_limit),
        }
    }
}
