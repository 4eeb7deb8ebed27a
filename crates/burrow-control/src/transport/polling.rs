//! Polling transport: blocking pull for requests, discrete post for responses

use async_trait::async_trait;
use burrow_proto::{ForwardRequest, TransportKind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::{Transport, TransportError};
use crate::correlator::RequestCorrelator;

pub struct PollingTransport {
    subdomain: String,
    session_id: Uuid,
    queue_tx: mpsc::Sender<ForwardRequest>,
    queue_rx: AsyncMutex<mpsc::Receiver<ForwardRequest>>,
    correlator: Arc<RequestCorrelator>,
    cancel: CancellationToken,
    /// When the last pull finished (or the transport was created)
    last_poll: Mutex<Instant>,
    /// Pulls currently blocked waiting for a request
    pulling: AtomicUsize,
    max_wait: Duration,
}

impl PollingTransport {
    pub fn new(
        subdomain: impl Into<String>,
        session_id: Uuid,
        correlator: Arc<RequestCorrelator>,
        capacity: usize,
        max_wait: Duration,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(capacity.max(1));

        Arc::new(Self {
            subdomain: subdomain.into(),
            session_id,
            queue_tx,
            queue_rx: AsyncMutex::new(queue_rx),
            correlator,
            cancel: CancellationToken::new(),
            last_poll: Mutex::new(Instant::now()),
            pulling: AtomicUsize::new(0),
            max_wait,
        })
    }

    /// Block up to `min(wait, max_wait)` for the next request.
    ///
    /// Requests whose caller has already given up are skipped.
    pub async fn pull(&self, wait: Duration) -> Result<Option<ForwardRequest>, TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Disconnected);
        }

        let wait = wait.min(self.max_wait);
        let deadline = Instant::now() + wait;

        self.pulling.fetch_add(1, Ordering::SeqCst);
        let result = self.pull_until(deadline).await;
        self.pulling.fetch_sub(1, Ordering::SeqCst);
        self.touch();

        result
    }

    async fn pull_until(&self, deadline: Instant) -> Result<Option<ForwardRequest>, TransportError> {
        let mut queue = tokio::select! {
            queue = self.queue_rx.lock() => queue,
            _ = tokio::time::sleep_until(deadline) => return Ok(None),
            _ = self.cancel.cancelled() => return Err(TransportError::Disconnected),
        };

        loop {
            tokio::select! {
                request = queue.recv() => {
                    let Some(request) = request else {
                        return Err(TransportError::Disconnected);
                    };
                    if self.correlator.is_pending(request.request_id) {
                        debug!("Poll for {} picked up {}", self.subdomain, request.request_id);
                        return Ok(Some(request));
                    }
                    debug!("Skipping expired request {} for {}", request.request_id, self.subdomain);
                }
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
                _ = self.cancel.cancelled() => return Err(TransportError::Disconnected),
            }
        }
    }

    fn touch(&self) {
        if let Ok(mut last_poll) = self.last_poll.lock() {
            *last_poll = Instant::now();
        }
    }
}

#[async_trait]
impl Transport for PollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    fn subdomain(&self) -> &str {
        &self.subdomain
    }

    fn session_id(&self) -> Uuid {
        self.session_id
    }

    fn correlator(&self) -> &Arc<RequestCorrelator> {
        &self.correlator
    }

    async fn dispatch(&self, request: ForwardRequest) -> Result<(), TransportError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransportError::Disconnected),
            sent = self.queue_tx.send(request) => sent.map_err(|_| TransportError::Disconnected),
        }
    }

    fn close(&self) {
        self.cancel.cancel();
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn is_stale(&self, idle_limit: Duration) -> bool {
        if self.pulling.load(Ordering::SeqCst) > 0 {
            return false;
        }

        match self.last_poll.lock() {
            Ok(last_poll) => last_poll.elapsed() > idle_limit,
            Err(_) => false,
        }
    }
}
