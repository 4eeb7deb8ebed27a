//! Request correlator
//!
//! Maps in-flight public requests to the response that will eventually arrive
//! over a tunnel transport. Every entry ends in exactly one [`Outcome`]: whoever
//! removes the entry from the table first (response, deadline, or session
//! teardown) is the one that delivers it.

use burrow_proto::{ForwardRequest, ForwardResponse, RequestId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("No pending request {0}")]
    UnknownRequest(RequestId),

    #[error("Request {0} belongs to another session")]
    WrongSession(RequestId),
}

/// How a pending request ended
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Response(ForwardResponse),
    TimedOut,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingStatus {
    Pending,
    /// Handed to the client, no answer yet
    Dispatched,
}

/// A public request as it enters the correlator
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub subdomain: String,
    /// Session whose transport carries the request
    pub session_id: Uuid,
    pub client_ip: String,
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

struct PendingEntry {
    request: InboundRequest,
    created_at: DateTime<Utc>,
    deadline: Instant,
    status: PendingStatus,
    outcome_tx: oneshot::Sender<Outcome>,
}

/// Concurrent table of in-flight requests
pub struct RequestCorrelator {
    pending: DashMap<RequestId, PendingEntry>,
    waiters: DashMap<RequestId, oneshot::Receiver<Outcome>>,
    timeout: Duration,
}

impl RequestCorrelator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            waiters: DashMap::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Store a pending entry with an absolute deadline and return its id
    pub fn begin(&self, request: InboundRequest) -> RequestId {
        let request_id = RequestId::new();
        let (outcome_tx, outcome_rx) = oneshot::channel();

        debug!(
            "Pending request {} for {} {} {}",
            request_id, request.subdomain, request.method, request.path
        );

        self.waiters.insert(request_id, outcome_rx);
        self.pending.insert(
            request_id,
            PendingEntry {
                request,
                created_at: Utc::now(),
                deadline: Instant::now() + self.timeout,
                status: PendingStatus::Pending,
                outcome_tx,
            },
        );

        request_id
    }

    /// Build the frame payload for a pending request and mark it dispatched
    pub fn dispatch(&self, request_id: RequestId) -> Option<ForwardRequest> {
        let mut entry = self.pending.get_mut(&request_id)?;
        entry.status = PendingStatus::Dispatched;

        Some(ForwardRequest {
            request_id,
            method: entry.request.method.clone(),
            path: entry.request.path.clone(),
            headers: entry.request.headers.clone(),
            body: entry.request.body.clone(),
        })
    }

    /// Suspend until the request has an outcome.
    ///
    /// Can be called once per request; the deadline fixed by `begin` bounds
    /// the wait even if no sweeper is running.
    pub async fn wait(&self, request_id: RequestId) -> Result<Outcome, CorrelationError> {
        let (_, mut outcome_rx) = self
            .waiters
            .remove(&request_id)
            .ok_or(CorrelationError::UnknownRequest(request_id))?;

        let deadline = match self.pending.get(&request_id) {
            Some(entry) => entry.deadline,
            // Already finished, the outcome is waiting in the channel
            None => return Ok(outcome_rx.await.unwrap_or(Outcome::Disconnected)),
        };

        tokio::select! {
            outcome = &mut outcome_rx => Ok(outcome.unwrap_or(Outcome::Disconnected)),
            _ = tokio::time::sleep_until(deadline) => {
                self.finish(request_id, Outcome::TimedOut);
                Ok(outcome_rx.await.unwrap_or(Outcome::TimedOut))
            }
        }
    }

    /// Deliver a response. Unknown or already finished ids are a no-op error.
    pub fn resolve(
        &self,
        request_id: RequestId,
        response: ForwardResponse,
    ) -> Result<(), CorrelationError> {
        if self.finish(request_id, Outcome::Response(response)) {
            Ok(())
        } else {
            Err(CorrelationError::UnknownRequest(request_id))
        }
    }

    /// Deliver a response on behalf of session `session_id`. Requests that
    /// belong to another session, even on the same subdomain, are refused.
    pub fn resolve_for(
        &self,
        session_id: Uuid,
        response: ForwardResponse,
    ) -> Result<(), CorrelationError> {
        let request_id = response.request_id;

        match self
            .pending
            .remove_if(&request_id, |_, entry| entry.request.session_id == session_id)
        {
            Some((_, entry)) => {
                debug!("Resolved request {} with status {}", request_id, response.status);
                let _ = entry.outcome_tx.send(Outcome::Response(response));
                Ok(())
            }
            None if self.pending.contains_key(&request_id) => {
                Err(CorrelationError::WrongSession(request_id))
            }
            None => Err(CorrelationError::UnknownRequest(request_id)),
        }
    }

    /// Fail every pending request of a session with `Disconnected`
    pub fn cancel_session(&self, session_id: Uuid) -> usize {
        let ids: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|entry| entry.request.session_id == session_id)
            .map(|entry| *entry.key())
            .collect();

        let cancelled = ids
            .into_iter()
            .filter(|id| self.finish(*id, Outcome::Disconnected))
            .count();

        if cancelled > 0 {
            debug!(
                "Cancelled {} pending requests for session {}",
                cancelled, session_id
            );
        }
        cancelled
    }

    /// Fail a single request with `Disconnected`
    pub fn cancel(&self, request_id: RequestId) -> bool {
        self.finish(request_id, Outcome::Disconnected)
    }

    /// Drop a request whose caller went away
    pub fn abandon(&self, request_id: RequestId) {
        self.waiters.remove(&request_id);
        if self.pending.remove(&request_id).is_some() {
            debug!("Abandoned pending request {}", request_id);
        }
    }

    /// Time out every entry whose deadline has passed
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| *entry.key())
            .collect();

        let swept = expired
            .into_iter()
            .filter(|id| {
                let finished = self.finish(*id, Outcome::TimedOut);
                // Nobody started waiting before the deadline
                self.waiters.remove(id);
                finished
            })
            .count();

        if swept > 0 {
            debug!("Timed out {} pending requests", swept);
        }

        swept
    }

    /// Run `sweep_expired` every `interval` until cancelled
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let correlator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        correlator.sweep_expired();
                    }
                }
            }
            debug!("Correlator sweeper stopped");
        })
    }

    pub fn is_pending(&self, request_id: RequestId) -> bool {
        self.pending.contains_key(&request_id)
    }

    pub fn status(&self, request_id: RequestId) -> Option<PendingStatus> {
        self.pending.get(&request_id).map(|entry| entry.status)
    }

    pub fn created_at(&self, request_id: RequestId) -> Option<DateTime<Utc>> {
        self.pending.get(&request_id).map(|entry| entry.created_at)
    }

    /// Get count of pending requests
    pub fn count(&self) -> usize {
        self.pending.len()
    }

    /// Remove the entry and send its outcome. Returns false if another path
    /// already finished it.
    fn finish(&self, request_id: RequestId, outcome: Outcome) -> bool {
        match self.pending.remove(&request_id) {
            Some((_, entry)) => {
                if entry.outcome_tx.send(outcome).is_err() {
                    warn!("Outcome for request {} had no receiver", request_id);
                }
                true
            }
            None => false,
        }
    }
}
