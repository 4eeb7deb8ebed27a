//! Tunnel registry
//!
//! Owns the subdomain → session table, runs the registration handshake and
//! enforces a single owner per subdomain. All state changes for one subdomain
//! go through its map entry, so claim, supersede, release and teardown are
//! serialized per subdomain while different subdomains proceed in parallel.

use burrow_auth::{decode_public_key, decode_signature, verify, Capability, CapabilityCheck};
use burrow_proto::{ConnectRequest, TransportKind};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::correlator::RequestCorrelator;
use crate::transport::{
    PollingTransport, SocketDriver, SocketTransport, Transport, TransportHandle,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Invalid subdomain: {0}")]
    InvalidSubdomain(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Replay rejected: {0}")]
    Replay(String),

    #[error("Subdomain already claimed: {0}")]
    Conflict(String),

    #[error("Subdomain not found: {0}")]
    NotFound(String),

    #[error("Subdomain owned by another account: {0}")]
    Forbidden(String),

    #[error("Session superseded")]
    Superseded,

    #[error("Session already attached")]
    AlreadyAttached,

    #[error("Session uses the {0} transport")]
    WrongTransport(TransportKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Handshake done, waiting for the socket to attach
    Pending,
    Active,
    Closed,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Accepted clock skew for handshake timestamps, seconds
    pub handshake_window_secs: i64,
    /// How long a socket session may stay pending
    pub pending_attach_timeout: Duration,
    /// Polling sessions idle longer than this are torn down
    pub poll_idle_limit: Duration,
    pub poll_max_wait: Duration,
    pub heartbeat_interval: Duration,
    /// Per-session outbound queue capacity
    pub queue_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            handshake_window_secs: burrow_proto::HANDSHAKE_WINDOW_SECS,
            pending_attach_timeout: Duration::from_secs(10),
            poll_idle_limit: Duration::from_secs(90),
            poll_max_wait: Duration::from_secs(burrow_proto::MAX_POLL_WAIT_SECS),
            heartbeat_interval: Duration::from_secs(15),
            queue_capacity: 256,
        }
    }
}

/// Result of a successful handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub session_id: Uuid,
    pub subdomain: String,
    pub transport: TransportKind,
    /// A previous session with the same key was replaced
    pub superseded: bool,
}

/// Snapshot of a session for listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub subdomain: String,
    pub status: SessionStatus,
    pub transport: TransportKind,
    pub public_key: String,
    pub owner: Option<String>,
    pub established_at: DateTime<Utc>,
}

struct TunnelSession {
    id: Uuid,
    subdomain: String,
    public_key: [u8; 32],
    owner: Option<String>,
    established_at: DateTime<Utc>,
    created: Instant,
    status: SessionStatus,
    requested: TransportKind,
    transport: Option<TransportHandle>,
}

impl TunnelSession {
    fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id,
            subdomain: self.subdomain.clone(),
            status: self.status,
            transport: self.requested,
            public_key: burrow_auth::encode_bytes(&self.public_key),
            owner: self.owner.clone(),
            established_at: self.established_at,
        }
    }

    fn close(&mut self) {
        self.status = SessionStatus::Closed;
        if let Some(transport) = &self.transport {
            transport.close();
        }
    }
}

pub struct TunnelRegistry {
    sessions: DashMap<String, TunnelSession>,
    /// (public key, nonce) → unix second after which the entry can go
    nonces: DashMap<(String, String), i64>,
    correlator: Arc<RequestCorrelator>,
    capability_check: Option<Arc<dyn CapabilityCheck>>,
    config: RegistryConfig,
}

impl TunnelRegistry {
    pub fn new(correlator: Arc<RequestCorrelator>, config: RegistryConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            nonces: DashMap::new(),
            correlator,
            capability_check: None,
            config,
        }
    }

    /// Accept account tokens in registration requests
    pub fn with_capability_check(mut self, check: Arc<dyn CapabilityCheck>) -> Self {
        self.capability_check = Some(check);
        self
    }

    pub fn correlator(&self) -> &Arc<RequestCorrelator> {
        &self.correlator
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Verify a registration request and claim its subdomain
    pub async fn handshake(&self, request: &ConnectRequest) -> Result<Handshake, RegistryError> {
        self.handshake_at(request, Utc::now().timestamp()).await
    }

    async fn handshake_at(
        &self,
        request: &ConnectRequest,
        now: i64,
    ) -> Result<Handshake, RegistryError> {
        validate_subdomain(&request.subdomain)?;

        let window = self.config.handshake_window_secs;
        if (now - request.timestamp).abs() > window {
            return Err(RegistryError::Replay(format!(
                "timestamp {} outside ±{}s of relay clock",
                request.timestamp, window
            )));
        }

        let public_key = decode_public_key(&request.public_key)
            .map_err(|e| RegistryError::Auth(e.to_string()))?;
        let signature =
            decode_signature(&request.signature).map_err(|e| RegistryError::Auth(e.to_string()))?;
        if !verify(&request.signing_payload(), &signature, &public_key) {
            return Err(RegistryError::Auth("signature does not verify".to_string()));
        }

        self.remember_nonce(&request.public_key, &request.nonce, request.timestamp + window, now)?;

        let owner = match &request.auth_token {
            Some(token) => Some(self.authorize_claim(token).await?),
            None => None,
        };

        let session_id = Uuid::new_v4();
        let mut session = TunnelSession {
            id: session_id,
            subdomain: request.subdomain.clone(),
            public_key,
            owner,
            established_at: Utc::now(),
            created: Instant::now(),
            status: SessionStatus::Pending,
            requested: request.transport,
            transport: None,
        };
        if request.transport == TransportKind::Polling {
            session.transport = Some(TransportHandle::Polling(PollingTransport::new(
                request.subdomain.clone(),
                session_id,
                self.correlator.clone(),
                self.config.queue_capacity,
                self.config.poll_max_wait,
            )));
            session.status = SessionStatus::Active;
        }

        let superseded = match self.sessions.entry(request.subdomain.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(session);
                false
            }
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get_mut();
                if existing.status != SessionStatus::Closed && existing.public_key != public_key {
                    return Err(RegistryError::Conflict(request.subdomain.clone()));
                }

                let was_live = existing.status != SessionStatus::Closed;
                if session.owner.is_none() {
                    session.owner = existing.owner.clone();
                }
                existing.close();
                let cancelled = self.correlator.cancel_session(existing.id);
                if was_live {
                    info!(
                        "Session {} for {} superseded ({} requests failed)",
                        existing.id, request.subdomain, cancelled
                    );
                }
                occupied.insert(session);
                was_live
            }
        };

        info!(
            "Subdomain {} claimed by session {} ({} transport)",
            request.subdomain, session_id, request.transport
        );

        Ok(Handshake {
            session_id,
            subdomain: request.subdomain.clone(),
            transport: request.transport,
            superseded,
        })
    }

    fn remember_nonce(
        &self,
        public_key: &str,
        nonce: &str,
        expires_at: i64,
        now: i64,
    ) -> Result<(), RegistryError> {
        match self
            .nonces
            .entry((public_key.to_string(), nonce.to_string()))
        {
            Entry::Occupied(mut occupied) => {
                if *occupied.get() >= now {
                    return Err(RegistryError::Replay(format!("nonce {} already used", nonce)));
                }
                occupied.insert(expires_at);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(expires_at);
            }
        }
        Ok(())
    }

    async fn authorize_claim(&self, token: &str) -> Result<String, RegistryError> {
        let check = self
            .capability_check
            .as_ref()
            .ok_or_else(|| RegistryError::Auth("account tokens are not accepted".to_string()))?;

        check
            .authorize(token, Capability::ClaimSubdomain)
            .await
            .map(|principal| principal.owner_id)
            .map_err(|e| RegistryError::Auth(e.to_string()))
    }

    /// Install the socket transport on a pending session
    pub fn attach_socket(
        &self,
        subdomain: &str,
        session_id: Uuid,
    ) -> Result<SocketDriver, RegistryError> {
        let mut session = self
            .sessions
            .get_mut(subdomain)
            .ok_or_else(|| RegistryError::NotFound(subdomain.to_string()))?;

        if session.id != session_id || session.status == SessionStatus::Closed {
            return Err(RegistryError::Superseded);
        }
        if session.requested != TransportKind::Socket {
            return Err(RegistryError::WrongTransport(session.requested));
        }
        if session.status != SessionStatus::Pending {
            return Err(RegistryError::AlreadyAttached);
        }

        let (transport, driver) = SocketTransport::new(
            subdomain,
            session_id,
            self.correlator.clone(),
            self.config.heartbeat_interval,
            self.config.queue_capacity,
        );
        session.transport = Some(TransportHandle::Socket(transport));
        session.status = SessionStatus::Active;

        info!("Socket attached for {} (session {})", subdomain, session_id);
        Ok(driver)
    }

    /// Transport of the active session for `subdomain`
    pub fn lookup(&self, subdomain: &str) -> Option<Arc<dyn Transport>> {
        let session = self.sessions.get(subdomain)?;
        if session.status != SessionStatus::Active {
            return None;
        }

        let transport = session.transport.as_ref()?;
        if transport.is_closed() {
            return None;
        }
        Some(transport.as_transport())
    }

    /// Check that `session_id` is still the current session for `subdomain`
    pub fn check_session(&self, subdomain: &str, session_id: Uuid) -> Result<(), RegistryError> {
        let session = self
            .sessions
            .get(subdomain)
            .ok_or_else(|| RegistryError::NotFound(subdomain.to_string()))?;

        if session.id != session_id || session.status == SessionStatus::Closed {
            return Err(RegistryError::Superseded);
        }
        Ok(())
    }

    /// Polling transport of the current session
    pub fn polling_transport(
        &self,
        subdomain: &str,
        session_id: Uuid,
    ) -> Result<Arc<PollingTransport>, RegistryError> {
        let session = self
            .sessions
            .get(subdomain)
            .ok_or_else(|| RegistryError::NotFound(subdomain.to_string()))?;

        if session.id != session_id || session.status == SessionStatus::Closed {
            return Err(RegistryError::Superseded);
        }

        match &session.transport {
            Some(TransportHandle::Polling(transport)) => Ok(transport.clone()),
            _ => Err(RegistryError::WrongTransport(session.requested)),
        }
    }

    /// Remove the session if it is still `session_id`, failing its pending
    /// requests. Returns false when a newer session owns the subdomain.
    pub fn teardown(&self, subdomain: &str, session_id: Uuid) -> bool {
        let Some((_, mut session)) = self
            .sessions
            .remove_if(subdomain, |_, session| session.id == session_id)
        else {
            debug!(
                "Teardown of {} skipped, session {} no longer current",
                subdomain, session_id
            );
            return false;
        };

        session.close();
        let cancelled = self.correlator.cancel_session(session_id);
        info!(
            "Session {} for {} torn down ({} requests failed)",
            session_id, subdomain, cancelled
        );
        true
    }

    /// Release a claim on behalf of its owner
    pub fn release(&self, subdomain: &str, owner_id: &str) -> Result<SessionInfo, RegistryError> {
        let (_, mut session) = match self.sessions.remove_if(subdomain, |_, session| {
            session.owner.as_deref() == Some(owner_id)
        }) {
            Some(removed) => removed,
            None if self.sessions.contains_key(subdomain) => {
                return Err(RegistryError::Forbidden(subdomain.to_string()))
            }
            None => return Err(RegistryError::NotFound(subdomain.to_string())),
        };

        session.close();
        let cancelled = self.correlator.cancel_session(session.id);
        info!(
            "Subdomain {} released by {} ({} requests failed)",
            subdomain, owner_id, cancelled
        );
        Ok(session.info())
    }

    /// Sessions owned by `owner_id`, sorted by subdomain
    pub fn list_owned(&self, owner_id: &str) -> Vec<SessionInfo> {
        let mut owned: Vec<SessionInfo> = self
            .sessions
            .iter()
            .filter(|session| session.owner.as_deref() == Some(owner_id))
            .filter(|session| session.status != SessionStatus::Closed)
            .map(|session| session.info())
            .collect();
        owned.sort_by(|a, b| a.subdomain.cmp(&b.subdomain));
        owned
    }

    pub fn session(&self, subdomain: &str) -> Option<SessionInfo> {
        self.sessions.get(subdomain).map(|session| session.info())
    }

    /// Tear down pending sessions that never attached, polling sessions whose
    /// client stopped pulling, and sessions whose transport already closed.
    /// Also forgets expired nonces.
    pub fn reap(&self) -> usize {
        let attach_timeout = self.config.pending_attach_timeout;
        let idle_limit = self.config.poll_idle_limit;

        let doomed: Vec<(String, Uuid, &'static str)> = self
            .sessions
            .iter()
            .filter_map(|session| {
                let reason = match (&session.status, &session.transport) {
                    (SessionStatus::Pending, _) if session.created.elapsed() > attach_timeout => {
                        "socket never attached"
                    }
                    (SessionStatus::Active, Some(transport)) if transport.is_closed() => {
                        "transport closed"
                    }
                    (SessionStatus::Active, Some(transport)) if transport.is_stale(idle_limit) => {
                        "client stopped polling"
                    }
                    (SessionStatus::Closed, _) => "closed",
                    _ => return None,
                };
                Some((session.subdomain.clone(), session.id, reason))
            })
            .collect();

        let reaped = doomed
            .into_iter()
            .filter(|(subdomain, session_id, reason)| {
                let removed = self.teardown(subdomain, *session_id);
                if removed {
                    warn!("Reaped session {} for {}: {}", session_id, subdomain, reason);
                }
                removed
            })
            .count();

        let now = Utc::now().timestamp();
        self.nonces.retain(|_, expires_at| *expires_at >= now);

        reaped
    }

    /// Run `reap` every `interval` until cancelled
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.reap();
                    }
                }
            }
            debug!("Registry reaper stopped");
        })
    }

    /// Close every session and fail all outstanding requests
    pub fn shutdown(&self) {
        let subdomains: Vec<(String, Uuid)> = self
            .sessions
            .iter()
            .map(|session| (session.subdomain.clone(), session.id))
            .collect();

        let count = subdomains.len();
        for (subdomain, session_id) in subdomains {
            self.teardown(&subdomain, session_id);
        }

        info!("Registry shut down, {} sessions closed", count);
    }

    /// Get count of sessions (pending and active)
    pub fn count(&self) -> usize {
        self.sessions.len()
    }
}

/// Subdomains are single lowercase DNS labels
pub fn validate_subdomain(subdomain: &str) -> Result<(), RegistryError> {
    let valid = !subdomain.is_empty()
        && subdomain.len() <= 63
        && !subdomain.starts_with('-')
        && !subdomain.ends_with('-')
        && subdomain
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');

    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidSubdomain(subdomain.to_string()))
    }
}
