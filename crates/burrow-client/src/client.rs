//! Tunnel client: registration plus the socket and polling loops

use burrow_auth::{encode_bytes, Keypair};
use burrow_proto::{
    signing_payload, ConnectRequest, ConnectResponse, ForwardRequest, Frame, TransportKind,
};
use futures::{SinkExt, StreamExt};
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::forward::LocalForwarder;
use crate::reconnect::{ReconnectError, ReconnectManager};
use crate::ClientError;

/// Slack on top of the poll wait before the HTTP request itself times out
const POLL_GRACE: Duration = Duration::from_secs(10);

/// Error body returned by the relay
#[derive(Debug, Default, Deserialize)]
struct RelayError {
    #[serde(default)]
    error: String,
    #[serde(default)]
    code: Option<String>,
}

/// Keeps one subdomain connected to a local service
pub struct TunnelClient {
    config: ClientConfig,
    keypair: Keypair,
    http: reqwest::Client,
    forwarder: Arc<LocalForwarder>,
}

impl TunnelClient {
    pub fn new(config: ClientConfig, keypair: Keypair) -> Result<Self, ClientError> {
        if config.socket_base().is_none() {
            return Err(ClientError::Config(format!(
                "relay URL must start with http:// or https://, got {}",
                config.relay_url
            )));
        }
        if config.subdomain.is_empty() {
            return Err(ClientError::Config("subdomain is required".to_string()));
        }

        let http = reqwest::Client::builder().build()?;
        let forwarder = Arc::new(LocalForwarder::new(
            &config.local_url,
            config.local_timeout,
        )?);

        Ok(Self {
            config,
            keypair,
            http,
            forwarder,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Signed registration request for the configured subdomain
    pub fn connect_request(&self) -> ConnectRequest {
        let nonce = hex::encode(rand::random::<[u8; 16]>());
        let timestamp = unix_now();
        let signature = self.keypair.sign(&signing_payload(&nonce, timestamp));

        ConnectRequest {
            subdomain: self.config.subdomain.clone(),
            public_key: self.keypair.public_key_base64(),
            nonce,
            timestamp,
            signature: encode_bytes(&signature),
            transport: self.config.transport,
            auth_token: self.config.auth_token.clone(),
        }
    }

    /// Claim the subdomain and obtain a session token
    pub async fn handshake(&self) -> Result<ConnectResponse, ClientError> {
        let url = format!("{}/tunnel/connect", self.config.relay_base());
        debug!("Registering {} at {}", self.config.subdomain, url);

        let response = self
            .http
            .post(&url)
            .json(&self.connect_request())
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::OK {
            return Ok(response.json().await?);
        }

        let body: RelayError = response.json().await.unwrap_or_default();
        Err(ClientError::Rejected {
            status: status.as_u16(),
            code: body.code,
            message: body.error,
        })
    }

    /// Stay connected until `cancel` fires, reconnecting with backoff.
    ///
    /// Returns an error only for failures a retry cannot fix, such as a
    /// subdomain held by another key.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ClientError> {
        let mut reconnect = ReconnectManager::new(self.config.reconnect.clone());

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = self.run_session(&cancel, &mut reconnect) => result,
            };
            if cancel.is_cancelled() {
                return Ok(());
            }

            match result {
                Err(e) if e.is_fatal() => {
                    error!("Tunnel for {} stopped: {}", self.config.subdomain, e);
                    return Err(e);
                }
                Err(e) => warn!("Tunnel session for {} ended: {}", self.config.subdomain, e),
                Ok(()) => info!("Tunnel session for {} ended", self.config.subdomain),
            }

            match reconnect.wait(&cancel).await {
                Ok(()) => info!(
                    "Reconnecting {} (attempt {})",
                    self.config.subdomain,
                    reconnect.attempt()
                ),
                Err(ReconnectError::Cancelled) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn run_session(
        &self,
        cancel: &CancellationToken,
        reconnect: &mut ReconnectManager,
    ) -> Result<(), ClientError> {
        let session = self.handshake().await?;
        reconnect.reset();

        match session.transport {
            TransportKind::Socket => self.run_socket(&session, cancel).await,
            TransportKind::Polling => self.run_polling(&session, cancel).await,
        }
    }

    async fn run_socket(
        &self,
        session: &ConnectResponse,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        let base = self
            .config
            .socket_base()
            .ok_or_else(|| ClientError::Config("invalid relay URL".to_string()))?;
        let mut request = format!("{}/tunnel/ws", base).into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", session.session_token))
            .map_err(|e| ClientError::Config(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (socket, _) = tokio_tungstenite::connect_async(request).await?;
        info!("Tunnel online at {}", session.public_url);

        let (mut sink, mut stream) = socket.split();
        let (reply_tx, mut reply_rx) = mpsc::channel::<Frame>(self.config.max_concurrent.max(1));
        let limiter = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));

        let heartbeat_timeout = self.config.heartbeat_timeout;
        let mut watchdog = tokio::time::interval(heartbeat_timeout / 3);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }

                Some(frame) = reply_rx.recv() => {
                    sink.send(Message::Text(frame.to_json()?)).await?;
                }

                message = stream.next() => {
                    let message = match message {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(ClientError::SessionEnded("relay closed the socket".to_string())),
                    };
                    last_seen = Instant::now();

                    match message {
                        Message::Text(text) => match Frame::from_json(&text) {
                            Ok(Frame::ForwardRequest(request)) => {
                                self.spawn_socket_forward(request, limiter.clone(), reply_tx.clone());
                            }
                            Ok(Frame::Ping) => {
                                sink.send(Message::Text(Frame::Pong.to_json()?)).await?;
                            }
                            Ok(other) => debug!("Ignoring {:?} from relay", other),
                            Err(e) => warn!("Discarding malformed frame: {}", e),
                        },
                        Message::Close(_) => {
                            return Err(ClientError::SessionEnded("relay closed the socket".to_string()));
                        }
                        _ => {}
                    }
                }

                _ = watchdog.tick() => {
                    if last_seen.elapsed() > heartbeat_timeout {
                        return Err(ClientError::SessionEnded(format!(
                            "relay silent for {:?}",
                            last_seen.elapsed()
                        )));
                    }
                }
            }
        }
    }

    fn spawn_socket_forward(
        &self,
        request: ForwardRequest,
        limiter: Arc<Semaphore>,
        replies: mpsc::Sender<Frame>,
    ) {
        let forwarder = self.forwarder.clone();
        tokio::spawn(async move {
            let Ok(_permit) = limiter.acquire_owned().await else {
                return;
            };
            let response = forwarder.forward(&request).await;
            if replies.send(Frame::ForwardResponse(response)).await.is_err() {
                debug!("Socket closed before {} was answered", request.request_id);
            }
        });
    }

    async fn run_polling(
        &self,
        session: &ConnectResponse,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        let poll_url = format!(
            "{}/tunnel/poll?wait={}",
            self.config.relay_base(),
            self.config.poll_wait.as_secs()
        );
        let limiter = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));

        info!("Tunnel online at {} (polling)", session.public_url);

        loop {
            let poll = self
                .http
                .get(&poll_url)
                .bearer_auth(&session.session_token)
                .timeout(self.config.poll_wait + POLL_GRACE)
                .send();

            let response = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                response = poll => response?,
            };

            match response.status() {
                StatusCode::OK => {
                    let request: ForwardRequest = response.json().await?;
                    self.spawn_polled_forward(request, session.session_token.clone(), limiter.clone());
                }
                StatusCode::NO_CONTENT => {}
                status => {
                    let body: RelayError = response.json().await.unwrap_or_default();
                    return Err(ClientError::SessionEnded(format!(
                        "poll returned {} {}",
                        status,
                        body.code.unwrap_or(body.error)
                    )));
                }
            }
        }
    }

    fn spawn_polled_forward(&self, request: ForwardRequest, token: String, limiter: Arc<Semaphore>) {
        let forwarder = self.forwarder.clone();
        let http = self.http.clone();
        let url = format!("{}/tunnel/response", self.config.relay_base());

        tokio::spawn(async move {
            let Ok(_permit) = limiter.acquire_owned().await else {
                return;
            };
            let response = forwarder.forward(&request).await;

            match http.post(&url).bearer_auth(&token).json(&response).send().await {
                Ok(reply) if reply.status().is_success() => {}
                Ok(reply) => warn!(
                    "Relay refused response for {}: {}",
                    request.request_id,
                    reply.status()
                ),
                Err(e) => warn!("Failed to post response for {}: {}", request.request_id, e),
            }
        });
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_auth::{decode_public_key, decode_signature, verify};

    fn client(config: ClientConfig) -> Result<TunnelClient, ClientError> {
        TunnelClient::new(config, Keypair::generate())
    }

    #[test]
    fn test_connect_request_is_signed() {
        let client = client(ClientConfig {
            subdomain: "abc".to_string(),
            auth_token: Some("account".to_string()),
            ..Default::default()
        })
        .unwrap();

        let request = client.connect_request();
        let public_key = decode_public_key(&request.public_key).unwrap();
        let signature = decode_signature(&request.signature).unwrap();

        assert_eq!(request.subdomain, "abc");
        assert_eq!(request.nonce.len(), 32);
        assert_eq!(request.auth_token.as_deref(), Some("account"));
        assert!(verify(&request.signing_payload(), &signature, &public_key));
    }

    #[test]
    fn test_nonces_are_fresh() {
        let client = client(ClientConfig {
            subdomain: "abc".to_string(),
            ..Default::default()
        })
        .unwrap();

        assert_ne!(client.connect_request().nonce, client.connect_request().nonce);
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            client(ClientConfig {
                subdomain: "abc".to_string(),
                relay_url: "burrow.dev".to_string(),
                ..Default::default()
            }),
            Err(ClientError::Config(_))
        ));
        assert!(matches!(
            client(ClientConfig::default()),
            Err(ClientError::Config(_))
        ));
    }
}
