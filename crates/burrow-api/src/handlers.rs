use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use burrow_auth::{Principal, SessionClaims};
use burrow_control::{RegistryError, SocketDriver};
use burrow_proto::{ConnectRequest, ConnectResponse, ForwardRequest, ForwardResponse};
use futures::{future, SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use utoipa::OpenApi;

use crate::models::*;
use crate::{ApiDoc, AppState};

/// Map registry failures onto HTTP statuses and stable codes
pub fn registry_error(e: RegistryError) -> ApiError {
    let (status, code) = match &e {
        RegistryError::InvalidSubdomain(_) => (StatusCode::BAD_REQUEST, "INVALID_SUBDOMAIN"),
        RegistryError::Auth(_) => (StatusCode::UNAUTHORIZED, "AUTH_FAILED"),
        RegistryError::Replay(_) => (StatusCode::UNAUTHORIZED, "REPLAY_REJECTED"),
        RegistryError::Conflict(_) => (StatusCode::CONFLICT, "SUBDOMAIN_CONFLICT"),
        RegistryError::NotFound(_) => (StatusCode::NOT_FOUND, "SUBDOMAIN_NOT_FOUND"),
        RegistryError::Forbidden(_) => (StatusCode::FORBIDDEN, "SUBDOMAIN_FORBIDDEN"),
        RegistryError::Superseded => (StatusCode::UNAUTHORIZED, "SESSION_SUPERSEDED"),
        RegistryError::AlreadyAttached => (StatusCode::CONFLICT, "ALREADY_ATTACHED"),
        RegistryError::WrongTransport(_) => (StatusCode::BAD_REQUEST, "WRONG_TRANSPORT"),
    };
    api_error(status, e.to_string(), code)
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Relay is running", body = String)
    ),
    tag = "system"
)]
pub async fn health_check() -> &'static str {
    "ok"
}

/// Register a tunnel client for a subdomain
#[utoipa::path(
    post,
    path = "/tunnel/connect",
    request_body = ConnectRequest,
    responses(
        (status = 200, description = "Subdomain claimed", body = ConnectResponse),
        (status = 400, description = "Invalid subdomain", body = ErrorResponse),
        (status = 401, description = "Bad signature, stale timestamp or reused nonce", body = ErrorResponse),
        (status = 409, description = "Subdomain held by another key", body = ErrorResponse)
    ),
    tag = "tunnel"
)]
pub async fn connect(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ConnectRequest>,
) -> Result<Json<ConnectResponse>, ApiError> {
    debug!(
        "Handshake for {} over {} transport",
        request.subdomain, request.transport
    );

    let handshake = state
        .registry
        .handshake(&request)
        .await
        .map_err(|e| {
            warn!("Handshake for {} rejected: {}", request.subdomain, e);
            registry_error(e)
        })?;

    let session_token = match state
        .session_tokens
        .issue(&handshake.subdomain, handshake.session_id)
    {
        Ok(token) => token,
        Err(e) => {
            error!("Failed to issue session token: {}", e);
            state
                .registry
                .teardown(&handshake.subdomain, handshake.session_id);
            return Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to issue session token",
                "TOKEN_ERROR",
            ));
        }
    };

    info!(
        "Subdomain {} claimed (session {}, {})",
        handshake.subdomain, handshake.session_id, handshake.transport
    );

    Ok(Json(ConnectResponse {
        session_token,
        public_url: state.config.public_url(&handshake.subdomain),
        subdomain: handshake.subdomain,
        transport: handshake.transport,
    }))
}

/// Attach the socket transport to a pending session
#[utoipa::path(
    get,
    path = "/tunnel/ws",
    params(
        ("token" = Option<String>, Query, description = "Session token when no Authorization header can be sent")
    ),
    responses(
        (status = 101, description = "Switching to WebSocket"),
        (status = 401, description = "Missing, invalid or superseded session token", body = ErrorResponse),
        (status = 409, description = "Socket already attached", body = ErrorResponse)
    ),
    security(("session_token" = [])),
    tag = "tunnel"
)]
pub async fn tunnel_socket(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<SessionClaims>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let driver = state
        .registry
        .attach_socket(&claims.subdomain, claims.session_id)
        .map_err(registry_error)?;

    let on_failure = (state.clone(), claims.clone());
    Ok(ws
        .on_failed_upgrade(move |e| {
            let (state, claims) = on_failure;
            warn!("WebSocket upgrade for {} failed: {}", claims.subdomain, e);
            state.registry.teardown(&claims.subdomain, claims.session_id);
        })
        .on_upgrade(move |socket| run_socket(state, claims, driver, socket)))
}

async fn run_socket(
    state: Arc<AppState>,
    claims: SessionClaims,
    driver: SocketDriver,
    socket: WebSocket,
) {
    let (sink, stream) = socket.split();

    let writer =
        sink.with(|text: String| future::ready(Ok::<_, axum::Error>(Message::Text(text.into()))));

    let reader = stream
        .take_while(|message| {
            future::ready(matches!(message, Ok(m) if !matches!(m, Message::Close(_))))
        })
        .filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(text.as_str().to_owned()),
                _ => None,
            })
        });

    let end = driver.run(Box::pin(reader), Box::pin(writer)).await;
    debug!(
        "Socket for {} (session {}) finished: {:?}",
        claims.subdomain, claims.session_id, end
    );

    state.registry.teardown(&claims.subdomain, claims.session_id);
}

/// Wait for the next forwarded request on a polling session
#[utoipa::path(
    get,
    path = "/tunnel/poll",
    params(PollQuery),
    responses(
        (status = 200, description = "A forwarded request", body = ForwardRequest),
        (status = 204, description = "Nothing arrived before the wait elapsed"),
        (status = 401, description = "Missing, invalid or superseded session token", body = ErrorResponse),
        (status = 410, description = "Session closed while waiting", body = ErrorResponse)
    ),
    security(("session_token" = [])),
    tag = "tunnel"
)]
pub async fn poll(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<SessionClaims>,
    Query(query): Query<PollQuery>,
) -> Result<Response, ApiError> {
    let transport = state
        .registry
        .polling_transport(&claims.subdomain, claims.session_id)
        .map_err(registry_error)?;

    let wait = query
        .wait
        .map(Duration::from_secs)
        .unwrap_or(state.config.poll_max_wait);

    match transport.pull(wait).await {
        Ok(Some(request)) => Ok(Json(request).into_response()),
        Ok(None) => Ok(StatusCode::NO_CONTENT.into_response()),
        Err(e) => Err(api_error(StatusCode::GONE, e.to_string(), "SESSION_CLOSED")),
    }
}

/// Deliver the tunnel client's answer to a forwarded request
#[utoipa::path(
    post,
    path = "/tunnel/response",
    request_body = ForwardResponse,
    responses(
        (status = 204, description = "Response delivered to the waiting caller"),
        (status = 401, description = "Missing, invalid or superseded session token", body = ErrorResponse),
        (status = 404, description = "No pending request with this id", body = ErrorResponse)
    ),
    security(("session_token" = [])),
    tag = "tunnel"
)]
pub async fn respond(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<SessionClaims>,
    Json(response): Json<ForwardResponse>,
) -> Result<StatusCode, ApiError> {
    state
        .registry
        .correlator()
        .resolve_for(claims.session_id, response)
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(|e| {
            warn!("Discarded response from {}: {}", claims.subdomain, e);
            api_error(StatusCode::NOT_FOUND, e.to_string(), "REQUEST_NOT_FOUND")
        })
}

/// List subdomains claimed by the caller
#[utoipa::path(
    get,
    path = "/api/subdomains",
    responses(
        (status = 200, description = "Claimed subdomains", body = SubdomainList),
        (status = 401, description = "Missing or invalid account token", body = ErrorResponse),
        (status = 403, description = "Token lacks the list_subdomains capability", body = ErrorResponse)
    ),
    security(("account_token" = [])),
    tag = "subdomains"
)]
pub async fn list_subdomains(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Json<SubdomainList> {
    debug!("Listing subdomains of {}", principal.owner_id);

    let subdomains: Vec<SubdomainClaim> = state
        .registry
        .list_owned(&principal.owner_id)
        .into_iter()
        .map(|info| {
            let public_url = state.config.public_url(&info.subdomain);
            SubdomainClaim::from_session(info, public_url)
        })
        .collect();

    let total = subdomains.len();
    Json(SubdomainList { subdomains, total })
}

/// Release a subdomain and tear down its session
#[utoipa::path(
    delete,
    path = "/api/subdomains/{subdomain}",
    params(
        ("subdomain" = String, Path, description = "Subdomain to release")
    ),
    responses(
        (status = 200, description = "Released claim", body = SubdomainClaim),
        (status = 401, description = "Missing or invalid account token", body = ErrorResponse),
        (status = 403, description = "Claimed by another account", body = ErrorResponse),
        (status = 404, description = "Subdomain not claimed", body = ErrorResponse)
    ),
    security(("account_token" = [])),
    tag = "subdomains"
)]
pub async fn release_subdomain(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(subdomain): Path<String>,
) -> Result<Json<SubdomainClaim>, ApiError> {
    let info = state
        .registry
        .release(&subdomain, &principal.owner_id)
        .map_err(registry_error)?;

    let public_url = state.config.public_url(&info.subdomain);
    Ok(Json(SubdomainClaim::from_session(info, public_url)))
}

/// OpenAPI document
pub async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
