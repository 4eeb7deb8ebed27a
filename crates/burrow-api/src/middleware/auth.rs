//! Bearer Authentication Middleware
//!
//! Tunnel endpoints carry the session token returned by `POST /tunnel/connect`.
//! Account endpoints carry a token minted by the account service and are gated
//! per capability. Both inject what they verified into the request extensions.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use burrow_auth::{AuthError, Capability, CapabilityCheck, JwtError};
use burrow_control::RegistryError;
use std::sync::Arc;
use tracing::debug;

use crate::models::{api_error, ApiError};
use crate::AppState;

/// Token from `Authorization: Bearer <token>`, or from a `token` query
/// parameter for WebSocket clients that cannot set headers.
pub fn bearer_token(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    let from_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());

    from_header.or_else(|| {
        query?
            .split('&')
            .find_map(|pair| pair.strip_prefix("token="))
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    })
}

/// Validates a session token and checks that its session is still the
/// current one for the subdomain.
///
/// Injects [`burrow_auth::SessionClaims`] on success. A token for a replaced
/// session is rejected with `401 SESSION_SUPERSEDED`.
pub async fn require_session(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(request.headers(), request.uri().query()).ok_or_else(|| {
        api_error(
            StatusCode::UNAUTHORIZED,
            "Missing session token",
            "MISSING_AUTH",
        )
    })?;

    let claims = state.session_tokens.validate(&token).map_err(|e| match e {
        JwtError::TokenExpired => api_error(
            StatusCode::UNAUTHORIZED,
            "Session token expired",
            "TOKEN_EXPIRED",
        ),
        other => api_error(
            StatusCode::UNAUTHORIZED,
            format!("Invalid session token: {}", other),
            "INVALID_TOKEN",
        ),
    })?;

    state
        .registry
        .check_session(&claims.subdomain, claims.session_id)
        .map_err(|e| {
            debug!(
                "Rejected session {} for {}: {}",
                claims.session_id, claims.subdomain, e
            );
            match e {
                RegistryError::Superseded => {
                    api_error(StatusCode::UNAUTHORIZED, e.to_string(), "SESSION_SUPERSEDED")
                }
                _ => api_error(StatusCode::UNAUTHORIZED, e.to_string(), "SESSION_NOT_FOUND"),
            }
        })?;

    request.extensions_mut().insert(claims);
    Ok(next.run(request).await)
}

/// Capability required by one route, plus the check that decides it
#[derive(Clone)]
pub struct CapabilityGuard {
    check: Option<Arc<dyn CapabilityCheck>>,
    capability: Capability,
}

impl CapabilityGuard {
    pub fn new(check: Option<Arc<dyn CapabilityCheck>>, capability: Capability) -> Self {
        Self { check, capability }
    }
}

/// Authorizes an account token for the guarded capability and injects the
/// resulting [`burrow_auth::Principal`].
pub async fn require_capability(
    State(guard): State<CapabilityGuard>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let check = guard.check.as_ref().ok_or_else(|| {
        api_error(
            StatusCode::UNAUTHORIZED,
            "Account tokens are not accepted by this relay",
            "AUTH_DISABLED",
        )
    })?;

    let token = bearer_token(request.headers(), None).ok_or_else(|| {
        api_error(
            StatusCode::UNAUTHORIZED,
            "Missing Authorization header. Expected 'Bearer <token>'",
            "MISSING_AUTH",
        )
    })?;

    let principal = check
        .authorize(&token, guard.capability)
        .await
        .map_err(|e| match e {
            AuthError::InvalidToken(_) => {
                api_error(StatusCode::UNAUTHORIZED, e.to_string(), "INVALID_TOKEN")
            }
            AuthError::TokenExpired => {
                api_error(StatusCode::UNAUTHORIZED, e.to_string(), "TOKEN_EXPIRED")
            }
            AuthError::Forbidden(_) => {
                api_error(StatusCode::FORBIDDEN, e.to_string(), "MISSING_CAPABILITY")
            }
            AuthError::InternalError(_) => api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "INTERNAL_ERROR",
            ),
        })?;

    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}
