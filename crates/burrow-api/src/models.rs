use axum::{http::StatusCode, Json};
use burrow_control::{SessionInfo, SessionStatus};
use burrow_proto::TransportKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Machine-readable error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Error half of every handler result
pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn api_error(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: Some(code.to_string()),
        }),
    )
}

/// Lifecycle state of a subdomain claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    /// Registered, waiting for the socket
    Pending,
    /// Serving traffic
    Active,
    /// Being torn down
    Closed,
}

impl From<SessionStatus> for ClaimStatus {
    fn from(status: SessionStatus) -> Self {
        match status {
            SessionStatus::Pending => ClaimStatus::Pending,
            SessionStatus::Active => ClaimStatus::Active,
            SessionStatus::Closed => ClaimStatus::Closed,
        }
    }
}

/// A subdomain claimed by the caller
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubdomainClaim {
    pub subdomain: String,
    pub public_url: String,
    pub status: ClaimStatus,
    pub transport: TransportKind,
    /// Base64 Ed25519 key of the tunnel client
    pub public_key: String,
    pub established_at: DateTime<Utc>,
}

impl SubdomainClaim {
    pub fn from_session(info: SessionInfo, public_url: String) -> Self {
        Self {
            subdomain: info.subdomain,
            public_url,
            status: info.status.into(),
            transport: info.transport,
            public_key: info.public_key,
            established_at: info.established_at,
        }
    }
}

/// Subdomains owned by the caller
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubdomainList {
    pub subdomains: Vec<SubdomainClaim>,
    pub total: usize,
}

/// Query of `GET /tunnel/poll`
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct PollQuery {
    /// Seconds to block waiting for a request (capped by the relay)
    pub wait: Option<u64>,
}
