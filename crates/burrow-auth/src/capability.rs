//! Capability checks for account bearer tokens
//!
//! Accounts and their API tokens live in an external service. The relay only
//! asks whether a presented token grants a capability, through the
//! [`CapabilityCheck`] trait, so deployments can plug in their own backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::jwt::{JwtError, JwtValidator};

/// Operations gated by an account token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ClaimSubdomain,
    ListSubdomains,
    ReleaseSubdomain,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::ClaimSubdomain => "claim_subdomain",
            Capability::ListSubdomains => "list_subdomains",
            Capability::ReleaseSubdomain => "release_subdomain",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity behind an accepted token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub owner_id: String,
    /// Unix seconds; `None` for tokens without expiry
    pub expires_at: Option<i64>,
}

/// Authentication errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token expired")]
    TokenExpired,

    #[error("Missing capability: {0}")]
    Forbidden(Capability),

    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Decides whether a bearer token grants a capability
#[async_trait]
pub trait CapabilityCheck: Send + Sync {
    async fn authorize(&self, token: &str, capability: Capability)
        -> Result<Principal, AuthError>;
}

/// Validates account tokens minted by the account service with a shared secret.
///
/// The owner is `user_id` when present, otherwise `sub`. An empty
/// `capabilities` claim grants every capability.
pub struct JwtCapabilityCheck {
    validator: JwtValidator,
}

impl JwtCapabilityCheck {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            validator: JwtValidator::new(secret),
        }
    }
}

#[async_trait]
impl CapabilityCheck for JwtCapabilityCheck {
    async fn authorize(
        &self,
        token: &str,
        capability: Capability,
    ) -> Result<Principal, AuthError> {
        let claims = self.validator.validate(token).map_err(|e| match e {
            JwtError::TokenExpired => AuthError::TokenExpired,
            JwtError::InvalidToken => AuthError::InvalidToken("Invalid JWT".to_string()),
            JwtError::EncodingError(e) => AuthError::InvalidToken(e.to_string()),
        })?;

        // Session tokens share the claim layout but never act as account tokens
        if claims.token_type.as_deref() == Some("session") {
            return Err(AuthError::InvalidToken(
                "session token used as account token".to_string(),
            ));
        }

        if !claims.capabilities.is_empty()
            && !claims.capabilities.iter().any(|c| c == capability.as_str())
        {
            return Err(AuthError::Forbidden(capability));
        }

        Ok(Principal {
            owner_id: claims.user_id.unwrap_or(claims.sub),
            expires_at: Some(claims.exp),
        })
    }
}
