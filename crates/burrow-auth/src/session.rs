//! Session tokens handed out by `POST /tunnel/connect`

use chrono::Duration;
use uuid::Uuid;

use crate::jwt::{JwtClaims, JwtError, JwtValidator};

const SESSION_ISSUER: &str = "burrow-relay";
const SESSION_AUDIENCE: &str = "burrow-tunnel";
const SESSION_TOKEN_TYPE: &str = "session";

/// What a session token proves about its bearer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionClaims {
    pub subdomain: String,
    pub session_id: Uuid,
}

/// Issues and validates session tokens with the relay's own secret
pub struct SessionTokens {
    secret: Vec<u8>,
    ttl: Duration,
    validator: JwtValidator,
}

impl SessionTokens {
    pub fn new(secret: &[u8], ttl: std::time::Duration) -> Self {
        let ttl = Duration::from_std(ttl).unwrap_or_else(|_| Duration::hours(24));
        let validator = JwtValidator::new(secret)
            .with_issuer(SESSION_ISSUER.to_string())
            .with_audience(SESSION_AUDIENCE.to_string());

        Self {
            secret: secret.to_vec(),
            ttl,
            validator,
        }
    }

    pub fn issue(&self, subdomain: &str, session_id: Uuid) -> Result<String, JwtError> {
        let claims = JwtClaims::new(
            subdomain.to_string(),
            SESSION_ISSUER.to_string(),
            SESSION_AUDIENCE.to_string(),
            self.ttl,
        )
        .with_session_id(session_id.to_string())
        .with_token_type(SESSION_TOKEN_TYPE);

        JwtValidator::encode(&self.secret, &claims)
    }

    pub fn validate(&self, token: &str) -> Result<SessionClaims, JwtError> {
        let claims = self.validator.validate(token)?;

        if claims.token_type.as_deref() != Some(SESSION_TOKEN_TYPE) {
            return Err(JwtError::InvalidToken);
        }

        let session_id = claims
            .sid
            .as_deref()
            .and_then(|sid| Uuid::parse_str(sid).ok())
            .ok_or(JwtError::InvalidToken)?;

        Ok(SessionClaims {
            subdomain: claims.sub,
            session_id,
        })
    }
}
