//! Identity and authorization for the Burrow relay
//!
//! - [`keypair`]: Ed25519 identity of a tunnel client and its JSON exchange format
//! - [`jwt`]: HMAC-signed tokens shared by session and account credentials
//! - [`session`]: session tokens handed out by a successful handshake
//! - [`capability`]: bearer-token capability checks delegated to the account service

pub mod capability;
pub mod jwt;
pub mod keypair;
pub mod session;

pub use capability::{AuthError, Capability, CapabilityCheck, JwtCapabilityCheck, Principal};
pub use jwt::{JwtClaims, JwtError, JwtValidator};
pub use keypair::{
    decode_public_key, decode_signature, encode_bytes, generate, sign, verify, Keypair,
    KeypairError, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH,
};
pub use session::{SessionClaims, SessionTokens};

// Re-export useful types
pub use async_trait::async_trait;
