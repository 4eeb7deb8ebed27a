//! Ed25519 identity keypair for tunnel clients
//!
//! The client holds the full keypair; the relay only ever sees the public key.
//! Key material is exchanged as `{"public_key": <base64>, "secret_key": <base64>}`.

use base64::{engine::general_purpose::STANDARD, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const PUBLIC_KEY_LENGTH: usize = 32;
pub const SECRET_KEY_LENGTH: usize = 32;
pub const SIGNATURE_LENGTH: usize = 64;

#[derive(Debug, Error)]
pub enum KeypairError {
    /// The input is not JSON at all
    #[error("Malformed key material: {0}")]
    DecodeError(String),

    /// The input is JSON but not a valid keypair document
    #[error("Invalid key material: {0}")]
    SchemaError(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
}

/// Client identity: 32-byte public key and the 32-byte seed it derives from
#[derive(Clone, PartialEq, Eq)]
pub struct Keypair {
    public_key: [u8; PUBLIC_KEY_LENGTH],
    secret_key: [u8; SECRET_KEY_LENGTH],
}

#[derive(Serialize, Deserialize)]
struct KeypairDocument {
    public_key: String,
    secret_key: String,
}

impl Keypair {
    /// Generate a fresh keypair from the OS random source
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Rebuild a keypair from its seed
    pub fn from_seed(seed: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(seed))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        Self {
            public_key: signing_key.verifying_key().to_bytes(),
            secret_key: signing_key.to_bytes(),
        }
    }

    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.public_key
    }

    pub fn secret_key(&self) -> &[u8; SECRET_KEY_LENGTH] {
        &self.secret_key
    }

    /// Public key in the text encoding used on the wire
    pub fn public_key_base64(&self) -> String {
        encode_bytes(&self.public_key)
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        SigningKey::from_bytes(&self.secret_key)
            .sign(message)
            .to_bytes()
    }

    pub fn to_json(&self) -> String {
        let document = KeypairDocument {
            public_key: encode_bytes(&self.public_key),
            secret_key: encode_bytes(&self.secret_key),
        };
        // Serializing two strings cannot fail
        serde_json::to_string_pretty(&document).unwrap_or_default()
    }

    pub fn from_json(text: &str) -> Result<Self, KeypairError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| KeypairError::DecodeError(e.to_string()))?;

        let document: KeypairDocument =
            serde_json::from_value(value).map_err(|e| KeypairError::SchemaError(e.to_string()))?;

        let public_key = decode_fixed::<PUBLIC_KEY_LENGTH>(&document.public_key)
            .map_err(|e| KeypairError::SchemaError(format!("public_key: {}", e)))?;
        let secret_key = decode_fixed::<SECRET_KEY_LENGTH>(&document.secret_key)
            .map_err(|e| KeypairError::SchemaError(format!("secret_key: {}", e)))?;

        let keypair = Self::from_seed(&secret_key);
        if keypair.public_key != public_key {
            return Err(KeypairError::SchemaError(
                "public_key does not match secret_key".to_string(),
            ));
        }

        Ok(keypair)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &encode_bytes(&self.public_key))
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Generate a fresh keypair
pub fn generate() -> Keypair {
    Keypair::generate()
}

/// Sign `message` with the keypair's secret key
pub fn sign(message: &[u8], keypair: &Keypair) -> [u8; SIGNATURE_LENGTH] {
    keypair.sign(message)
}

/// Verify a signature.
///
/// Returns false for any mismatch, and for signatures or keys that are not
/// even well-formed.
pub fn verify(message: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
    let Ok(public_key) = <[u8; PUBLIC_KEY_LENGTH]>::try_from(public_key) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&public_key) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };

    verifying_key.verify(message, &signature).is_ok()
}

pub fn encode_bytes(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a base64 public key as received in a registration request
pub fn decode_public_key(text: &str) -> Result<[u8; PUBLIC_KEY_LENGTH], KeypairError> {
    decode_fixed::<PUBLIC_KEY_LENGTH>(text).map_err(KeypairError::InvalidPublicKey)
}

/// Decode a base64 signature as received in a registration request
pub fn decode_signature(text: &str) -> Result<[u8; SIGNATURE_LENGTH], KeypairError> {
    decode_fixed::<SIGNATURE_LENGTH>(text).map_err(KeypairError::InvalidSignature)
}

fn decode_fixed<const N: usize>(text: &str) -> Result<[u8; N], String> {
    let bytes = STANDARD
        .decode(text.trim().as_bytes())
        .map_err(|e| e.to_string())?;
    let len = bytes.len();
    <[u8; N]>::try_from(bytes).map_err(|_| format!("expected {} bytes, got {}", N, len))
}
