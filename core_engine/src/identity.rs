//! Curve25519 identities for tunnel peers.
//!
//! Keys are generated natively with x25519-dalek and carried as standard
//! base64 of the 32 raw bytes, the same encoding `wg genkey` and `wg pubkey`
//! produce. No external binary is needed.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::rngs::OsRng;
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{CoreError, CoreResult};

pub const KEY_LEN: usize = 32;

#[derive(Clone)]
pub struct KeyPair {
    pub public_key: String,
    pub private_key: String,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Source of peer keypairs.
pub trait IdentityIssuer: Send + Sync {
    fn generate_keypair(&self) -> CoreResult<KeyPair>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct X25519Issuer;

impl IdentityIssuer for X25519Issuer {
    fn generate_keypair(&self) -> CoreResult<KeyPair> {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);

        Ok(KeyPair {
            public_key: STANDARD.encode(public.as_bytes()),
            private_key: STANDARD.encode(secret.to_bytes()),
        })
    }
}

/// Decode a base64 key and check its length.
pub fn decode_key(encoded: &str) -> Result<[u8; KEY_LEN], String> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| format!("not valid base64: {e}"))?;
    <[u8; KEY_LEN]>::try_from(bytes.as_slice())
        .map_err(|_| format!("expected {KEY_LEN} bytes, got {}", bytes.len()))
}

/// Public key belonging to a base64 private key.
pub fn derive_public_key(private_key: &str) -> CoreResult<String> {
    let bytes = decode_key(private_key).map_err(CoreError::KeyGen)?;
    let secret = StaticSecret::from(bytes);
    Ok(STANDARD.encode(PublicKey::from(&secret).as_bytes()))
}
