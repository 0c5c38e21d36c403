//! Key exchange and challenge/response primitives for the handshake.
//!
//! This module provides ephemeral X25519 key agreement with SHA-256 key
//! derivation, plus the cluster and user authentication keys exchanged during
//! the handshake:
//!
//! ```text
//! ClusterAuthKey = hex(SHA-256(cluster_secret_hex || token))
//! UserAuthKey    = hex(SHA-256(token || password))
//! ```
//!
//! Key comparison is constant-time.

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::error::{ProtocolError, Result};

/// Length of an X25519 public key in bytes.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Length of a derived session key in bytes.
pub const SESSION_KEY_LENGTH: usize = 32;

/// Random bytes behind an authentication token.
const TOKEN_BYTES: usize = 16;

/// Random bytes behind a generated cluster secret.
const CLUSTER_SECRET_BYTES: usize = 32;

/// Domain separation prefix for session key derivation.
const SESSION_KEY_CONTEXT: &[u8] = b"wolpertinger-session-v1";

// ============================================================================
// Key exchange
// ============================================================================

/// One side of an ephemeral Diffie-Hellman exchange.
///
/// Consumed by [`KeyExchange::complete`], so a key pair is never reused.
pub struct KeyExchange {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl KeyExchange {
    /// Generates a fresh ephemeral key pair.
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Returns the public half to send to the peer.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.public.to_bytes()
    }

    /// Combines our secret with the peer's public key into a session key.
    pub fn complete(self, peer_public: &[u8]) -> Result<SessionKey> {
        let bytes: [u8; PUBLIC_KEY_LENGTH] = peer_public.try_into().map_err(|_| {
            ProtocolError::InvalidPublicKey(format!(
                "expected {} bytes, got {}",
                PUBLIC_KEY_LENGTH,
                peer_public.len()
            ))
        })?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(bytes));
        if !shared.was_contributory() {
            return Err(ProtocolError::InvalidPublicKey(
                "peer key is a low-order point".to_string(),
            ));
        }
        Ok(SessionKey::derive(shared.as_bytes()))
    }
}

impl std::fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyExchange")
            .field("public", &hex::encode(self.public.as_bytes()))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Symmetric key shared by both ends after a key exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; SESSION_KEY_LENGTH]);

impl SessionKey {
    /// Derives the session key from a raw shared secret.
    pub fn derive(shared_secret: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(SESSION_KEY_CONTEXT);
        hasher.update(shared_secret);
        Self(hasher.finalize().into())
    }

    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LENGTH] {
        &self.0
    }

    /// Short non-secret identifier for logs: hex of the key's SHA-256, truncated.
    pub fn fingerprint(&self) -> String {
        hex::encode(&Sha256::digest(self.0)[..8])
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

// ============================================================================
// Challenge/response
// ============================================================================

/// A single-use challenge token issued by a verifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AuthToken(String);

impl AuthToken {
    /// Generates a random token (hex of 16 random bytes).
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Wraps a token received from a peer.
    pub fn from_string(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the token text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An authentication key computed by the proving side.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthKey(String);

impl AuthKey {
    /// Wraps a key received from a peer.
    pub fn from_string(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Constant-time comparison against a candidate key.
    pub fn verify(&self, candidate: &str) -> bool {
        constant_time_eq(self.0.as_bytes(), candidate.as_bytes())
    }
}

impl std::fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthKey([REDACTED])")
    }
}

/// Shared secret proving membership in an administrative cluster.
///
/// Stored and hashed in its lowercase hex form.
#[derive(Clone, PartialEq, Eq)]
pub struct ClusterSecret(String);

impl ClusterSecret {
    /// Parses a hex-encoded secret.
    pub fn from_hex(secret: &str) -> Result<Self> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(ProtocolError::InvalidClusterSecret("secret is empty".to_string()));
        }
        hex::decode(secret).map_err(|e| ProtocolError::InvalidClusterSecret(e.to_string()))?;
        Ok(Self(secret.to_ascii_lowercase()))
    }

    /// Generates a random 32-byte secret.
    pub fn generate() -> Self {
        let mut bytes = [0u8; CLUSTER_SECRET_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Returns the hex form of the secret.
    pub fn as_hex(&self) -> &str {
        &self.0
    }

    /// Computes the cluster authentication key for `token`.
    pub fn auth_key(&self, token: &AuthToken) -> AuthKey {
        cluster_auth_key(&self.0, token.as_str())
    }
}

impl std::fmt::Debug for ClusterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ClusterSecret([REDACTED])")
    }
}

/// `hex(SHA-256(secret_hex || token))`.
pub fn cluster_auth_key(secret_hex: &str, token: &str) -> AuthKey {
    let mut hasher = Sha256::new();
    hasher.update(secret_hex.as_bytes());
    hasher.update(token.as_bytes());
    AuthKey(hex::encode(hasher.finalize()))
}

/// `hex(SHA-256(token || password))`.
pub fn user_auth_key(token: &str, password: &str) -> AuthKey {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.update(password.as_bytes());
    AuthKey(hex::encode(hasher.finalize()))
}

/// Constant-time equality, including the length check.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let max_len = a.len().max(b.len());
    let mut a_padded = vec![0u8; max_len];
    let mut b_padded = vec![0xFFu8; max_len];
    a_padded[..a.len()].copy_from_slice(a);
    b_padded[..b.len()].copy_from_slice(b);

    let lengths_equal = a.len().ct_eq(&b.len());
    let contents_equal = a_padded.ct_eq(&b_padded);
    (lengths_equal & contents_equal).into()
}
