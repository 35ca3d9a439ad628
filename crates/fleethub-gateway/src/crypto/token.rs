//! Bootstrap token generation and validation.
//!
//! Bootstrap tokens gate the certificate-signing endpoint: a new edge node
//! presents a single-use, time-limited token alongside its CSR before it
//! owns a certificate of its own.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// A bootstrap token stored in the gateway.
/// We never store the plaintext token - only its SHA-256 hash.
#[derive(Debug, Clone)]
pub struct BootstrapToken {
    /// SHA-256 hash of the token (hex encoded).
    pub token_hash: String,

    /// When the token was created.
    pub created_at: DateTime<Utc>,

    /// When the token expires.
    pub expires_at: DateTime<Utc>,

    /// Whether the token has been consumed.
    pub consumed: bool,
}

impl BootstrapToken {
    /// Create a new bootstrap token entry from a token hash.
    pub fn new(token_hash: String, validity_hours: u64) -> Self {
        let now = Utc::now();
        Self {
            token_hash,
            created_at: now,
            expires_at: now + Duration::hours(validity_hours as i64),
            consumed: false,
        }
    }

    /// Check if the token is valid (not expired and not consumed).
    pub fn is_valid(&self) -> bool {
        !self.consumed && Utc::now() < self.expires_at
    }

    /// Mark the token as consumed.
    pub fn consume(&mut self) {
        self.consumed = true;
    }
}

/// Generate a new bootstrap token.
///
/// Returns a tuple of (plaintext_token, token_hash). The plaintext token is
/// handed to the node operator; only the hash is stored gateway-side.
pub fn generate_bootstrap_token() -> (String, String) {
    let mut token_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut token_bytes);

    let plaintext = URL_SAFE_NO_PAD.encode(token_bytes);
    let token_hash = hash_token(&plaintext);

    (plaintext, token_hash)
}

/// Hash a token using SHA-256.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let result = hasher.finalize();
    hex::encode(result)
}
