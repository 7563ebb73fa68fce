//! Token value types
//!
//! `SecureToken` is what callers hold. `TokenEnvelope` is the outer Base64
//! JSON structure inside `SecureToken::token`. `TokenPayload` is the
//! plaintext sealed inside the envelope.

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core_types::{Metadata, TokenId};

/// Current envelope format version
pub const ENVELOPE_VERSION: u32 = 1;

/// Portable encrypted token.
///
/// Revocation is tracked by storage, so validity cannot be decided from
/// this value alone; only expiry can.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecureToken {
    pub token_id: TokenId,
    /// Base64 envelope
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Salted fingerprint of the serialized payload data
    pub data_hash: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl SecureToken {
    /// Expired once `now` reaches `expires_at`
    #[inline]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Outer token structure. Readable without the master key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenEnvelope {
    pub version: u32,
    pub token_id: TokenId,
    /// Base64 ciphertext (without tag)
    pub encrypted_data: String,
    /// Base64 96-bit nonce
    pub nonce: String,
    /// Base64 128-bit tag
    pub tag: String,
    pub algorithm: String,
}

impl TokenEnvelope {
    /// Serialize to JSON and Base64-encode
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_vec(self)?;
        Ok(STANDARD.encode(json))
    }

    /// Parse a Base64 envelope. Any malformation yields `None`.
    pub fn decode(token: &str) -> Option<Self> {
        let json = STANDARD.decode(token.trim()).ok()?;
        let envelope: Self = serde_json::from_slice(&json).ok()?;
        if envelope.token_id.is_empty() {
            return None;
        }
        Some(envelope)
    }
}

/// Plaintext sealed inside the envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPayload {
    pub token_id: TokenId,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Rust type name of the wrapped data, informational only
    pub data_type: String,
    pub data: serde_json::Value,
}

/// Non-secret facts about a token, readable without decryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub token_id: TokenId,
    pub version: u32,
    pub algorithm: String,
}

impl From<TokenEnvelope> for TokenInfo {
    fn from(envelope: TokenEnvelope) -> Self {
        Self {
            token_id: envelope.token_id,
            version: envelope.version,
            algorithm: envelope.algorithm,
        }
    }
}
