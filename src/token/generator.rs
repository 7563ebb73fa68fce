//! Secure Token Generator
//!
//! # Minting
//!
//! ```text
//! data ──serde_json──► TokenPayload{id, created, expires, type, data}
//!      ──AES-256-GCM(master key, aad = token id)──► ciphertext + nonce + tag
//!      ──JSON + Base64──► envelope ──► SecureToken ──► TokenStorage
//! ```
//!
//! # Retrieval
//!
//! 1. Read the token id from the outer envelope (no decryption)
//! 2. Storage lookup; revoked or expired records are rejected here
//! 3. Constant-time compare presented envelope with the stored one
//! 4. Decrypt, then re-check expiry from the decrypted payload
//!
//! Every failure in 1-4 yields `None`. Only storage outages are errors.

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::Duration;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::error::TokenError;
use super::model::{ENVELOPE_VERSION, SecureToken, TokenEnvelope, TokenInfo, TokenPayload};
use crate::clock::{Clock, to_millis_precision};
use crate::core_types::Metadata;
use crate::crypto::{ALGORITHM, CryptoError, CryptoService, MasterKey, constant_time_eq_str};
use crate::storage::TokenStorage;

pub struct SecureTokenGenerator {
    storage: Arc<dyn TokenStorage>,
    crypto: CryptoService,
    master_key: Arc<MasterKey>,
    clock: Arc<dyn Clock>,
    default_expiration: Option<Duration>,
}

impl SecureTokenGenerator {
    pub fn new(
        storage: Arc<dyn TokenStorage>,
        crypto: CryptoService,
        master_key: Arc<MasterKey>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            crypto,
            master_key,
            clock,
            default_expiration: None,
        }
    }

    /// Expiration applied when `generate_token` is called without one
    pub fn with_default_expiration(mut self, expiration: Option<Duration>) -> Self {
        self.default_expiration = expiration;
        self
    }

    pub fn storage(&self) -> &Arc<dyn TokenStorage> {
        &self.storage
    }

    /// Mint and persist a token wrapping `data`.
    ///
    /// `expiration` falls back to the configured default; `None` for both
    /// means the token never expires.
    pub async fn generate_token<T: Serialize>(
        &self,
        data: &T,
        expiration: Option<Duration>,
    ) -> Result<SecureToken, TokenError> {
        self.generate_token_with_metadata(data, expiration, Metadata::new())
            .await
    }

    pub async fn generate_token_with_metadata<T: Serialize>(
        &self,
        data: &T,
        expiration: Option<Duration>,
        metadata: Metadata,
    ) -> Result<SecureToken, TokenError> {
        let token_id = Uuid::new_v4().to_string();
        let created_at = to_millis_precision(self.clock.now());
        let expires_at = expiration
            .or(self.default_expiration)
            .map(|ttl| created_at + ttl);

        let data = canonical_value(data)?;
        let data_bytes = serde_json::to_vec(&data)?;

        let payload = TokenPayload {
            token_id: token_id.clone(),
            created_at,
            expires_at,
            data_type: std::any::type_name::<T>().to_string(),
            data,
        };
        let plaintext = serde_json::to_vec(&payload)?;

        let sealed = self.crypto.encrypt_with_key(
            self.master_key.as_bytes(),
            &plaintext,
            Some(token_id.as_bytes()),
        )?;

        let envelope = TokenEnvelope {
            version: ENVELOPE_VERSION,
            token_id: token_id.clone(),
            encrypted_data: STANDARD.encode(&sealed.cipher_text),
            nonce: STANDARD.encode(sealed.nonce),
            tag: STANDARD.encode(sealed.tag),
            algorithm: ALGORITHM.to_string(),
        };

        let data_hash = self.hash_data(data_bytes, token_id.clone()).await?;

        let token = SecureToken {
            token_id,
            token: envelope.encode()?,
            created_at,
            expires_at,
            data_hash,
            metadata,
        };
        self.storage.store_token(&token).await?;

        info!(
            token_id = %token.token_id,
            expires_at = ?token.expires_at,
            backend = self.storage.backend_name(),
            "Secure token generated"
        );
        Ok(token)
    }

    /// Recover the wrapped data, or `None` for any invalid token
    pub async fn retrieve_data<T: DeserializeOwned>(
        &self,
        token: &str,
    ) -> Result<Option<T>, TokenError> {
        let Some(envelope) = TokenEnvelope::decode(token) else {
            debug!("Token rejected: malformed envelope");
            return Ok(None);
        };

        let Some(stored) = self.storage.get_token(&envelope.token_id).await? else {
            debug!(token_id = %envelope.token_id, "Token rejected: not found, revoked or expired");
            return Ok(None);
        };

        if !constant_time_eq_str(&stored.token, token.trim()) {
            debug!(token_id = %envelope.token_id, "Token rejected: envelope mismatch");
            return Ok(None);
        }

        let Some(payload) = self.open(&envelope) else {
            debug!(token_id = %envelope.token_id, "Token rejected: decryption failed");
            return Ok(None);
        };

        if payload.expires_at.is_some_and(|e| self.clock.now() >= e) {
            debug!(token_id = %envelope.token_id, "Token rejected: payload expired");
            return Ok(None);
        }

        Ok(serde_json::from_value(payload.data).ok())
    }

    /// True for a stored, non-revoked, non-expired token. No decryption.
    pub async fn validate_token(&self, token: &str) -> Result<bool, TokenError> {
        match TokenEnvelope::decode(token) {
            Some(envelope) => Ok(self.storage.exists(&envelope.token_id).await?),
            None => Ok(false),
        }
    }

    /// Revoke by the id in the outer envelope. No decryption.
    pub async fn revoke_token(&self, token: &str) -> Result<bool, TokenError> {
        let Some(envelope) = TokenEnvelope::decode(token) else {
            return Ok(false);
        };
        let revoked = self.storage.revoke_token(&envelope.token_id).await?;
        if revoked {
            info!(token_id = %envelope.token_id, "Secure token revoked");
        }
        Ok(revoked)
    }

    /// Read id, version and algorithm without the master key
    pub fn inspect(&self, token: &str) -> Option<TokenInfo> {
        TokenEnvelope::decode(token).map(TokenInfo::from)
    }

    /// Check that `data` is what the token was minted over.
    ///
    /// Informational only; retrieval does not depend on it.
    pub async fn verify_data_hash<T: Serialize>(&self, token: &SecureToken, data: &T) -> bool {
        let Ok(bytes) = canonical_value(data).and_then(|v| serde_json::to_vec(&v)) else {
            return false;
        };
        match self.hash_data(bytes, token.token_id.clone()).await {
            Ok(actual) => constant_time_eq_str(&actual, &token.data_hash),
            Err(_) => false,
        }
    }

    fn open(&self, envelope: &TokenEnvelope) -> Option<TokenPayload> {
        if envelope.version != ENVELOPE_VERSION || envelope.algorithm != ALGORITHM {
            return None;
        }
        let cipher_text = STANDARD.decode(&envelope.encrypted_data).ok()?;
        let nonce = STANDARD.decode(&envelope.nonce).ok()?;
        let tag = STANDARD.decode(&envelope.tag).ok()?;

        let plaintext = self.crypto.decrypt(
            &cipher_text,
            self.master_key.as_bytes(),
            &nonce,
            &tag,
            Some(envelope.token_id.as_bytes()),
        )?;
        let payload: TokenPayload = serde_json::from_slice(&plaintext).ok()?;
        (payload.token_id == envelope.token_id).then_some(payload)
    }

    /// Argon2id fingerprint, computed on the blocking pool
    async fn hash_data(&self, data: Vec<u8>, token_id: String) -> Result<String, TokenError> {
        let crypto = self.crypto.clone();
        tokio::task::spawn_blocking(move || crypto.compute_hash(&data, token_id.as_bytes()))
            .await
            .map_err(|e| CryptoError::HashFailed(e.to_string()))?
            .map_err(TokenError::from)
    }
}

/// JSON value of `data` with every object's keys in sorted order.
///
/// Map iteration order of the source type (`HashMap`) and of `Value`
/// itself (insertion order under `preserve_order`) must not leak into the
/// hashed bytes.
fn canonical_value<T: Serialize>(data: &T) -> serde_json::Result<Value> {
    serde_json::to_value(data).map(sort_keys)
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, sort_keys(value)))
                    .collect::<Map<String, Value>>(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}
