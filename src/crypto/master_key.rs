//! Master key for tokens-at-rest
//!
//! Derived once at startup from the configured secret and held read-only
//! for the lifetime of the process. The key bytes are wiped on drop.

use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::Zeroizing;

use super::KEY_LENGTH;
use super::error::CryptoError;
use super::service::CryptoService;

pub struct MasterKey {
    key: Zeroizing<[u8; KEY_LENGTH]>,
}

impl MasterKey {
    /// Derive the master key with PBKDF2-HMAC-SHA256
    pub fn derive(
        crypto: &CryptoService,
        secret: &str,
        salt: &[u8],
        iterations: u32,
    ) -> Result<Self, CryptoError> {
        if secret.is_empty() {
            return Err(CryptoError::InvalidKdfParams(
                "master secret must not be empty".to_string(),
            ));
        }
        let derived = Zeroizing::new(crypto.derive_key(
            secret.as_bytes(),
            salt,
            iterations,
            KEY_LENGTH,
        )?);

        let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
        key.copy_from_slice(&derived);
        Ok(Self { key })
    }

    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self {
            key: Zeroizing::new(bytes),
        }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    /// Short non-secret identifier for logs: first 8 hex chars of SHA-256(key)
    pub fn key_id(&self) -> String {
        let digest = Sha256::digest(self.key.as_slice());
        hex::encode(&digest[..4])
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("key_id", &self.key_id())
            .finish()
    }
}
