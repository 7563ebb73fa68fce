//! Token Error Types
//!
//! Invalid, forged, expired and revoked tokens are NOT errors: they resolve
//! to `None`/`false` so callers cannot tell them apart. Only failures of the
//! machinery itself surface here.

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::storage::StorageError;

#[derive(Error, Debug, Clone)]
pub enum TokenError {
    /// Token storage failed or is unreachable
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Data could not be serialized into a payload
    #[error("Token payload serialization failed: {0}")]
    Serialization(String),

    /// Encryption or fingerprinting failed while minting
    #[error("Token crypto failure: {0}")]
    Crypto(#[from] CryptoError),
}

impl TokenError {
    pub fn code(&self) -> &'static str {
        match self {
            TokenError::Storage(e) => e.code(),
            TokenError::Serialization(_) => "TOKEN_SERIALIZATION",
            TokenError::Crypto(_) => "TOKEN_CRYPTO",
        }
    }
}

impl From<serde_json::Error> for TokenError {
    fn from(e: serde_json::Error) -> Self {
        TokenError::Serialization(e.to_string())
    }
}
