//! Crypto Error Types

use thiserror::Error;

use super::{KEY_LENGTH, NONCE_LENGTH};

/// Cryptographic failures.
///
/// Decryption failures are not represented here: `decrypt` returns `None`
/// so callers cannot tell a wrong key from a flipped bit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encryption failed")]
    EncryptFailed,

    #[error("invalid key length: expected {KEY_LENGTH} bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("invalid nonce length: expected {NONCE_LENGTH} bytes, got {0}")]
    InvalidNonceLength(usize),

    #[error("invalid KDF parameters: {0}")]
    InvalidKdfParams(String),

    #[error("hashing failed: {0}")]
    HashFailed(String),
}
