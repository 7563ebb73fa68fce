//! Transaction Error Types
//!
//! Every failure inside the pipeline is converted into one of these at a
//! single point and then into a failed `TransactionResult`.

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::storage::StorageError;
use crate::token::TokenError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Transaction timed out: {0}")]
    Timeout(String),

    #[error("Transaction cancelled")]
    Cancelled,

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Decrypt, hash, expiry or revocation failure. Same shape as not-found.
    #[error("Token invalid")]
    TokenInvalid,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TransactionError {
    /// Stable error code for results and events
    pub fn code(&self) -> &'static str {
        match self {
            TransactionError::Validation(_) => "VALIDATION_ERROR",
            TransactionError::Unauthorized(_) => "UNAUTHORIZED",
            TransactionError::Timeout(_) => "TIMEOUT",
            TransactionError::Cancelled => "CANCELLED",
            TransactionError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            TransactionError::TokenInvalid => "TOKEN_INVALID",
            TransactionError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            TransactionError::Validation(_) => 400,
            TransactionError::Unauthorized(_) => 401,
            TransactionError::TokenInvalid => 404,
            TransactionError::Timeout(_) => 408,
            TransactionError::Cancelled => 499,
            TransactionError::Internal(_) => 500,
            TransactionError::StorageUnavailable(_) => 503,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        TransactionError::Validation(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        TransactionError::Unauthorized(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        TransactionError::Internal(msg.into())
    }
}

impl From<StorageError> for TransactionError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Unavailable(msg) => TransactionError::StorageUnavailable(msg),
            other => TransactionError::Internal(other.to_string()),
        }
    }
}

impl From<TokenError> for TransactionError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Storage(storage) => storage.into(),
            other => TransactionError::Internal(other.to_string()),
        }
    }
}

impl From<CryptoError> for TransactionError {
    fn from(e: CryptoError) -> Self {
        TransactionError::Internal(e.to_string())
    }
}

impl From<anyhow::Error> for TransactionError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast::<TransactionError>() {
            Ok(err) => err,
            Err(e) => TransactionError::Internal(format!("{e:#}")),
        }
    }
}
