//! Storage Error Types
//!
//! A record that is revoked or expired is never an error; backends return
//! `None`/`false` for it. Errors mean the backend itself misbehaved.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum StorageError {
    /// Backend could not be reached (connection refused, pool timeout, ...)
    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),

    /// Backend answered with an error
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Stored record could not be encoded/decoded
    #[error("Record serialization error: {0}")]
    Serialization(String),

    #[error("Invalid storage configuration: {0}")]
    Config(String),
}

impl StorageError {
    pub fn code(&self) -> &'static str {
        match self {
            StorageError::Unavailable(_) => "STORAGE_UNAVAILABLE",
            StorageError::Backend(_) => "STORAGE_ERROR",
            StorageError::Serialization(_) => "STORAGE_SERIALIZATION",
            StorageError::Config(_) => "STORAGE_CONFIG",
        }
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => StorageError::Unavailable(e.to_string()),
            sqlx::Error::Configuration(_) => StorageError::Config(e.to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StorageError::Serialization(e.to_string())
            }
            _ => StorageError::Backend(e.to_string()),
        }
    }
}

impl From<mongodb::error::Error> for StorageError {
    fn from(e: mongodb::error::Error) -> Self {
        use mongodb::error::ErrorKind;
        match *e.kind {
            ErrorKind::ServerSelection { .. }
            | ErrorKind::Io(_)
            | ErrorKind::ConnectionPoolCleared { .. } => StorageError::Unavailable(e.to_string()),
            ErrorKind::InvalidArgument { .. } => StorageError::Config(e.to_string()),
            ErrorKind::BsonDeserialization(_) | ErrorKind::BsonSerialization(_) => {
                StorageError::Serialization(e.to_string())
            }
            _ => StorageError::Backend(e.to_string()),
        }
    }
}

impl From<redis::RedisError> for StorageError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout()
        {
            StorageError::Unavailable(e.to_string())
        } else {
            StorageError::Backend(e.to_string())
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}
