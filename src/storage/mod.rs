//! Token Storage
//!
//! One async contract, five backends with identical semantics:
//!
//! | Backend    | Type                    | Notes                              |
//! |------------|-------------------------|------------------------------------|
//! | `memory`   | [`InMemoryTokenStorage`]| DashMap + owned cleanup task       |
//! | `postgres` | [`PostgresTokenStorage`]| `secure_tokens_tb`, TIMESTAMPTZ    |
//! | `sqlite`   | [`SqliteTokenStorage`]  | `secure_tokens_tb`, epoch millis   |
//! | `mongodb`  | [`MongoTokenStorage`]   | one document per token             |
//! | `redis`    | [`RedisTokenStorage`]   | JSON value per key + id index set  |
//!
//! # Semantics
//!
//! 1. **Soft revoke**: `revoke_token` sets a flag and timestamp, nothing is purged
//! 2. **Hidden when invalid**: `get_token`/`exists` never surface revoked or
//!    expired records, even before cleanup purges them
//! 3. **Purge is separate**: `cleanup_expired` physically deletes expired records
//! 4. **Self-provisioning**: external backends create schema/indexes on first use

pub mod document;
pub mod error;
pub mod kv;
pub mod memory;
pub mod postgres;
pub mod record;
pub mod sqlite;
pub mod worker;

pub use document::MongoTokenStorage;
pub use error::StorageError;
pub use kv::RedisTokenStorage;
pub use memory::InMemoryTokenStorage;
pub use postgres::PostgresTokenStorage;
pub use record::{StorageStatistics, StoredToken, TokenListCriteria};
pub use sqlite::SqliteTokenStorage;
pub use worker::{CleanupWorker, CleanupWorkerConfig};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::clock::Clock;
use crate::config::{StorageBackend, StorageConfig};
use crate::token::SecureToken;

/// Persistence contract for secure tokens.
#[async_trait]
pub trait TokenStorage: Send + Sync {
    /// Backend name for logging
    fn backend_name(&self) -> &'static str;

    /// Insert or overwrite a token
    async fn store_token(&self, token: &SecureToken) -> Result<(), StorageError>;

    /// Fetch a token that is neither revoked nor expired
    async fn get_token(&self, token_id: &str) -> Result<Option<SecureToken>, StorageError>;

    /// Physically delete a token. Returns true if a record was removed.
    async fn remove_token(&self, token_id: &str) -> Result<bool, StorageError>;

    /// Soft-delete. Returns true if the record existed and was not already revoked.
    async fn revoke_token(&self, token_id: &str) -> Result<bool, StorageError>;

    /// True only for a present, non-revoked, non-expired token
    async fn exists(&self, token_id: &str) -> Result<bool, StorageError> {
        Ok(self.get_token(token_id).await?.is_some())
    }

    /// Filtered, ordered (created_at, token_id) and paginated listing
    async fn list_tokens(
        &self,
        criteria: &TokenListCriteria,
    ) -> Result<Vec<StoredToken>, StorageError>;

    /// Purge every record whose expiry has passed. Returns the number removed.
    async fn cleanup_expired(&self) -> Result<u64, StorageError>;

    async fn get_statistics(&self) -> Result<StorageStatistics, StorageError>;
}

/// Build the backend selected in configuration.
///
/// External backends connect lazily: an unreachable server surfaces as
/// `StorageError::Unavailable` from the first operation, not from here.
pub async fn build_storage(
    config: &StorageConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn TokenStorage>, StorageError> {
    let storage: Arc<dyn TokenStorage> = match config.backend {
        StorageBackend::Memory => Arc::new(InMemoryTokenStorage::with_cleanup_interval(
            clock,
            Duration::from_secs(config.cleanup_interval_secs),
        )),
        StorageBackend::Postgres => {
            let sql = config
                .postgres
                .as_ref()
                .ok_or_else(|| StorageError::Config("missing [storage.postgres] section".into()))?;
            Arc::new(PostgresTokenStorage::connect_lazy(sql, clock)?)
        }
        StorageBackend::Sqlite => {
            let sql = config
                .sqlite
                .as_ref()
                .ok_or_else(|| StorageError::Config("missing [storage.sqlite] section".into()))?;
            Arc::new(SqliteTokenStorage::connect_lazy(sql, clock)?)
        }
        StorageBackend::Mongodb => {
            let mongo = config
                .mongodb
                .as_ref()
                .ok_or_else(|| StorageError::Config("missing [storage.mongodb] section".into()))?;
            Arc::new(MongoTokenStorage::connect(mongo, clock).await?)
        }
        StorageBackend::Redis => {
            let redis = config
                .redis
                .as_ref()
                .ok_or_else(|| StorageError::Config("missing [storage.redis] section".into()))?;
            Arc::new(RedisTokenStorage::open(redis, clock)?)
        }
    };

    info!(backend = storage.backend_name(), "Token storage initialized");
    Ok(storage)
}
