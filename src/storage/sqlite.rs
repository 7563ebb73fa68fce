//! SQLite token storage
//!
//! Same table layout as the PostgreSQL backend, but timestamps are stored
//! as INTEGER epoch milliseconds so range comparisons stay numeric.
//! `sqlite::memory:` URLs are pinned to a single long-lived connection,
//! otherwise every pooled connection would see its own empty database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{Sqlite, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::TokenStorage;
use super::error::StorageError;
use super::postgres::{decode_metadata, encode_metadata, to_i64};
use super::record::{StorageStatistics, StoredToken, TokenListCriteria};
use crate::clock::Clock;
use crate::config::SqlConfig;
use crate::token::SecureToken;

const NEVER: i64 = i64::MIN;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS secure_tokens_tb (
        token_id    TEXT PRIMARY KEY NOT NULL,
        token       TEXT NOT NULL,
        data_hash   TEXT NOT NULL,
        created_at  INTEGER NOT NULL,
        expires_at  INTEGER NULL,
        metadata    TEXT NULL,
        is_revoked  INTEGER NOT NULL DEFAULT 0,
        revoked_at  INTEGER NULL,
        stored_at   INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_secure_tokens_expires_at ON secure_tokens_tb (expires_at)",
    "CREATE INDEX IF NOT EXISTS idx_secure_tokens_created_at ON secure_tokens_tb (created_at)",
    "CREATE INDEX IF NOT EXISTS idx_secure_tokens_is_revoked ON secure_tokens_tb (is_revoked)",
];

const SELECT_COLUMNS: &str = "token_id, token, data_hash, created_at, expires_at, metadata, \
                              is_revoked, revoked_at, stored_at";

pub struct SqliteTokenStorage {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    schema: OnceCell<()>,
    last_cleanup_micros: AtomicI64,
}

impl SqliteTokenStorage {
    /// Create a pool that opens the database on first use
    pub fn connect_lazy(config: &SqlConfig, clock: Arc<dyn Clock>) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);

        let pool_options = if config.url.contains(":memory:") {
            SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(config.max_connections)
        };

        let pool = pool_options
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect_lazy_with(options);
        Ok(Self::from_pool(pool, clock))
    }

    pub fn from_pool(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            clock,
            schema: OnceCell::new(),
            last_cleanup_micros: AtomicI64::new(NEVER),
        }
    }

    async fn ensure_schema(&self) -> Result<(), StorageError> {
        self.schema
            .get_or_try_init(|| async {
                for statement in SCHEMA {
                    sqlx::query(statement).execute(&self.pool).await?;
                }
                info!("SQLite token schema ready");
                Ok::<(), StorageError>(())
            })
            .await?;
        Ok(())
    }

    async fn fetch(&self, token_id: &str) -> Result<Option<StoredToken>, StorageError> {
        self.ensure_schema().await?;
        let sql = format!("SELECT {SELECT_COLUMNS} FROM secure_tokens_tb WHERE token_id = ?");
        let row = sqlx::query(&sql)
            .bind(token_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_record).transpose()
    }
}

#[inline]
fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StorageError::Serialization(format!("timestamp out of range: {millis}")))
}

/// Visibility, windows, ordering and (without a metadata filter) paging
/// all run in SQL
fn list_query(criteria: &TokenListCriteria, now: DateTime<Utc>) -> QueryBuilder<'static, Sqlite> {
    let mut query =
        QueryBuilder::new(format!("SELECT {SELECT_COLUMNS} FROM secure_tokens_tb WHERE 1 = 1"));
    if !criteria.include_revoked {
        query.push(" AND is_revoked = 0");
    }
    if !criteria.include_expired {
        query
            .push(" AND (expires_at IS NULL OR expires_at > ")
            .push_bind(to_millis(now))
            .push(")");
    }
    if let Some(after) = criteria.created_after {
        query.push(" AND created_at >= ").push_bind(to_millis(after));
    }
    if let Some(before) = criteria.created_before {
        query.push(" AND created_at < ").push_bind(to_millis(before));
    }
    if let Some(after) = criteria.expires_after {
        query.push(" AND expires_at >= ").push_bind(to_millis(after));
    }
    if let Some(before) = criteria.expires_before {
        query.push(" AND expires_at < ").push_bind(to_millis(before));
    }
    query.push(" ORDER BY created_at, token_id");

    // SQLite needs a LIMIT before OFFSET; -1 means unbounded
    if criteria.pages_in_backend() && (criteria.limit.is_some() || criteria.offset > 0) {
        query
            .push(" LIMIT ")
            .push_bind(criteria.limit.map(to_i64).unwrap_or(-1))
            .push(" OFFSET ")
            .push_bind(to_i64(criteria.offset));
    }
    query
}

fn row_to_record(row: &SqliteRow) -> Result<StoredToken, StorageError> {
    let expires_at: Option<i64> = row.try_get("expires_at")?;
    let revoked_at: Option<i64> = row.try_get("revoked_at")?;
    let metadata: Option<String> = row.try_get("metadata")?;

    Ok(StoredToken {
        token: SecureToken {
            token_id: row.try_get("token_id")?,
            token: row.try_get("token")?,
            created_at: from_millis(row.try_get("created_at")?)?,
            expires_at: expires_at.map(from_millis).transpose()?,
            data_hash: row.try_get("data_hash")?,
            metadata: decode_metadata(metadata)?,
        },
        is_revoked: row.try_get("is_revoked")?,
        revoked_at: revoked_at.map(from_millis).transpose()?,
        stored_at: from_millis(row.try_get("stored_at")?)?,
    })
}

#[async_trait]
impl TokenStorage for SqliteTokenStorage {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn store_token(&self, token: &SecureToken) -> Result<(), StorageError> {
        self.ensure_schema().await?;
        sqlx::query(
            r#"
            INSERT INTO secure_tokens_tb
                (token_id, token, data_hash, created_at, expires_at, metadata, is_revoked, revoked_at, stored_at)
            VALUES
                (?, ?, ?, ?, ?, ?, 0, NULL, ?)
            ON CONFLICT (token_id) DO UPDATE SET
                token = excluded.token,
                data_hash = excluded.data_hash,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at,
                metadata = excluded.metadata,
                is_revoked = 0,
                revoked_at = NULL,
                stored_at = excluded.stored_at
            "#,
        )
        .bind(&token.token_id)
        .bind(&token.token)
        .bind(&token.data_hash)
        .bind(to_millis(token.created_at))
        .bind(token.expires_at.map(to_millis))
        .bind(encode_metadata(&token.metadata)?)
        .bind(to_millis(self.clock.now()))
        .execute(&self.pool)
        .await?;

        debug!(token_id = %token.token_id, "Token stored");
        Ok(())
    }

    async fn get_token(&self, token_id: &str) -> Result<Option<SecureToken>, StorageError> {
        let now = self.clock.now();
        Ok(self
            .fetch(token_id)
            .await?
            .and_then(|record| record.into_valid(now)))
    }

    async fn remove_token(&self, token_id: &str) -> Result<bool, StorageError> {
        self.ensure_schema().await?;
        let result = sqlx::query("DELETE FROM secure_tokens_tb WHERE token_id = ?")
            .bind(token_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn revoke_token(&self, token_id: &str) -> Result<bool, StorageError> {
        self.ensure_schema().await?;
        let result = sqlx::query(
            "UPDATE secure_tokens_tb SET is_revoked = 1, revoked_at = ? \
             WHERE token_id = ? AND is_revoked = 0",
        )
        .bind(to_millis(self.clock.now()))
        .bind(token_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_tokens(
        &self,
        criteria: &TokenListCriteria,
    ) -> Result<Vec<StoredToken>, StorageError> {
        self.ensure_schema().await?;
        let now = self.clock.now();
        let rows = list_query(criteria, now)
            .build()
            .fetch_all(&self.pool)
            .await?;

        let records = rows
            .iter()
            .map(row_to_record)
            .collect::<Result<Vec<_>, _>>()?;
        if criteria.pages_in_backend() {
            return Ok(records);
        }
        Ok(criteria.apply(records, now))
    }

    async fn cleanup_expired(&self) -> Result<u64, StorageError> {
        self.ensure_schema().await?;
        let now = self.clock.now();
        let result = sqlx::query(
            "DELETE FROM secure_tokens_tb WHERE expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        self.last_cleanup_micros
            .store(now.timestamp_micros(), Ordering::Release);
        Ok(result.rows_affected())
    }

    async fn get_statistics(&self) -> Result<StorageStatistics, StorageError> {
        self.ensure_schema().await?;
        let now = self.clock.now();
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN is_revoked = 1 THEN 1 ELSE 0 END), 0) AS revoked,
                COALESCE(SUM(CASE WHEN is_revoked = 0 AND expires_at IS NOT NULL AND expires_at <= ?
                                  THEN 1 ELSE 0 END), 0) AS expired,
                COALESCE(SUM(LENGTH(token_id) + LENGTH(token) + LENGTH(data_hash)), 0) AS approx_size
            FROM secure_tokens_tb
            "#,
        )
        .bind(to_millis(now))
        .fetch_one(&self.pool)
        .await?;

        let total: i64 = row.try_get("total")?;
        let revoked: i64 = row.try_get("revoked")?;
        let expired: i64 = row.try_get("expired")?;
        let approx_size: i64 = row.try_get("approx_size")?;

        let last_cleanup = match self.last_cleanup_micros.load(Ordering::Acquire) {
            NEVER => None,
            micros => DateTime::<Utc>::from_timestamp_micros(micros),
        };

        Ok(StorageStatistics {
            total_tokens: total as u64,
            valid_tokens: (total - revoked - expired).max(0) as u64,
            expired_tokens: expired as u64,
            revoked_tokens: revoked as u64,
            approx_size_bytes: approx_size as u64,
            last_cleanup,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::core_types::Metadata;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn memory_storage(clock: Arc<ManualClock>) -> SqliteTokenStorage {
        let config = SqlConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 4,
            acquire_timeout_secs: 5,
        };
        SqliteTokenStorage::connect_lazy(&config, clock).unwrap()
    }

    fn token(id: &str, created_at: DateTime<Utc>, ttl: Option<ChronoDuration>) -> SecureToken {
        let created_at = crate::clock::to_millis_precision(created_at);
        let mut metadata = Metadata::new();
        metadata.insert("source".into(), json!("sqlite-test"));
        SecureToken {
            token_id: id.to_string(),
            token: format!("envelope-{id}"),
            created_at,
            expires_at: ttl.map(|ttl| created_at + ttl),
            data_hash: "hash".to_string(),
            metadata,
        }
    }

    #[tokio::test]
    async fn test_roundtrip_preserves_fields() {
        let clock = Arc::new(ManualClock::starting_now());
        let storage = memory_storage(clock.clone());
        let t = token("a", clock.now(), Some(ChronoDuration::minutes(5)));

        storage.store_token(&t).await.unwrap();
        assert_eq!(storage.get_token("a").await.unwrap(), Some(t));
    }

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let clock = Arc::new(ManualClock::starting_now());
        let storage = memory_storage(clock.clone());
        storage.ensure_schema().await.unwrap();
        for statement in SCHEMA {
            sqlx::query(statement).execute(&storage.pool).await.unwrap();
        }
        assert_eq!(storage.get_statistics().await.unwrap().total_tokens, 0);
    }

    #[tokio::test]
    async fn test_revoke_and_cleanup() {
        let clock = Arc::new(ManualClock::starting_now());
        let storage = memory_storage(clock.clone());
        storage
            .store_token(&token("short", clock.now(), Some(ChronoDuration::seconds(30))))
            .await
            .unwrap();
        storage.store_token(&token("long", clock.now(), None)).await.unwrap();

        assert!(storage.revoke_token("long").await.unwrap());
        assert!(!storage.revoke_token("long").await.unwrap());

        clock.advance(ChronoDuration::minutes(1));
        let stats = storage.get_statistics().await.unwrap();
        assert_eq!(stats.total_tokens, 2);
        assert_eq!(stats.expired_tokens, 1);
        assert_eq!(stats.revoked_tokens, 1);
        assert_eq!(stats.valid_tokens, 0);

        assert_eq!(storage.cleanup_expired().await.unwrap(), 1);
        let stats = storage.get_statistics().await.unwrap();
        assert_eq!(stats.total_tokens, 1);
        assert!(stats.last_cleanup.is_some());
    }

    #[test]
    fn test_list_query_sql() {
        let now = Utc::now();
        let paged = list_query(&TokenListCriteria::new().page(4, 2), now).into_sql();
        assert!(paged.contains("is_revoked = 0"));
        assert!(paged.ends_with("ORDER BY created_at, token_id LIMIT ? OFFSET ?"));

        let unpaged = list_query(&TokenListCriteria::all(), now).into_sql();
        assert!(!unpaged.contains("is_revoked ="));
        assert!(!unpaged.contains("LIMIT"));

        let by_tenant = TokenListCriteria::all()
            .with_metadata("source", json!("sqlite-test"))
            .page(4, 2);
        assert!(!list_query(&by_tenant, now).into_sql().contains("LIMIT"));
    }

    #[tokio::test]
    async fn test_paging_in_sql() {
        let clock = Arc::new(ManualClock::starting_now());
        let storage = memory_storage(clock.clone());
        let base = crate::clock::to_millis_precision(clock.now());
        for i in 0..5 {
            let mut t = token(&format!("p{i}"), base + ChronoDuration::seconds(i), None);
            if i % 2 == 1 {
                t.metadata.insert("odd".into(), json!(true));
            }
            storage.store_token(&t).await.unwrap();
        }
        let ids = |records: Vec<StoredToken>| -> Vec<String> {
            records.into_iter().map(|r| r.token.token_id).collect()
        };

        let page = storage.list_tokens(&TokenListCriteria::new().page(1, 2)).await.unwrap();
        assert_eq!(ids(page), vec!["p1", "p2"]);

        let tail = TokenListCriteria {
            offset: 3,
            ..TokenListCriteria::new()
        };
        assert_eq!(ids(storage.list_tokens(&tail).await.unwrap()), vec!["p3", "p4"]);

        // offset counts only metadata matches
        let odd = TokenListCriteria::new().with_metadata("odd", json!(true)).page(1, 5);
        assert_eq!(ids(storage.list_tokens(&odd).await.unwrap()), vec!["p3"]);
    }
}
