//! PostgreSQL token storage
//!
//! Table `secure_tokens_tb`, created on first use together with its
//! indexes. Revocation is a CAS-style `UPDATE ... WHERE is_revoked = FALSE`,
//! so concurrent revokes report success exactly once.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow, Postgres};
use sqlx::{QueryBuilder, Row};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::TokenStorage;
use super::error::StorageError;
use super::record::{StorageStatistics, StoredToken, TokenListCriteria};
use crate::clock::Clock;
use crate::config::SqlConfig;
use crate::core_types::Metadata;
use crate::token::SecureToken;

const NEVER: i64 = i64::MIN;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS secure_tokens_tb (
        token_id    TEXT PRIMARY KEY,
        token       TEXT NOT NULL,
        data_hash   TEXT NOT NULL,
        created_at  TIMESTAMPTZ NOT NULL,
        expires_at  TIMESTAMPTZ NULL,
        metadata    TEXT NULL,
        is_revoked  BOOLEAN NOT NULL DEFAULT FALSE,
        revoked_at  TIMESTAMPTZ NULL,
        stored_at   TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_secure_tokens_expires_at ON secure_tokens_tb (expires_at)",
    "CREATE INDEX IF NOT EXISTS idx_secure_tokens_created_at ON secure_tokens_tb (created_at)",
    "CREATE INDEX IF NOT EXISTS idx_secure_tokens_is_revoked ON secure_tokens_tb (is_revoked)",
];

const SELECT_COLUMNS: &str = "token_id, token, data_hash, created_at, expires_at, metadata, \
                              is_revoked, revoked_at, stored_at";

pub struct PostgresTokenStorage {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    schema: OnceCell<()>,
    last_cleanup_micros: AtomicI64,
}

impl PostgresTokenStorage {
    /// Create a pool that connects on first use
    pub fn connect_lazy(config: &SqlConfig, clock: Arc<dyn Clock>) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect_lazy(&config.url)?;
        Ok(Self::from_pool(pool, clock))
    }

    pub fn from_pool(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            clock,
            schema: OnceCell::new(),
            last_cleanup_micros: AtomicI64::new(NEVER),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create table and indexes once per instance. Idempotent in the DB too.
    async fn ensure_schema(&self) -> Result<(), StorageError> {
        self.schema
            .get_or_try_init(|| async {
                for statement in SCHEMA {
                    sqlx::query(statement).execute(&self.pool).await?;
                }
                info!("PostgreSQL token schema ready");
                Ok::<(), StorageError>(())
            })
            .await?;
        Ok(())
    }

    async fn fetch(&self, token_id: &str) -> Result<Option<StoredToken>, StorageError> {
        self.ensure_schema().await?;
        let sql = format!("SELECT {SELECT_COLUMNS} FROM secure_tokens_tb WHERE token_id = $1");
        let row = sqlx::query(&sql)
            .bind(token_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_record).transpose()
    }
}

fn row_to_record(row: &PgRow) -> Result<StoredToken, StorageError> {
    let metadata: Option<String> = row.try_get("metadata")?;
    Ok(StoredToken {
        token: SecureToken {
            token_id: row.try_get("token_id")?,
            token: row.try_get("token")?,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
            data_hash: row.try_get("data_hash")?,
            metadata: decode_metadata(metadata)?,
        },
        is_revoked: row.try_get("is_revoked")?,
        revoked_at: row.try_get("revoked_at")?,
        stored_at: row.try_get("stored_at")?,
    })
}

/// SELECT with every filter in SQL. `@>` only narrows the candidates;
/// exact metadata equality and paging then run in `criteria.apply`.
fn list_query(
    criteria: &TokenListCriteria,
    now: DateTime<Utc>,
) -> Result<QueryBuilder<'static, Postgres>, StorageError> {
    let mut query =
        QueryBuilder::new(format!("SELECT {SELECT_COLUMNS} FROM secure_tokens_tb WHERE TRUE"));
    if !criteria.include_revoked {
        query.push(" AND is_revoked = FALSE");
    }
    if !criteria.include_expired {
        query
            .push(" AND (expires_at IS NULL OR expires_at > ")
            .push_bind(now)
            .push(")");
    }
    if let Some(after) = criteria.created_after {
        query.push(" AND created_at >= ").push_bind(after);
    }
    if let Some(before) = criteria.created_before {
        query.push(" AND created_at < ").push_bind(before);
    }
    // NULL expires_at fails both comparisons
    if let Some(after) = criteria.expires_after {
        query.push(" AND expires_at >= ").push_bind(after);
    }
    if let Some(before) = criteria.expires_before {
        query.push(" AND expires_at < ").push_bind(before);
    }
    if !criteria.metadata.is_empty() {
        query
            .push(" AND metadata::jsonb @> ")
            .push_bind(serde_json::to_string(&criteria.metadata)?)
            .push("::jsonb");
    }
    query.push(" ORDER BY created_at, token_id");

    if criteria.pages_in_backend() {
        if let Some(limit) = criteria.limit {
            query.push(" LIMIT ").push_bind(to_i64(limit));
        }
        if criteria.offset > 0 {
            query.push(" OFFSET ").push_bind(to_i64(criteria.offset));
        }
    }
    Ok(query)
}

#[inline]
pub(crate) fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Empty metadata is stored as NULL
pub(crate) fn encode_metadata(metadata: &Metadata) -> Result<Option<String>, StorageError> {
    if metadata.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(metadata)?))
}

pub(crate) fn decode_metadata(raw: Option<String>) -> Result<Metadata, StorageError> {
    match raw {
        Some(json) if !json.is_empty() => Ok(serde_json::from_str(&json)?),
        _ => Ok(Metadata::new()),
    }
}

#[async_trait]
impl TokenStorage for PostgresTokenStorage {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn store_token(&self, token: &SecureToken) -> Result<(), StorageError> {
        self.ensure_schema().await?;
        sqlx::query(
            r#"
            INSERT INTO secure_tokens_tb
                (token_id, token, data_hash, created_at, expires_at, metadata, is_revoked, revoked_at, stored_at)
            VALUES
                ($1, $2, $3, $4, $5, $6, FALSE, NULL, $7)
            ON CONFLICT (token_id) DO UPDATE SET
                token = EXCLUDED.token,
                data_hash = EXCLUDED.data_hash,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at,
                metadata = EXCLUDED.metadata,
                is_revoked = FALSE,
                revoked_at = NULL,
                stored_at = EXCLUDED.stored_at
            "#,
        )
        .bind(&token.token_id)
        .bind(&token.token)
        .bind(&token.data_hash)
        .bind(token.created_at)
        .bind(token.expires_at)
        .bind(encode_metadata(&token.metadata)?)
        .bind(self.clock.now())
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
        let result = sqlx::query("DELETE FROM secure_tokens_tb WHERE token_id = $1")
            .bind(token_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn revoke_token(&self, token_id: &str) -> Result<bool, StorageError> {
        self.ensure_schema().await?;
        let result = sqlx::query(
            r#"
            UPDATE secure_tokens_tb
            SET is_revoked = TRUE, revoked_at = $1
            WHERE token_id = $2 AND is_revoked = FALSE
            "#,
        )
        .bind(self.clock.now())
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
        let rows = list_query(criteria, now)?
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
            "DELETE FROM secure_tokens_tb WHERE expires_at IS NOT NULL AND expires_at <= $1",
        )
        .bind(now)
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
                COALESCE(SUM(CASE WHEN is_revoked THEN 1 ELSE 0 END), 0) AS revoked,
                COALESCE(SUM(CASE WHEN NOT is_revoked AND expires_at IS NOT NULL AND expires_at <= $1
                                  THEN 1 ELSE 0 END), 0) AS expired,
                COALESCE(SUM(LENGTH(token_id) + LENGTH(token) + LENGTH(data_hash)), 0) AS approx_size
            FROM secure_tokens_tb
            "#,
        )
        .bind(now)
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
