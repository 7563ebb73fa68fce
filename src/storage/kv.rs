//! Redis token storage
//!
//! # Layout
//!
//! | Key                        | Type   | Content                       |
//! |----------------------------|--------|-------------------------------|
//! | `{prefix}:token:{id}`      | string | `StoredToken` as JSON         |
//! | `{prefix}:token-index`     | set    | every stored token id         |
//!
//! Token keys carry a TTL of `expires_at - now + expired_retention`, so an
//! expired record stays visible to listings and statistics for a while and
//! then Redis drops it. Cleanup removes expired records early and prunes
//! index entries whose key Redis already evicted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::TokenStorage;
use super::error::StorageError;
use super::record::{StorageStatistics, StoredToken, TokenListCriteria};
use crate::clock::Clock;
use crate::config::RedisConfig;
use crate::token::SecureToken;

const NEVER: i64 = i64::MIN;

/// Keys per MGET round-trip
const MGET_CHUNK: usize = 500;

/// KEYS = index, token keys; ARGV = (id, expected JSON) per token key.
/// An empty expected value marks an index entry whose key was evicted.
/// Returns the number of records removed.
const PURGE_SCRIPT: &str = r#"
local removed = 0
for i = 2, #KEYS do
    local id = ARGV[2 * i - 3]
    local expected = ARGV[2 * i - 2]
    local current = redis.call('GET', KEYS[i])
    if expected == '' then
        if not current then
            removed = removed + redis.call('SREM', KEYS[1], id)
        end
    elseif current == expected then
        redis.call('DEL', KEYS[i])
        redis.call('SREM', KEYS[1], id)
        removed = removed + 1
    end
end
return removed
"#;

pub struct RedisTokenStorage {
    client: Client,
    conn: OnceCell<ConnectionManager>,
    key_prefix: String,
    expired_retention: chrono::Duration,
    clock: Arc<dyn Clock>,
    last_cleanup_micros: AtomicI64,
}

impl RedisTokenStorage {
    /// Parse the URL. The connection is established on first use.
    pub fn open(config: &RedisConfig, clock: Arc<dyn Clock>) -> Result<Self, StorageError> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| StorageError::Config(format!("invalid redis url: {e}")))?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
            key_prefix: config.key_prefix.clone(),
            expired_retention: chrono::Duration::seconds(config.expired_retention_secs as i64),
            clock,
            last_cleanup_micros: AtomicI64::new(NEVER),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StorageError> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                let conn = ConnectionManager::new(self.client.clone()).await?;
                info!(prefix = %self.key_prefix, "Redis token storage connected");
                Ok::<_, StorageError>(conn)
            })
            .await?;
        Ok(conn.clone())
    }

    fn token_key(&self, token_id: &str) -> String {
        format!("{}:token:{}", self.key_prefix, token_id)
    }

    fn index_key(&self) -> String {
        format!("{}:token-index", self.key_prefix)
    }

    /// Milliseconds until Redis should drop the record, `None` for no TTL
    fn ttl_millis(&self, token: &SecureToken, now: DateTime<Utc>) -> Option<i64> {
        token.expires_at.map(|expires_at| {
            let ttl = expires_at - now + self.expired_retention;
            ttl.num_milliseconds().max(1)
        })
    }

    async fn fetch(
        &self,
        conn: &mut ConnectionManager,
        token_id: &str,
    ) -> Result<Option<StoredToken>, StorageError> {
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.token_key(token_id))
            .query_async(conn)
            .await?;
        raw.map(|json| serde_json::from_str(&json).map_err(StorageError::from))
            .transpose()
    }

    /// Raw JSON of every indexed record as `(id, json)`. Ids whose key is
    /// gone are returned separately.
    async fn load_raw(
        &self,
        conn: &mut ConnectionManager,
    ) -> Result<(Vec<(String, String)>, Vec<String>), StorageError> {
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.index_key())
            .query_async(conn)
            .await?;

        let mut found = Vec::with_capacity(ids.len());
        let mut dangling = Vec::new();
        for chunk in ids.chunks(MGET_CHUNK) {
            let keys: Vec<String> = chunk.iter().map(|id| self.token_key(id)).collect();
            let values: Vec<Option<String>> =
                redis::cmd("MGET").arg(&keys).query_async(conn).await?;

            for (id, value) in chunk.iter().zip(values) {
                match value {
                    Some(json) => found.push((id.clone(), json)),
                    None => dangling.push(id.clone()),
                }
            }
        }
        Ok((found, dangling))
    }

    async fn load_all(&self, conn: &mut ConnectionManager) -> Result<Vec<StoredToken>, StorageError> {
        let (found, _) = self.load_raw(conn).await?;
        found
            .iter()
            .map(|(_, json)| serde_json::from_str(json).map_err(StorageError::from))
            .collect()
    }

    /// Remove `(id, expected json)` candidates. Redis re-checks each against
    /// the live value, so a record stored after the snapshot survives.
    async fn purge(
        &self,
        conn: &mut ConnectionManager,
        candidates: &[(String, String)],
    ) -> Result<u64, StorageError> {
        let script = Script::new(PURGE_SCRIPT);
        let mut removed = 0u64;
        for chunk in candidates.chunks(MGET_CHUNK) {
            let mut invocation = script.key(self.index_key());
            for (id, expected) in chunk {
                invocation.key(self.token_key(id)).arg(id).arg(expected);
            }
            let purged: u64 = invocation.invoke_async(conn).await?;
            removed += purged;
        }
        Ok(removed)
    }

    fn last_cleanup(&self) -> Option<DateTime<Utc>> {
        match self.last_cleanup_micros.load(Ordering::Acquire) {
            NEVER => None,
            micros => DateTime::from_timestamp_micros(micros),
        }
    }
}

#[async_trait]
impl TokenStorage for RedisTokenStorage {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn store_token(&self, token: &SecureToken) -> Result<(), StorageError> {
        let mut conn = self.connection().await?;
        let now = self.clock.now();
        let record = StoredToken::new(token.clone(), now);
        let json = serde_json::to_string(&record)?;

        let mut set = redis::cmd("SET");
        set.arg(self.token_key(&token.token_id)).arg(json);
        if let Some(ttl) = self.ttl_millis(token, now) {
            set.arg("PX").arg(ttl);
        }

        let _: () = redis::pipe()
            .atomic()
            .add_command(set)
            .ignore()
            .cmd("SADD")
            .arg(self.index_key())
            .arg(&token.token_id)
            .ignore()
            .query_async(&mut conn)
            .await?;

        debug!(token_id = %token.token_id, "Token stored");
        Ok(())
    }

    async fn get_token(&self, token_id: &str) -> Result<Option<SecureToken>, StorageError> {
        let mut conn = self.connection().await?;
        let now = self.clock.now();
        Ok(self
            .fetch(&mut conn, token_id)
            .await?
            .and_then(|record| record.into_valid(now)))
    }

    async fn remove_token(&self, token_id: &str) -> Result<bool, StorageError> {
        let mut conn = self.connection().await?;
        let (deleted, _): (u64, u64) = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(self.token_key(token_id))
            .cmd("SREM")
            .arg(self.index_key())
            .arg(token_id)
            .query_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn revoke_token(&self, token_id: &str) -> Result<bool, StorageError> {
        let mut conn = self.connection().await?;
        let Some(mut record) = self.fetch(&mut conn, token_id).await? else {
            return Ok(false);
        };
        if !record.revoke(self.clock.now()) {
            return Ok(false);
        }

        // XX: do not resurrect a key that expired or was removed meanwhile
        let updated: Option<String> = redis::cmd("SET")
            .arg(self.token_key(token_id))
            .arg(serde_json::to_string(&record)?)
            .arg("XX")
            .arg("KEEPTTL")
            .query_async(&mut conn)
            .await?;
        Ok(updated.is_some())
    }

    async fn list_tokens(
        &self,
        criteria: &TokenListCriteria,
    ) -> Result<Vec<StoredToken>, StorageError> {
        let mut conn = self.connection().await?;
        let records = self.load_all(&mut conn).await?;
        Ok(criteria.apply(records, self.clock.now()))
    }

    async fn cleanup_expired(&self) -> Result<u64, StorageError> {
        let mut conn = self.connection().await?;
        let now = self.clock.now();
        let (found, dangling) = self.load_raw(&mut conn).await?;

        let mut candidates = Vec::new();
        for (id, json) in found {
            let record: StoredToken = serde_json::from_str(&json)?;
            if record.is_expired_at(now) {
                candidates.push((id, json));
            }
        }
        candidates.extend(dangling.into_iter().map(|id| (id, String::new())));

        let removed = self.purge(&mut conn, &candidates).await?;

        self.last_cleanup_micros
            .store(now.timestamp_micros(), Ordering::Release);
        debug!(removed, "Expired tokens purged");
        Ok(removed)
    }

    async fn get_statistics(&self) -> Result<StorageStatistics, StorageError> {
        let mut conn = self.connection().await?;
        let records = self.load_all(&mut conn).await?;
        Ok(StorageStatistics::from_records(
            &records,
            self.clock.now(),
            self.last_cleanup(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, system_clock};
    use crate::core_types::Metadata;

    fn config(url: &str) -> RedisConfig {
        RedisConfig {
            url: url.to_string(),
            key_prefix: "fintx-test".to_string(),
            expired_retention_secs: 3600,
        }
    }

    fn token(expires_at: Option<DateTime<Utc>>) -> SecureToken {
        SecureToken {
            token_id: "abc".to_string(),
            token: "envelope".to_string(),
            created_at: Utc::now(),
            expires_at,
            data_hash: "hash".to_string(),
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn test_key_layout() {
        let storage = RedisTokenStorage::open(&config("redis://127.0.0.1/"), system_clock()).unwrap();
        assert_eq!(storage.token_key("abc"), "fintx-test:token:abc");
        assert_eq!(storage.index_key(), "fintx-test:token-index");
    }

    #[test]
    fn test_ttl_includes_retention() {
        let clock = Arc::new(ManualClock::starting_now());
        let storage = RedisTokenStorage::open(&config("redis://127.0.0.1/"), clock.clone()).unwrap();
        let now = clock.now();

        assert_eq!(storage.ttl_millis(&token(None), now), None);
        assert_eq!(
            storage.ttl_millis(&token(Some(now + chrono::Duration::seconds(60))), now),
            Some(3_660_000)
        );
        // long past retention still yields a positive TTL
        assert_eq!(
            storage.ttl_millis(&token(Some(now - chrono::Duration::days(2))), now),
            Some(1)
        );
    }

    #[test]
    fn test_invalid_url_is_config_error() {
        let err = RedisTokenStorage::open(&config("not a url"), system_clock())
            .err()
            .unwrap();
        assert!(matches!(err, StorageError::Config(_)));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        let storage = RedisTokenStorage::open(&config("redis://127.0.0.1:1/"), system_clock()).unwrap();
        let err = storage.get_token("abc").await.unwrap_err();
        assert!(matches!(err, StorageError::Unavailable(_)), "got {err:?}");
    }

    #[tokio::test]
    #[ignore = "requires Redis (FINTX_TEST_REDIS_URL)"]
    async fn test_purge_skips_record_stored_after_snapshot() {
        let url = std::env::var("FINTX_TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let mut config = config(&url);
        config.key_prefix = format!("fintx-test-{}", uuid::Uuid::new_v4().simple());
        let clock = Arc::new(ManualClock::starting_now());
        let storage = RedisTokenStorage::open(&config, clock.clone()).unwrap();

        storage
            .store_token(&token(Some(clock.now() + chrono::Duration::minutes(1))))
            .await
            .unwrap();
        clock.advance(chrono::Duration::minutes(2));

        let mut conn = storage.connection().await.unwrap();
        let (snapshot, dangling) = storage.load_raw(&mut conn).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(dangling.is_empty());

        // same id stored again with a fresh expiry before the purge runs
        let fresh = token(Some(clock.now() + chrono::Duration::hours(1)));
        storage.store_token(&fresh).await.unwrap();

        assert_eq!(storage.purge(&mut conn, &snapshot).await.unwrap(), 0);
        assert_eq!(storage.get_token("abc").await.unwrap(), Some(fresh.clone()));

        // an eviction marker for a live key keeps its index entry
        let marker = vec![("abc".to_string(), String::new())];
        assert_eq!(storage.purge(&mut conn, &marker).await.unwrap(), 0);
        assert_eq!(storage.list_tokens(&TokenListCriteria::all()).await.unwrap().len(), 1);

        clock.advance(chrono::Duration::hours(2));
        assert_eq!(storage.cleanup_expired().await.unwrap(), 1);
        assert!(storage.list_tokens(&TokenListCriteria::all()).await.unwrap().is_empty());
    }
}
