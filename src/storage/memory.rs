//! In-memory token storage
//!
//! Lock-free concurrent map (DashMap) plus a background cleanup task owned
//! by the storage instance: started on construction, stopped by
//! [`InMemoryTokenStorage::shutdown`] or drop. The task holds only a weak
//! reference, so it never keeps the map alive.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::error::StorageError;
use super::record::{StorageStatistics, StoredToken, TokenListCriteria};
use super::TokenStorage;
use crate::clock::Clock;
use crate::core_types::TokenId;
use crate::token::SecureToken;

/// Sentinel for "cleanup never ran"
const NEVER: i64 = i64::MIN;

struct MemoryInner {
    tokens: DashMap<TokenId, StoredToken>,
    clock: Arc<dyn Clock>,
    last_cleanup_micros: AtomicI64,
}

impl MemoryInner {
    fn cleanup(&self) -> u64 {
        let now = self.clock.now();
        let mut removed = 0u64;
        self.tokens.retain(|_, record| {
            let keep = !record.is_expired_at(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        self.last_cleanup_micros
            .store(now.timestamp_micros(), Ordering::Release);
        removed
    }

    fn last_cleanup(&self) -> Option<DateTime<Utc>> {
        match self.last_cleanup_micros.load(Ordering::Acquire) {
            NEVER => None,
            micros => DateTime::from_timestamp_micros(micros),
        }
    }
}

pub struct InMemoryTokenStorage {
    inner: Arc<MemoryInner>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl InMemoryTokenStorage {
    /// Create storage without a background cleanup task
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                tokens: DashMap::new(),
                clock,
                last_cleanup_micros: AtomicI64::new(NEVER),
            }),
            cleanup_task: Mutex::new(None),
        }
    }

    /// Create storage and start its periodic cleanup task.
    ///
    /// The task needs a tokio runtime; outside one, the storage works
    /// but only purges when `cleanup_expired` is called explicitly.
    pub fn with_cleanup_interval(clock: Arc<dyn Clock>, interval: Duration) -> Self {
        let storage = Self::new(clock);
        storage.start_cleanup(interval);
        storage
    }

    /// Start the cleanup task. Returns false if already running or no runtime.
    pub fn start_cleanup(&self, interval: Duration) -> bool {
        if interval.is_zero() {
            warn!("Cleanup interval is zero, background cleanup disabled");
            return false;
        }

        let mut task = self
            .cleanup_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if task.is_some() {
            return false;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime, background cleanup disabled");
            return false;
        };

        let weak = Arc::downgrade(&self.inner);
        *task = Some(handle.spawn(cleanup_loop(weak, interval)));
        info!(interval_ms = interval.as_millis() as u64, "In-memory token cleanup started");
        true
    }

    /// Stop the cleanup task
    pub fn shutdown(&self) {
        let mut task = self
            .cleanup_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handle) = task.take() {
            handle.abort();
            debug!("In-memory token cleanup stopped");
        }
    }

    pub fn is_cleanup_running(&self) -> bool {
        self.cleanup_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Number of records held, including revoked and expired ones
    pub fn len(&self) -> usize {
        self.inner.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.tokens.is_empty()
    }
}

impl Drop for InMemoryTokenStorage {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn cleanup_loop(weak: Weak<MemoryInner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        let removed = inner.cleanup();
        if removed > 0 {
            debug!(removed, "Purged expired tokens");
        }
    }
}

#[async_trait]
impl TokenStorage for InMemoryTokenStorage {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn store_token(&self, token: &SecureToken) -> Result<(), StorageError> {
        let record = StoredToken::new(token.clone(), self.inner.clock.now());
        self.inner.tokens.insert(token.token_id.clone(), record);
        Ok(())
    }

    async fn get_token(&self, token_id: &str) -> Result<Option<SecureToken>, StorageError> {
        let now = self.inner.clock.now();
        Ok(self
            .inner
            .tokens
            .get(token_id)
            .and_then(|record| record.clone().into_valid(now)))
    }

    async fn remove_token(&self, token_id: &str) -> Result<bool, StorageError> {
        Ok(self.inner.tokens.remove(token_id).is_some())
    }

    async fn revoke_token(&self, token_id: &str) -> Result<bool, StorageError> {
        let now = self.inner.clock.now();
        Ok(match self.inner.tokens.get_mut(token_id) {
            Some(mut record) => record.revoke(now),
            None => false,
        })
    }

    async fn list_tokens(
        &self,
        criteria: &TokenListCriteria,
    ) -> Result<Vec<StoredToken>, StorageError> {
        let now = self.inner.clock.now();
        let candidates: Vec<StoredToken> = self
            .inner
            .tokens
            .iter()
            .filter(|entry| criteria.matches(entry.value(), now))
            .map(|entry| entry.value().clone())
            .collect();
        Ok(criteria.apply(candidates, now))
    }

    async fn cleanup_expired(&self) -> Result<u64, StorageError> {
        Ok(self.inner.cleanup())
    }

    async fn get_statistics(&self) -> Result<StorageStatistics, StorageError> {
        let now = self.inner.clock.now();
        let records: Vec<StoredToken> = self
            .inner
            .tokens
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        Ok(StorageStatistics::from_records(
            &records,
            now,
            self.inner.last_cleanup(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::core_types::Metadata;
    use chrono::Duration as ChronoDuration;

    fn token(id: &str, created_at: DateTime<Utc>, ttl: Option<ChronoDuration>) -> SecureToken {
        SecureToken {
            token_id: id.to_string(),
            token: format!("envelope-{id}"),
            created_at,
            expires_at: ttl.map(|ttl| created_at + ttl),
            data_hash: "hash".to_string(),
            metadata: Metadata::new(),
        }
    }

    #[tokio::test]
    async fn test_store_get_remove() {
        let clock = Arc::new(ManualClock::starting_now());
        let storage = InMemoryTokenStorage::new(clock.clone());
        let t = token("a", clock.now(), Some(ChronoDuration::hours(1)));

        storage.store_token(&t).await.unwrap();
        assert_eq!(storage.get_token("a").await.unwrap(), Some(t));
        assert!(storage.exists("a").await.unwrap());

        assert!(storage.remove_token("a").await.unwrap());
        assert!(!storage.remove_token("a").await.unwrap());
        assert!(storage.get_token("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_hidden_before_purge() {
        let clock = Arc::new(ManualClock::starting_now());
        let storage = InMemoryTokenStorage::new(clock.clone());
        storage
            .store_token(&token("a", clock.now(), Some(ChronoDuration::hours(1))))
            .await
            .unwrap();

        clock.advance(ChronoDuration::hours(2));
        assert!(storage.get_token("a").await.unwrap().is_none());
        assert!(!storage.exists("a").await.unwrap());
        assert_eq!(storage.len(), 1, "record still physically present");
    }

    #[tokio::test]
    async fn test_revoke_keeps_record() {
        let clock = Arc::new(ManualClock::starting_now());
        let storage = InMemoryTokenStorage::new(clock.clone());
        storage.store_token(&token("a", clock.now(), None)).await.unwrap();

        assert!(storage.revoke_token("a").await.unwrap());
        assert!(!storage.revoke_token("a").await.unwrap());
        assert!(!storage.revoke_token("missing").await.unwrap());
        assert!(storage.get_token("a").await.unwrap().is_none());

        let all = storage.list_tokens(&TokenListCriteria::all()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].is_revoked);
        assert_eq!(all[0].revoked_at, Some(clock.now()));
    }

    #[tokio::test]
    async fn test_background_cleanup_purges() {
        let clock = Arc::new(ManualClock::starting_now());
        let storage =
            InMemoryTokenStorage::with_cleanup_interval(clock.clone(), Duration::from_millis(20));
        assert!(storage.is_cleanup_running());

        storage
            .store_token(&token("a", clock.now(), Some(ChronoDuration::seconds(1))))
            .await
            .unwrap();
        storage.store_token(&token("b", clock.now(), None)).await.unwrap();
        clock.advance(ChronoDuration::seconds(5));

        for _ in 0..100 {
            if storage.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(storage.len(), 1);
        assert!(storage.get_statistics().await.unwrap().last_cleanup.is_some());

        storage.shutdown();
        assert!(!storage.is_cleanup_running());
    }

    #[tokio::test]
    async fn test_start_cleanup_twice() {
        let storage = InMemoryTokenStorage::new(crate::clock::system_clock());
        assert!(storage.start_cleanup(Duration::from_secs(60)));
        assert!(!storage.start_cleanup(Duration::from_secs(60)));
        assert!(!storage.start_cleanup(Duration::ZERO));
    }

    #[test]
    fn test_without_runtime_no_task() {
        let storage = InMemoryTokenStorage::with_cleanup_interval(
            crate::clock::system_clock(),
            Duration::from_secs(1),
        );
        assert!(!storage.is_cleanup_running());
    }

    #[tokio::test]
    async fn test_concurrent_writers() {
        let storage = Arc::new(InMemoryTokenStorage::new(crate::clock::system_clock()));
        let mut handles = vec![];
        for i in 0..16 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                for j in 0..50 {
                    let id = format!("t-{i}-{j}");
                    storage.store_token(&token(&id, Utc::now(), None)).await.unwrap();
                    if j % 2 == 0 {
                        storage.revoke_token(&id).await.unwrap();
                    }
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let stats = storage.get_statistics().await.unwrap();
        assert_eq!(stats.total_tokens, 800);
        assert_eq!(stats.revoked_tokens, 400);
        assert_eq!(stats.valid_tokens, 400);
    }
}
