//! Storage record, list criteria and statistics
//!
//! Shared by every backend so filtering, ordering and counting behave the
//! same regardless of where records live.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core_types::Metadata;
use crate::token::SecureToken;

/// Persisted token plus revocation bookkeeping.
///
/// Lifecycle: created on generation, mutated only by revoke (flag set,
/// never deleted), removed by explicit delete or expiry cleanup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredToken {
    #[serde(flatten)]
    pub token: SecureToken,
    pub is_revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub stored_at: DateTime<Utc>,
}

impl StoredToken {
    pub fn new(token: SecureToken, stored_at: DateTime<Utc>) -> Self {
        Self {
            token,
            is_revoked: false,
            revoked_at: None,
            stored_at,
        }
    }

    #[inline]
    pub fn token_id(&self) -> &str {
        &self.token.token_id
    }

    #[inline]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.token.is_expired_at(now)
    }

    /// Neither revoked nor expired
    #[inline]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_revoked && !self.is_expired_at(now)
    }

    /// Rough byte footprint used for statistics
    pub fn approx_size(&self) -> u64 {
        (self.token.token_id.len() + self.token.token.len() + self.token.data_hash.len()) as u64
    }

    /// Mark revoked. Returns false if it already was.
    pub fn revoke(&mut self, at: DateTime<Utc>) -> bool {
        if self.is_revoked {
            return false;
        }
        self.is_revoked = true;
        self.revoked_at = Some(at);
        true
    }

    /// The token if it is still valid at `now`
    pub fn into_valid(self, now: DateTime<Utc>) -> Option<SecureToken> {
        if self.is_valid_at(now) {
            Some(self.token)
        } else {
            None
        }
    }
}

/// Filter for `TokenStorage::list_tokens`.
///
/// Windows are half-open: `*_after` is inclusive, `*_before` exclusive.
/// Tokens without an expiry never match an expiry window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenListCriteria {
    pub include_revoked: bool,
    pub include_expired: bool,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub expires_after: Option<DateTime<Utc>>,
    pub expires_before: Option<DateTime<Utc>>,
    /// Every entry must be present with an equal value in the token metadata
    pub metadata: Metadata,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl TokenListCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    /// Include revoked and expired records
    pub fn all() -> Self {
        Self {
            include_revoked: true,
            include_expired: true,
            ..Self::default()
        }
    }

    pub fn include_revoked(mut self, include: bool) -> Self {
        self.include_revoked = include;
        self
    }

    pub fn include_expired(mut self, include: bool) -> Self {
        self.include_expired = include;
        self
    }

    pub fn created_between(
        mut self,
        after: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
    ) -> Self {
        self.created_after = after;
        self.created_before = before;
        self
    }

    pub fn expires_between(
        mut self,
        after: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
    ) -> Self {
        self.expires_after = after;
        self.expires_before = before;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    /// True when a backend may apply offset and limit itself.
    ///
    /// Metadata equality is checked in process, so with a metadata filter
    /// the backend returns every candidate and [`apply`](Self::apply) pages.
    pub fn pages_in_backend(&self) -> bool {
        self.metadata.is_empty()
    }

    /// Check a single record against every filter (pagination excluded)
    pub fn matches(&self, record: &StoredToken, now: DateTime<Utc>) -> bool {
        if record.is_revoked && !self.include_revoked {
            return false;
        }
        if record.is_expired_at(now) && !self.include_expired {
            return false;
        }

        let created_at = record.token.created_at;
        if self.created_after.is_some_and(|t| created_at < t) {
            return false;
        }
        if self.created_before.is_some_and(|t| created_at >= t) {
            return false;
        }

        if self.expires_after.is_some() || self.expires_before.is_some() {
            let Some(expires_at) = record.token.expires_at else {
                return false;
            };
            if self.expires_after.is_some_and(|t| expires_at < t) {
                return false;
            }
            if self.expires_before.is_some_and(|t| expires_at >= t) {
                return false;
            }
        }

        self.metadata
            .iter()
            .all(|(key, value)| record.token.metadata.get(key) == Some(value))
    }

    /// Filter, order by (created_at, token_id) and paginate
    pub fn apply(&self, records: Vec<StoredToken>, now: DateTime<Utc>) -> Vec<StoredToken> {
        let mut matched: Vec<StoredToken> = records
            .into_iter()
            .filter(|r| self.matches(r, now))
            .collect();

        matched.sort_by(|a, b| {
            a.token
                .created_at
                .cmp(&b.token.created_at)
                .then_with(|| a.token.token_id.cmp(&b.token.token_id))
        });

        let limit = self.limit.unwrap_or(usize::MAX);
        matched.into_iter().skip(self.offset).take(limit).collect()
    }
}

/// Snapshot of a backend's contents.
///
/// `total = valid + expired + revoked`; a revoked token counts as revoked
/// whether or not it has also expired.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStatistics {
    pub total_tokens: u64,
    pub valid_tokens: u64,
    pub expired_tokens: u64,
    pub revoked_tokens: u64,
    pub approx_size_bytes: u64,
    pub last_cleanup: Option<DateTime<Utc>>,
}

impl StorageStatistics {
    /// Count records in memory
    pub fn from_records<'a>(
        records: impl IntoIterator<Item = &'a StoredToken>,
        now: DateTime<Utc>,
        last_cleanup: Option<DateTime<Utc>>,
    ) -> Self {
        let mut stats = Self {
            last_cleanup,
            ..Self::default()
        };
        for record in records {
            stats.total_tokens += 1;
            stats.approx_size_bytes += record.approx_size();
            if record.is_revoked {
                stats.revoked_tokens += 1;
            } else if record.is_expired_at(now) {
                stats.expired_tokens += 1;
            } else {
                stats.valid_tokens += 1;
            }
        }
        stats
    }
}
