//! MongoDB token storage
//!
//! One document per token in a configurable collection:
//!
//! ```text
//! { tokenId, token, dataHash, createdAt, expiresAt?, metadata?,
//!   isRevoked, revokedAt?, storedAt }
//! ```
//!
//! Indexes (unique `tokenId`, `expiresAt`, `createdAt`, `isRevoked`) are
//! created once per instance on first use; `createIndexes` is a no-op
//! server-side when they already exist.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{self, Bson, Document, doc};
use mongodb::options::{FindOptions, IndexOptions, ReplaceOptions};
use mongodb::{Client, Collection, IndexModel};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::TokenStorage;
use super::error::StorageError;
use super::record::{StorageStatistics, StoredToken, TokenListCriteria};
use crate::clock::Clock;
use crate::config::MongoConfig;
use crate::core_types::Metadata;
use crate::token::SecureToken;

const NEVER: i64 = i64::MIN;

pub struct MongoTokenStorage {
    collection: Collection<Document>,
    clock: Arc<dyn Clock>,
    indexes: OnceCell<()>,
    last_cleanup_micros: AtomicI64,
}

impl MongoTokenStorage {
    /// Parse the URI and build a client. No server round-trip happens here.
    pub async fn connect(config: &MongoConfig, clock: Arc<dyn Clock>) -> Result<Self, StorageError> {
        let client = Client::with_uri_str(&config.uri).await?;
        let collection = client
            .database(&config.database)
            .collection::<Document>(&config.collection);
        Ok(Self::from_collection(collection, clock))
    }

    pub fn from_collection(collection: Collection<Document>, clock: Arc<dyn Clock>) -> Self {
        Self {
            collection,
            clock,
            indexes: OnceCell::new(),
            last_cleanup_micros: AtomicI64::new(NEVER),
        }
    }

    async fn ensure_indexes(&self) -> Result<(), StorageError> {
        self.indexes
            .get_or_try_init(|| async {
                let models = vec![
                    IndexModel::builder()
                        .keys(doc! { "tokenId": 1 })
                        .options(
                            IndexOptions::builder()
                                .unique(true)
                                .name("ux_token_id".to_string())
                                .build(),
                        )
                        .build(),
                    IndexModel::builder().keys(doc! { "expiresAt": 1 }).build(),
                    IndexModel::builder().keys(doc! { "createdAt": 1 }).build(),
                    IndexModel::builder().keys(doc! { "isRevoked": 1 }).build(),
                ];
                self.collection.create_indexes(models, None).await?;
                info!(collection = %self.collection.name(), "MongoDB token indexes ready");
                Ok::<(), StorageError>(())
            })
            .await?;
        Ok(())
    }

    async fn fetch(&self, token_id: &str) -> Result<Option<StoredToken>, StorageError> {
        self.ensure_indexes().await?;
        let found = self
            .collection
            .find_one(doc! { "tokenId": token_id }, None)
            .await?;
        found.map(document_to_record).transpose()
    }

    async fn count(&self, filter: Document) -> Result<u64, StorageError> {
        Ok(self.collection.count_documents(filter, None).await?)
    }
}

#[inline]
fn to_bson_time(at: DateTime<Utc>) -> bson::DateTime {
    bson::DateTime::from_millis(at.timestamp_millis())
}

fn from_bson_time(at: bson::DateTime) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_millis(at.timestamp_millis())
        .ok_or_else(|| StorageError::Serialization("timestamp out of range".to_string()))
}

fn optional_time(at: Option<DateTime<Utc>>) -> Bson {
    at.map(|t| Bson::DateTime(to_bson_time(t)))
        .unwrap_or(Bson::Null)
}

fn record_to_document(record: &StoredToken) -> Result<Document, StorageError> {
    let token = &record.token;
    let metadata = if token.metadata.is_empty() {
        Bson::Null
    } else {
        bson::to_bson(&token.metadata).map_err(|e| StorageError::Serialization(e.to_string()))?
    };

    Ok(doc! {
        "tokenId": &token.token_id,
        "token": &token.token,
        "dataHash": &token.data_hash,
        "createdAt": to_bson_time(token.created_at),
        "expiresAt": optional_time(token.expires_at),
        "metadata": metadata,
        "isRevoked": record.is_revoked,
        "revokedAt": optional_time(record.revoked_at),
        "storedAt": to_bson_time(record.stored_at),
    })
}

fn get_optional_time(document: &Document, key: &str) -> Result<Option<DateTime<Utc>>, StorageError> {
    match document.get(key) {
        None | Some(Bson::Null) => Ok(None),
        Some(Bson::DateTime(at)) => from_bson_time(*at).map(Some),
        Some(other) => Err(StorageError::Serialization(format!(
            "field {key} has unexpected type {:?}",
            other.element_type()
        ))),
    }
}

fn get_required_time(document: &Document, key: &str) -> Result<DateTime<Utc>, StorageError> {
    get_optional_time(document, key)?
        .ok_or_else(|| StorageError::Serialization(format!("missing field {key}")))
}

fn get_string(document: &Document, key: &str) -> Result<String, StorageError> {
    document
        .get_str(key)
        .map(str::to_string)
        .map_err(|e| StorageError::Serialization(format!("field {key}: {e}")))
}

fn document_to_record(document: Document) -> Result<StoredToken, StorageError> {
    let metadata: Metadata = match document.get("metadata") {
        None | Some(Bson::Null) => Metadata::new(),
        Some(value) => bson::from_bson(value.clone())
            .map_err(|e| StorageError::Serialization(e.to_string()))?,
    };

    Ok(StoredToken {
        token: SecureToken {
            token_id: get_string(&document, "tokenId")?,
            token: get_string(&document, "token")?,
            created_at: get_required_time(&document, "createdAt")?,
            expires_at: get_optional_time(&document, "expiresAt")?,
            data_hash: get_string(&document, "dataHash")?,
            metadata,
        },
        is_revoked: document.get_bool("isRevoked").unwrap_or(false),
        revoked_at: get_optional_time(&document, "revokedAt")?,
        stored_at: get_required_time(&document, "storedAt")?,
    })
}

/// Server-side filter: visibility, created/expiry windows and scalar
/// metadata entries.
///
/// Object and array metadata values are left to `criteria.apply`, since
/// embedded-document equality in MongoDB depends on field order.
fn list_filter(criteria: &TokenListCriteria, now: DateTime<Utc>) -> Result<Document, StorageError> {
    let mut filter = Document::new();
    if !criteria.include_revoked {
        filter.insert("isRevoked", false);
    }
    if !criteria.include_expired {
        filter.insert(
            "$or",
            vec![
                doc! { "expiresAt": Bson::Null },
                doc! { "expiresAt": { "$gt": to_bson_time(now) } },
            ],
        );
    }
    if let Some(window) = time_window(criteria.created_after, criteria.created_before) {
        filter.insert("createdAt", window);
    }
    // range operators never match a null expiresAt
    if let Some(window) = time_window(criteria.expires_after, criteria.expires_before) {
        filter.insert("expiresAt", window);
    }
    for (key, value) in &criteria.metadata {
        if value.is_object() || value.is_array() || key.contains('.') || key.starts_with('$') {
            continue;
        }
        let value = bson::to_bson(value).map_err(|e| StorageError::Serialization(e.to_string()))?;
        filter.insert(format!("metadata.{key}"), value);
    }
    Ok(filter)
}

fn time_window(after: Option<DateTime<Utc>>, before: Option<DateTime<Utc>>) -> Option<Document> {
    let mut window = Document::new();
    if let Some(after) = after {
        window.insert("$gte", to_bson_time(after));
    }
    if let Some(before) = before {
        window.insert("$lt", to_bson_time(before));
    }
    (!window.is_empty()).then_some(window)
}

fn list_options(criteria: &TokenListCriteria) -> FindOptions {
    let mut options = FindOptions::builder()
        .sort(doc! { "createdAt": 1, "tokenId": 1 })
        .build();
    if criteria.pages_in_backend() {
        options.skip = (criteria.offset > 0).then_some(criteria.offset as u64);
        options.limit = criteria.limit.map(|limit| i64::try_from(limit).unwrap_or(i64::MAX));
    }
    options
}

fn bson_to_u64(value: Option<&Bson>) -> u64 {
    match value {
        Some(Bson::Int32(v)) => (*v).max(0) as u64,
        Some(Bson::Int64(v)) => (*v).max(0) as u64,
        Some(Bson::Double(v)) => v.max(0.0) as u64,
        _ => 0,
    }
}

#[async_trait]
impl TokenStorage for MongoTokenStorage {
    fn backend_name(&self) -> &'static str {
        "mongodb"
    }

    async fn store_token(&self, token: &SecureToken) -> Result<(), StorageError> {
        self.ensure_indexes().await?;
        let record = StoredToken::new(token.clone(), self.clock.now());
        let document = record_to_document(&record)?;

        let options = ReplaceOptions::builder().upsert(true).build();
        self.collection
            .replace_one(doc! { "tokenId": &token.token_id }, document, options)
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
        self.ensure_indexes().await?;
        let result = self
            .collection
            .delete_one(doc! { "tokenId": token_id }, None)
            .await?;
        Ok(result.deleted_count > 0)
    }

    async fn revoke_token(&self, token_id: &str) -> Result<bool, StorageError> {
        self.ensure_indexes().await?;
        let now = to_bson_time(self.clock.now());
        let result = self
            .collection
            .update_one(
                doc! { "tokenId": token_id, "isRevoked": false },
                doc! { "$set": { "isRevoked": true, "revokedAt": now } },
                None,
            )
            .await?;
        Ok(result.modified_count > 0)
    }

    async fn list_tokens(
        &self,
        criteria: &TokenListCriteria,
    ) -> Result<Vec<StoredToken>, StorageError> {
        self.ensure_indexes().await?;
        let now = self.clock.now();
        let documents: Vec<Document> = self
            .collection
            .find(list_filter(criteria, now)?, list_options(criteria))
            .await?
            .try_collect()
            .await?;

        let records = documents
            .into_iter()
            .map(document_to_record)
            .collect::<Result<Vec<_>, _>>()?;
        if criteria.pages_in_backend() {
            return Ok(records);
        }
        Ok(criteria.apply(records, now))
    }

    async fn cleanup_expired(&self) -> Result<u64, StorageError> {
        self.ensure_indexes().await?;
        let now = self.clock.now();
        let result = self
            .collection
            .delete_many(doc! { "expiresAt": { "$lte": to_bson_time(now) } }, None)
            .await?;

        self.last_cleanup_micros
            .store(now.timestamp_micros(), Ordering::Release);
        Ok(result.deleted_count)
    }

    async fn get_statistics(&self) -> Result<StorageStatistics, StorageError> {
        self.ensure_indexes().await?;
        let now = to_bson_time(self.clock.now());

        let total = self.count(doc! {}).await?;
        let revoked = self.count(doc! { "isRevoked": true }).await?;
        let expired = self
            .count(doc! { "isRevoked": false, "expiresAt": { "$lte": now } })
            .await?;

        let pipeline = vec![doc! {
            "$group": {
                "_id": Bson::Null,
                "size": { "$sum": { "$add": [
                    { "$strLenBytes": "$tokenId" },
                    { "$strLenBytes": "$token" },
                    { "$strLenBytes": "$dataHash" },
                ] } },
            }
        }];
        let groups: Vec<Document> = self
            .collection
            .aggregate(pipeline, None)
            .await?
            .try_collect()
            .await?;
        let approx_size_bytes = bson_to_u64(groups.first().and_then(|d| d.get("size")));

        let last_cleanup = match self.last_cleanup_micros.load(Ordering::Acquire) {
            NEVER => None,
            micros => DateTime::<Utc>::from_timestamp_micros(micros),
        };

        Ok(StorageStatistics {
            total_tokens: total,
            valid_tokens: total.saturating_sub(revoked + expired),
            expired_tokens: expired,
            revoked_tokens: revoked,
            approx_size_bytes,
            last_cleanup,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn record() -> StoredToken {
        let now = crate::clock::to_millis_precision(Utc::now());
        let mut metadata = Metadata::new();
        metadata.insert("channel".into(), json!("mobile"));
        metadata.insert("amount".into(), json!(500));
        StoredToken::new(
            SecureToken {
                token_id: "tok-1".to_string(),
                token: "ZW52ZWxvcGU=".to_string(),
                created_at: now,
                expires_at: Some(now + Duration::hours(1)),
                data_hash: "hash".to_string(),
                metadata,
            },
            now,
        )
    }

    #[test]
    fn test_document_roundtrip() {
        let mut original = record();
        original.revoke(original.stored_at);
        let document = record_to_document(&original).unwrap();
        assert_eq!(document.get_str("tokenId").unwrap(), "tok-1");
        assert!(document.get_bool("isRevoked").unwrap());

        let decoded = document_to_record(document).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_empty_metadata_and_expiry_are_null() {
        let mut r = record();
        r.token.metadata.clear();
        r.token.expires_at = None;
        let document = record_to_document(&r).unwrap();
        assert_eq!(document.get("metadata"), Some(&Bson::Null));
        assert_eq!(document.get("expiresAt"), Some(&Bson::Null));
        assert_eq!(document_to_record(document).unwrap(), r);
    }

    #[test]
    fn test_document_missing_field() {
        let document = doc! { "tokenId": "x" };
        assert!(matches!(
            document_to_record(document),
            Err(StorageError::Serialization(_))
        ));
    }

    #[test]
    fn test_list_filter() {
        let now = Utc::now();
        assert!(list_filter(&TokenListCriteria::all(), now).unwrap().is_empty());

        let filter = list_filter(&TokenListCriteria::new(), now).unwrap();
        assert_eq!(filter.get_bool("isRevoked").unwrap(), false);
        assert!(filter.contains_key("$or"));

        let windowed = TokenListCriteria::all()
            .created_between(Some(now), Some(now + Duration::minutes(5)))
            .expires_between(None, Some(now));
        let filter = list_filter(&windowed, now).unwrap();
        let created = filter.get_document("createdAt").unwrap();
        assert!(created.contains_key("$gte") && created.contains_key("$lt"));
        let expires = filter.get_document("expiresAt").unwrap();
        assert_eq!(expires.keys().collect::<Vec<_>>(), vec!["$lt"]);
    }

    #[test]
    fn test_list_filter_pushes_only_scalar_metadata() {
        let criteria = TokenListCriteria::all()
            .with_metadata("channel", json!("mobile"))
            .with_metadata("limits", json!({"daily": 100}));
        let filter = list_filter(&criteria, Utc::now()).unwrap();
        assert_eq!(filter.get_str("metadata.channel").unwrap(), "mobile");
        assert!(!filter.contains_key("metadata.limits"));
    }

    #[test]
    fn test_list_options_paging() {
        let options = list_options(&TokenListCriteria::new().page(20, 10));
        assert_eq!(options.skip, Some(20));
        assert_eq!(options.limit, Some(10));

        let by_channel = TokenListCriteria::new()
            .with_metadata("channel", json!("mobile"))
            .page(20, 10);
        let options = list_options(&by_channel);
        assert_eq!(options.skip, None);
        assert_eq!(options.limit, None);
        assert!(options.sort.is_some());
    }

    #[test]
    fn test_bson_to_u64() {
        assert_eq!(bson_to_u64(Some(&Bson::Int32(7))), 7);
        assert_eq!(bson_to_u64(Some(&Bson::Int64(9))), 9);
        assert_eq!(bson_to_u64(Some(&Bson::Int32(-1))), 0);
        assert_eq!(bson_to_u64(None), 0);
    }
}
