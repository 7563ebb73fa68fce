//! Transaction value type
//!
//! A [`Transaction`] is immutable once built. Every derived operation
//! (`with_metadata`, `map_payload`, `duplicate`) consumes or borrows the
//! original and returns a new value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::core_types::{CorrelationId, Metadata, TransactionId};

/// Timeout applied when the builder is not given one
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction<P> {
    id: TransactionId,
    correlation_id: CorrelationId,
    transaction_type: String,
    created_at: DateTime<Utc>,
    timeout: Duration,
    requires_authentication: bool,
    required_permissions: BTreeSet<String>,
    #[serde(default)]
    metadata: Metadata,
    payload: P,
}

impl<P> Transaction<P> {
    pub fn builder(transaction_type: impl Into<String>, payload: P) -> TransactionBuilder<P> {
        TransactionBuilder::new(transaction_type, payload)
    }

    #[inline]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    #[inline]
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    #[inline]
    pub fn transaction_type(&self) -> &str {
        &self.transaction_type
    }

    #[inline]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[inline]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[inline]
    pub fn requires_authentication(&self) -> bool {
        self.requires_authentication
    }

    pub fn required_permissions(&self) -> &BTreeSet<String> {
        &self.required_permissions
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn into_payload(self) -> P {
        self.payload
    }

    /// Time since creation; zero if `now` is before `created_at`
    pub fn elapsed_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Elapsed time strictly exceeds the timeout
    pub fn is_timed_out_at(&self, now: DateTime<Utc>) -> bool {
        self.elapsed_at(now) > self.timeout
    }

    /// Copy with one metadata entry added or replaced
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Same identity and settings around a transformed payload
    pub fn map_payload<Q>(self, f: impl FnOnce(P) -> Q) -> Transaction<Q> {
        Transaction {
            id: self.id,
            correlation_id: self.correlation_id,
            transaction_type: self.transaction_type,
            created_at: self.created_at,
            timeout: self.timeout,
            requires_authentication: self.requires_authentication,
            required_permissions: self.required_permissions,
            metadata: self.metadata,
            payload: f(self.payload),
        }
    }

    /// Retry copy: fresh id, same correlation id and payload.
    ///
    /// `created_at` is never earlier than the original's.
    pub fn duplicate_at(&self, now: DateTime<Utc>) -> Self
    where
        P: Clone,
    {
        Self {
            id: TransactionId::new(),
            created_at: now.max(self.created_at),
            ..self.clone()
        }
    }

    pub fn duplicate(&self) -> Self
    where
        P: Clone,
    {
        self.duplicate_at(Utc::now())
    }
}

pub struct TransactionBuilder<P> {
    transaction_type: String,
    payload: P,
    correlation_id: Option<CorrelationId>,
    created_at: Option<DateTime<Utc>>,
    timeout: Duration,
    requires_authentication: bool,
    required_permissions: BTreeSet<String>,
    metadata: Metadata,
}

impl<P> TransactionBuilder<P> {
    pub fn new(transaction_type: impl Into<String>, payload: P) -> Self {
        Self {
            transaction_type: transaction_type.into(),
            payload,
            correlation_id: None,
            created_at: None,
            timeout: DEFAULT_TIMEOUT,
            requires_authentication: false,
            required_permissions: BTreeSet::new(),
            metadata: Metadata::new(),
        }
    }

    /// Join an existing correlation group instead of starting a new one
    pub fn correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Defaults to `Utc::now()` at build time
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn requires_authentication(mut self, required: bool) -> Self {
        self.requires_authentication = required;
        self
    }

    pub fn permission(mut self, permission: impl Into<String>) -> Self {
        self.required_permissions.insert(permission.into());
        self
    }

    pub fn permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_permissions
            .extend(permissions.into_iter().map(Into::into));
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn build(self) -> Transaction<P> {
        Transaction {
            id: TransactionId::new(),
            correlation_id: self.correlation_id.unwrap_or_default(),
            transaction_type: self.transaction_type,
            created_at: self.created_at.unwrap_or_else(Utc::now),
            timeout: self.timeout,
            requires_authentication: self.requires_authentication,
            required_permissions: self.required_permissions,
            metadata: self.metadata,
            payload: self.payload,
        }
    }
}
