//! Transaction lifecycle events
//!
//! The pipeline publishes through [`EventPublisher`] and never lets a
//! publish failure change a transaction's outcome.
//!
//! | Publisher                   | Delivery                              |
//! |-----------------------------|---------------------------------------|
//! | [`NoopEventPublisher`]      | dropped                               |
//! | [`TracingEventPublisher`]   | one structured log line per event     |
//! | [`ChannelEventPublisher`]   | tokio mpsc, for in-process consumers  |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::cancel::CancelSignal;
use crate::core_types::{CorrelationId, Metadata, TransactionId};
use crate::transaction::TransactionAuditInfo;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("Event channel closed")]
    Closed,

    #[error("Publish cancelled")]
    Cancelled,

    #[error("Event transport error: {0}")]
    Transport(String),
}

/// Fields carried by every event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventHeader {
    pub event_id: Uuid,
    pub transaction_id: TransactionId,
    pub correlation_id: CorrelationId,
    pub transaction_type: String,
    pub application_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl EventHeader {
    pub fn new(
        transaction_id: TransactionId,
        correlation_id: CorrelationId,
        transaction_type: impl Into<String>,
        application_id: Option<String>,
        timestamp: DateTime<Utc>,
        metadata: Metadata,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            transaction_id,
            correlation_id,
            transaction_type: transaction_type.into(),
            application_id,
            timestamp,
            metadata,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionEvent {
    Started {
        #[serde(flatten)]
        header: EventHeader,
    },
    Completed {
        #[serde(flatten)]
        header: EventHeader,
        duration_ms: u64,
        token_id: Option<String>,
    },
    Error {
        #[serde(flatten)]
        header: EventHeader,
        error_code: String,
        message: String,
    },
    Audit {
        #[serde(flatten)]
        header: EventHeader,
        audit: TransactionAuditInfo,
    },
}

impl TransactionEvent {
    pub fn header(&self) -> &EventHeader {
        match self {
            TransactionEvent::Started { header }
            | TransactionEvent::Completed { header, .. }
            | TransactionEvent::Error { header, .. }
            | TransactionEvent::Audit { header, .. } => header,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TransactionEvent::Started { .. } => "STARTED",
            TransactionEvent::Completed { .. } => "COMPLETED",
            TransactionEvent::Error { .. } => "ERROR",
            TransactionEvent::Audit { .. } => "AUDIT",
        }
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        event: &TransactionEvent,
        cancel: &CancelSignal,
    ) -> Result<(), PublishError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _: &TransactionEvent, _: &CancelSignal) -> Result<(), PublishError> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventPublisher;

#[async_trait]
impl EventPublisher for TracingEventPublisher {
    async fn publish(
        &self,
        event: &TransactionEvent,
        _: &CancelSignal,
    ) -> Result<(), PublishError> {
        let header = event.header();
        info!(
            kind = event.kind(),
            event_id = %header.event_id,
            transaction_id = %header.transaction_id,
            correlation_id = %header.correlation_id,
            transaction_type = %header.transaction_type,
            "Transaction event"
        );
        Ok(())
    }
}

/// Bounded channel publisher. Waits for capacity unless cancelled.
#[derive(Debug, Clone)]
pub struct ChannelEventPublisher {
    tx: mpsc::Sender<TransactionEvent>,
}

impl ChannelEventPublisher {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TransactionEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventPublisher for ChannelEventPublisher {
    async fn publish(
        &self,
        event: &TransactionEvent,
        cancel: &CancelSignal,
    ) -> Result<(), PublishError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PublishError::Cancelled),
            sent = self.tx.send(event.clone()) => sent.map_err(|_| PublishError::Closed),
        }
    }
}
