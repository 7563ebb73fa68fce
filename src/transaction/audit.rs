//! Transaction audit records
//!
//! Each phase produces a new [`TransactionAuditInfo`]; earlier records are
//! never edited. Records are logged on the `audit` tracing target and
//! published as `Audit` events by the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

use super::context::TransactionContext;
use super::state::TransactionState;
use super::types::Transaction;
use crate::core_types::{CorrelationId, Metadata, TransactionId};
use crate::logging::AUDIT_TARGET;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditPhase {
    Started,
    Completed,
    Failed,
    Compensated,
}

impl AuditPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditPhase::Started => "STARTED",
            AuditPhase::Completed => "COMPLETED",
            AuditPhase::Failed => "FAILED",
            AuditPhase::Compensated => "COMPENSATED",
        }
    }
}

impl fmt::Display for AuditPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionAuditInfo {
    pub transaction_id: TransactionId,
    pub correlation_id: CorrelationId,
    pub transaction_type: String,
    pub phase: AuditPhase,
    pub state: TransactionState,
    pub application_id: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub environment: String,
    pub recorded_at: DateTime<Utc>,
    pub success: Option<bool>,
    pub error_code: Option<String>,
    pub duration_ms: Option<u64>,
    pub metadata: Metadata,
}

impl TransactionAuditInfo {
    pub fn new<P>(
        transaction: &Transaction<P>,
        context: &TransactionContext,
        phase: AuditPhase,
        state: TransactionState,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            transaction_id: transaction.id(),
            correlation_id: transaction.correlation_id().clone(),
            transaction_type: transaction.transaction_type().to_string(),
            phase,
            state,
            application_id: context.application_id().map(str::to_string),
            user_id: context.user_id().map(str::to_string),
            session_id: context.session_id().map(str::to_string),
            environment: context.environment().to_string(),
            recorded_at,
            success: None,
            error_code: None,
            duration_ms: None,
            metadata: transaction.metadata().clone(),
        }
    }

    pub fn with_outcome(mut self, success: bool, error_code: Option<&str>) -> Self {
        self.success = Some(success);
        self.error_code = error_code.map(str::to_string);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Emit on the audit target
    pub fn log(&self) {
        info!(
            target: AUDIT_TARGET,
            transaction_id = %self.transaction_id,
            correlation_id = %self.correlation_id,
            transaction_type = %self.transaction_type,
            phase = %self.phase,
            state = %self.state,
            application_id = self.application_id.as_deref().unwrap_or("-"),
            user_id = self.user_id.as_deref().unwrap_or("-"),
            success = ?self.success,
            error_code = self.error_code.as_deref().unwrap_or("-"),
            duration_ms = ?self.duration_ms,
            "audit"
        );
    }
}

/// Append-only list of the records produced by one pipeline run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditTrail {
    records: Vec<TransactionAuditInfo>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log and append a record
    pub fn record(&mut self, info: TransactionAuditInfo) -> &TransactionAuditInfo {
        info.log();
        self.records.push(info);
        &self.records[self.records.len() - 1]
    }

    pub fn records(&self) -> &[TransactionAuditInfo] {
        &self.records
    }

    pub fn last(&self) -> Option<&TransactionAuditInfo> {
        self.records.last()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_captures_identity() {
        let tx = Transaction::builder("debit", ())
            .metadata("channel", json!("web"))
            .build();
        let ctx = TransactionContext::new("app-1", "Teller").with_user("u-1");
        let info = TransactionAuditInfo::new(
            &tx,
            &ctx,
            AuditPhase::Started,
            TransactionState::PreProcessing,
            Utc::now(),
        );

        assert_eq!(info.transaction_id, tx.id());
        assert_eq!(&info.correlation_id, tx.correlation_id());
        assert_eq!(info.application_id.as_deref(), Some("app-1"));
        assert_eq!(info.user_id.as_deref(), Some("u-1"));
        assert_eq!(info.metadata.get("channel"), Some(&json!("web")));
        assert!(info.success.is_none());
    }

    #[test]
    fn test_trail_is_append_only() {
        let tx = Transaction::builder("debit", ()).build();
        let ctx = TransactionContext::anonymous();
        let mut trail = AuditTrail::new();

        let started = TransactionAuditInfo::new(
            &tx,
            &ctx,
            AuditPhase::Started,
            TransactionState::PreProcessing,
            Utc::now(),
        );
        trail.record(started.clone());
        trail.record(
            TransactionAuditInfo::new(
                &tx,
                &ctx,
                AuditPhase::Failed,
                TransactionState::Failed,
                Utc::now(),
            )
            .with_outcome(false, Some("TIMEOUT"))
            .with_duration(3),
        );

        assert_eq!(trail.len(), 2);
        assert_eq!(trail.records()[0], started);
        let last = trail.last().unwrap();
        assert_eq!(last.error_code.as_deref(), Some("TIMEOUT"));
        assert_eq!(last.duration_ms, Some(3));
    }
}
