//! Terminal outcome of one pipeline run
//!
//! Built only by the pipeline. Callers read it through accessors and can
//! transform the data with [`TransactionResult::map`]; nothing mutates it
//! after `handle` returns.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::audit::{AuditTrail, TransactionAuditInfo};
use super::error::TransactionError;
use super::state::TransactionState;
use crate::core_types::{CorrelationId, Metadata, TransactionId};
use crate::token::SecureToken;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResult<T> {
    transaction_id: TransactionId,
    correlation_id: CorrelationId,
    success: bool,
    data: Option<T>,
    message: String,
    error_code: Option<String>,
    error_detail: Option<String>,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
    duration_ms: u64,
    token: Option<SecureToken>,
    warnings: Vec<String>,
    metadata: Metadata,
    state: TransactionState,
    #[serde(skip)]
    error: Option<TransactionError>,
    #[serde(skip)]
    audit: AuditTrail,
}

/// Fields shared by every outcome
pub(crate) struct ResultHeader {
    pub transaction_id: TransactionId,
    pub correlation_id: CorrelationId,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub metadata: Metadata,
    pub warnings: Vec<String>,
    pub audit: AuditTrail,
}

impl ResultHeader {
    fn duration_ms(&self) -> u64 {
        (self.completed_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }
}

impl<T> TransactionResult<T> {
    pub(crate) fn completed(header: ResultHeader, data: T, token: Option<SecureToken>) -> Self {
        Self {
            duration_ms: header.duration_ms(),
            transaction_id: header.transaction_id,
            correlation_id: header.correlation_id,
            success: true,
            data: Some(data),
            message: "Transaction completed".to_string(),
            error_code: None,
            error_detail: None,
            started_at: header.started_at,
            completed_at: header.completed_at,
            token,
            warnings: header.warnings,
            metadata: header.metadata,
            state: TransactionState::Completed,
            error: None,
            audit: header.audit,
        }
    }

    pub(crate) fn failed(
        header: ResultHeader,
        error: TransactionError,
        state: TransactionState,
    ) -> Self {
        let message = match &error {
            TransactionError::Cancelled => "Transaction cancelled".to_string(),
            TransactionError::Timeout(_) => "Transaction timed out".to_string(),
            _ => "Transaction failed".to_string(),
        };
        Self {
            duration_ms: header.duration_ms(),
            transaction_id: header.transaction_id,
            correlation_id: header.correlation_id,
            success: false,
            data: None,
            message,
            error_code: Some(error.code().to_string()),
            error_detail: Some(error.to_string()),
            started_at: header.started_at,
            completed_at: header.completed_at,
            token: None,
            warnings: header.warnings,
            metadata: header.metadata,
            state,
            error: Some(error),
            audit: header.audit,
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    pub fn into_data(self) -> Option<T> {
        self.data
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error_code.as_deref()
    }

    pub fn error_detail(&self) -> Option<&str> {
        self.error_detail.as_deref()
    }

    /// Typed error for failed results
    pub fn error(&self) -> Option<&TransactionError> {
        self.error.as_ref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn completed_at(&self) -> DateTime<Utc> {
        self.completed_at
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn token(&self) -> Option<&SecureToken> {
        self.token.as_ref()
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Final pipeline state: COMPLETED, FAILED or CANCELLED
    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn audit_records(&self) -> &[TransactionAuditInfo] {
        self.audit.records()
    }

    /// Transform the data, keeping everything else
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> TransactionResult<U> {
        TransactionResult {
            transaction_id: self.transaction_id,
            correlation_id: self.correlation_id,
            success: self.success,
            data: self.data.map(f),
            message: self.message,
            error_code: self.error_code,
            error_detail: self.error_detail,
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_ms: self.duration_ms,
            token: self.token,
            warnings: self.warnings,
            metadata: self.metadata,
            state: self.state,
            error: self.error,
            audit: self.audit,
        }
    }
}

impl<T> TransactionResult<T> {
    /// Fallible [`map`](Self::map). An `Err` turns a successful result into
    /// a FAILED one carrying that error; the issued token is dropped from
    /// the result.
    pub(crate) fn and_then<U>(
        self,
        f: impl FnOnce(T) -> Result<U, TransactionError>,
    ) -> TransactionResult<U> {
        let (data, failure) = match self.data.map(f) {
            Some(Ok(data)) => (Some(data), None),
            Some(Err(e)) => (None, Some(e)),
            None => (None, None),
        };
        let Some(error) = failure else {
            return TransactionResult {
                transaction_id: self.transaction_id,
                correlation_id: self.correlation_id,
                success: self.success,
                data,
                message: self.message,
                error_code: self.error_code,
                error_detail: self.error_detail,
                started_at: self.started_at,
                completed_at: self.completed_at,
                duration_ms: self.duration_ms,
                token: self.token,
                warnings: self.warnings,
                metadata: self.metadata,
                state: self.state,
                error: self.error,
                audit: self.audit,
            };
        };
        TransactionResult {
            transaction_id: self.transaction_id,
            correlation_id: self.correlation_id,
            success: false,
            data: None,
            message: "Transaction failed".to_string(),
            error_code: Some(error.code().to_string()),
            error_detail: Some(error.to_string()),
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_ms: self.duration_ms,
            token: None,
            warnings: self.warnings,
            metadata: self.metadata,
            state: TransactionState::Failed,
            error: Some(error),
            audit: self.audit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> ResultHeader {
        let started_at = Utc::now();
        ResultHeader {
            transaction_id: TransactionId::new(),
            correlation_id: CorrelationId::new(),
            started_at,
            completed_at: started_at + chrono::Duration::milliseconds(42),
            metadata: Metadata::new(),
            warnings: vec!["post_process failed".to_string()],
            audit: AuditTrail::new(),
        }
    }

    #[test]
    fn test_completed_result() {
        let result = TransactionResult::completed(header(), 7u32, None);
        assert!(result.is_success());
        assert_eq!(result.data(), Some(&7));
        assert_eq!(result.state(), TransactionState::Completed);
        assert_eq!(result.duration_ms(), 42);
        assert!(result.error_code().is_none());
        assert_eq!(result.warnings().len(), 1);
    }

    #[test]
    fn test_failed_result() {
        let result: TransactionResult<u32> = TransactionResult::failed(
            header(),
            TransactionError::Timeout("elapsed 31s > 30s".into()),
            TransactionState::Failed,
        );
        assert!(!result.is_success());
        assert!(result.data().is_none());
        assert_eq!(result.error_code(), Some("TIMEOUT"));
        assert_eq!(result.message(), "Transaction timed out");
        assert!(result.error_detail().unwrap().contains("31s"));
        assert!(matches!(result.error(), Some(TransactionError::Timeout(_))));
    }

    #[test]
    fn test_map_keeps_envelope() {
        let result = TransactionResult::completed(header(), 7u32, None);
        let id = result.transaction_id();
        let mapped = result.map(|n| format!("#{n}"));
        assert_eq!(mapped.data().map(String::as_str), Some("#7"));
        assert_eq!(mapped.transaction_id(), id);
        assert_eq!(mapped.duration_ms(), 42);
    }

    #[test]
    fn test_and_then_error_fails_result() {
        let ok = TransactionResult::completed(header(), 7u32, None).and_then(|n| Ok(n + 1));
        assert!(ok.is_success());
        assert_eq!(ok.data(), Some(&8));

        let failed = TransactionResult::completed(header(), 7u32, None)
            .and_then(|_| Err::<u32, _>(TransactionError::internal("not JSON")));
        assert!(!failed.is_success());
        assert!(failed.data().is_none());
        assert_eq!(failed.error_code(), Some("INTERNAL_ERROR"));
        assert_eq!(failed.state(), TransactionState::Failed);
        assert_eq!(failed.warnings().len(), 1);
    }

    #[test]
    fn test_and_then_keeps_existing_failure() {
        let result: TransactionResult<u32> = TransactionResult::failed(
            header(),
            TransactionError::Cancelled,
            TransactionState::Cancelled,
        );
        let mapped = result.and_then(|n| Ok(n.to_string()));
        assert_eq!(mapped.error_code(), Some("CANCELLED"));
        assert_eq!(mapped.state(), TransactionState::Cancelled);
    }

    #[test]
    fn test_serializes_camel_case() {
        let result = TransactionResult::completed(header(), 7u32, None);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["state"], "COMPLETED");
        assert!(json.get("errorCode").is_some());
        assert!(json.get("audit").is_none());
    }
}
