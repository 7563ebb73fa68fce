//! Transaction handler contract
//!
//! A handler supplies the business-specific hooks; the pipeline owns the
//! ordering. Every hook except `execute` has a no-op default.
//!
//! # Hook order
//!
//! | Phase          | Hooks                                              |
//! |----------------|----------------------------------------------------|
//! | PreProcessing  | `validate`, `business_rules`, `pre_process`        |
//! | Processing     | `execute`                                          |
//! | PostProcessing | `post_process`, `confirm` (failures swallowed)     |
//! | on failure     | `compensate` (failures swallowed)                  |
//!
//! Hooks return `anyhow::Result`. Errors are mapped through
//! `classify_error`, which keeps a `TransactionError` that was wrapped in
//! the `anyhow::Error` and treats anything else as internal.

use async_trait::async_trait;
use serde::Serialize;

use super::context::TransactionContext;
use super::error::TransactionError;
use super::state::TransactionState;
use super::types::Transaction;

#[async_trait]
pub trait TransactionHandler: Send + Sync {
    type Payload: Send + Sync;
    type Output: Serialize + Send + Sync;

    /// Name used for registry lookup; must match `Transaction::transaction_type`
    fn transaction_type(&self) -> &str;

    async fn validate(
        &self,
        _transaction: &Transaction<Self::Payload>,
        _context: &TransactionContext,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn business_rules(
        &self,
        _transaction: &Transaction<Self::Payload>,
        _context: &TransactionContext,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn pre_process(
        &self,
        _transaction: &Transaction<Self::Payload>,
        _context: &TransactionContext,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn execute(
        &self,
        transaction: &Transaction<Self::Payload>,
        context: &TransactionContext,
    ) -> anyhow::Result<Self::Output>;

    async fn post_process(
        &self,
        _transaction: &Transaction<Self::Payload>,
        _context: &TransactionContext,
        _output: &Self::Output,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn confirm(
        &self,
        _transaction: &Transaction<Self::Payload>,
        _context: &TransactionContext,
        _output: &Self::Output,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Roll back partial side effects. `failed_in` is the state the
    /// pipeline was in when the error occurred.
    async fn compensate(
        &self,
        _transaction: &Transaction<Self::Payload>,
        _context: &TransactionContext,
        _error: &TransactionError,
        _failed_in: TransactionState,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn classify_error(&self, error: anyhow::Error) -> TransactionError {
        TransactionError::from(error)
    }

    /// Expiration for tokens minted over this handler's output.
    /// `None` falls back to the generator default.
    fn token_expiration(&self) -> Option<chrono::Duration> {
        None
    }

    /// Per-handler override of the pipeline token policy
    fn issue_token(&self) -> Option<bool> {
        None
    }
}
