//! Transaction Pipeline
//!
//! Drives one transaction through its handler in a fixed order:
//!
//! ```text
//! PreProcessing   timeout check → structural + handler validation →
//!                 authentication → authorization → business rules →
//!                 "started" event → pre_process
//! Processing      execute → secure token (policy)
//! PostProcessing  audit → "completed" event → post_process → confirm
//! ```
//!
//! # Failure handling
//!
//! Any error in PreProcessing/Processing is classified once, compensation
//! runs, an audit record and an "error" event are emitted and a failed
//! result is returned. PostProcessing failures become warnings on the
//! successful result. Nothing escapes `handle`.
//!
//! # Cancellation
//!
//! Checked between steps and raced against every PreProcessing/Processing
//! hook. Ignored from PostProcessing on.

use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::audit::{AuditPhase, AuditTrail, TransactionAuditInfo};
use super::context::{AuthenticationProvider, TransactionContext};
use super::error::TransactionError;
use super::handler::TransactionHandler;
use super::result::{ResultHeader, TransactionResult};
use super::state::TransactionState;
use super::types::Transaction;
use crate::cancel::CancelSignal;
use crate::clock::Clock;
use crate::config::TransactionConfig;
use crate::events::{EventHeader, EventPublisher, TransactionEvent};
use crate::token::{SecureToken, SecureTokenGenerator};

/// Pipeline-wide policy
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Mint a secure token over successful outputs
    pub issue_tokens: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { issue_tokens: true }
    }
}

impl From<&TransactionConfig> for PipelineConfig {
    fn from(config: &TransactionConfig) -> Self {
        Self {
            issue_tokens: config.issue_tokens,
        }
    }
}

pub struct TransactionPipeline {
    publisher: Arc<dyn EventPublisher>,
    tokens: Option<Arc<SecureTokenGenerator>>,
    clock: Arc<dyn Clock>,
    config: PipelineConfig,
}

/// Per-run mutable bookkeeping
struct Run {
    state: TransactionState,
    audit: AuditTrail,
    warnings: Vec<String>,
}

impl Run {
    fn advance(&mut self, next: TransactionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        self.state = next;
    }
}

impl TransactionPipeline {
    pub fn new(
        publisher: Arc<dyn EventPublisher>,
        tokens: Option<Arc<SecureTokenGenerator>>,
        clock: Arc<dyn Clock>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            publisher,
            tokens,
            clock,
            config,
        }
    }

    /// Resolve the context through `provider`, then `handle`.
    ///
    /// A missing context becomes an anonymous one, which fails any
    /// transaction that requires authentication.
    pub async fn handle_with_provider<H: TransactionHandler>(
        &self,
        handler: &H,
        transaction: Transaction<H::Payload>,
        provider: &dyn AuthenticationProvider,
        cancel: &CancelSignal,
    ) -> TransactionResult<H::Output> {
        let context = provider
            .current_context()
            .await
            .map(TransactionContext::from)
            .unwrap_or_else(TransactionContext::anonymous);
        self.handle(handler, transaction, &context, cancel).await
    }

    pub async fn handle<H: TransactionHandler>(
        &self,
        handler: &H,
        transaction: Transaction<H::Payload>,
        context: &TransactionContext,
        cancel: &CancelSignal,
    ) -> TransactionResult<H::Output> {
        let started_at = self.clock.now();
        let mut run = Run {
            state: TransactionState::Created,
            audit: AuditTrail::new(),
            warnings: Vec::new(),
        };

        info!(
            transaction_id = %transaction.id(),
            correlation_id = %transaction.correlation_id(),
            transaction_type = %transaction.transaction_type(),
            "Transaction received"
        );

        let outcome = self
            .pre_and_process(handler, &transaction, context, cancel, &mut run)
            .await;

        match outcome {
            Ok((output, token)) => {
                run.advance(TransactionState::PostProcessing);
                self.post_process(
                    handler,
                    &transaction,
                    context,
                    &output,
                    token.as_ref(),
                    started_at,
                    &mut run,
                )
                .await;
                run.advance(TransactionState::Completed);

                let header = self.result_header(&transaction, started_at, run);
                TransactionResult::completed(header, output, token)
            }
            Err(err) => {
                let failed_in = run.state;
                let final_state = if matches!(err, TransactionError::Cancelled) {
                    TransactionState::Cancelled
                } else {
                    TransactionState::Failed
                };
                run.advance(final_state);
                self.on_failure(
                    handler,
                    &transaction,
                    context,
                    &err,
                    failed_in,
                    started_at,
                    &mut run,
                )
                .await;

                let header = self.result_header(&transaction, started_at, run);
                TransactionResult::failed(header, err, final_state)
            }
        }
    }

    async fn pre_and_process<H: TransactionHandler>(
        &self,
        handler: &H,
        transaction: &Transaction<H::Payload>,
        context: &TransactionContext,
        cancel: &CancelSignal,
        run: &mut Run,
    ) -> Result<(H::Output, Option<SecureToken>), TransactionError> {
        run.advance(TransactionState::PreProcessing);

        // (a) structural validation; the timeout check precedes any side effect
        let now = self.clock.now();
        if transaction.is_timed_out_at(now) {
            return Err(TransactionError::Timeout(format!(
                "elapsed {}ms exceeds timeout {}ms",
                transaction.elapsed_at(now).as_millis(),
                transaction.timeout().as_millis()
            )));
        }
        if transaction.transaction_type() != handler.transaction_type() {
            return Err(TransactionError::validation(format!(
                "handler '{}' cannot process transaction type '{}'",
                handler.transaction_type(),
                transaction.transaction_type()
            )));
        }
        check_cancelled(cancel)?;

        run.audit.record(TransactionAuditInfo::new(
            transaction,
            context,
            AuditPhase::Started,
            run.state,
            now,
        ));

        guarded(handler, cancel, handler.validate(transaction, context)).await?;

        // (b) authentication
        if transaction.requires_authentication() && !context.is_authenticated() {
            return Err(TransactionError::unauthorized("authentication required"));
        }

        // (c) authorization
        let missing = context.missing_permissions(transaction.required_permissions());
        if !missing.is_empty() {
            return Err(TransactionError::unauthorized(format!(
                "missing permissions: {}",
                missing.join(", ")
            )));
        }

        // (d) business rules
        check_cancelled(cancel)?;
        guarded(handler, cancel, handler.business_rules(transaction, context)).await?;

        // (e) started event
        check_cancelled(cancel)?;
        let started = TransactionEvent::Started {
            header: self.event_header(transaction, context),
        };
        self.publish(&started, cancel).await;

        // (f) pre-processing hook
        check_cancelled(cancel)?;
        guarded(handler, cancel, handler.pre_process(transaction, context)).await?;

        check_cancelled(cancel)?;
        run.advance(TransactionState::Processing);

        let output = guarded(handler, cancel, handler.execute(transaction, context)).await?;

        let issue = handler.issue_token().unwrap_or(self.config.issue_tokens);
        let token = match (&self.tokens, issue) {
            (Some(tokens), true) => {
                let token = tokens
                    .generate_token_with_metadata(
                        &output,
                        handler.token_expiration(),
                        transaction.metadata().clone(),
                    )
                    .await?;
                Some(token)
            }
            _ => None,
        };

        Ok((output, token))
    }

    #[allow(clippy::too_many_arguments)]
    async fn post_process<H: TransactionHandler>(
        &self,
        handler: &H,
        transaction: &Transaction<H::Payload>,
        context: &TransactionContext,
        output: &H::Output,
        token: Option<&SecureToken>,
        started_at: chrono::DateTime<chrono::Utc>,
        run: &mut Run,
    ) {
        // cancellation no longer applies
        let cancel = CancelSignal::none();
        let now = self.clock.now();
        let duration_ms = elapsed_ms(started_at, now);

        let audit = run
            .audit
            .record(
                TransactionAuditInfo::new(
                    transaction,
                    context,
                    AuditPhase::Completed,
                    TransactionState::Completed,
                    now,
                )
                .with_outcome(true, None)
                .with_duration(duration_ms),
            )
            .clone();
        self.publish(
            &TransactionEvent::Audit {
                header: self.event_header(transaction, context),
                audit,
            },
            &cancel,
        )
        .await;

        self.publish(
            &TransactionEvent::Completed {
                header: self.event_header(transaction, context),
                duration_ms,
                token_id: token.map(|t| t.token_id.clone()),
            },
            &cancel,
        )
        .await;

        if let Err(e) = handler.post_process(transaction, context, output).await {
            warn!(transaction_id = %transaction.id(), error = %e, "post_process failed");
            run.warnings.push(format!("post_process failed: {e}"));
        }
        if let Err(e) = handler.confirm(transaction, context, output).await {
            warn!(transaction_id = %transaction.id(), error = %e, "confirm failed");
            run.warnings.push(format!("confirm failed: {e}"));
        }

        info!(
            transaction_id = %transaction.id(),
            duration_ms,
            token_id = token.map(|t| t.token_id.as_str()).unwrap_or("-"),
            "Transaction completed"
        );
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_failure<H: TransactionHandler>(
        &self,
        handler: &H,
        transaction: &Transaction<H::Payload>,
        context: &TransactionContext,
        err: &TransactionError,
        failed_in: TransactionState,
        started_at: chrono::DateTime<chrono::Utc>,
        run: &mut Run,
    ) {
        warn!(
            transaction_id = %transaction.id(),
            correlation_id = %transaction.correlation_id(),
            failed_in = %failed_in,
            error_code = err.code(),
            error = %err,
            "Transaction failed"
        );

        match handler.compensate(transaction, context, err, failed_in).await {
            Ok(()) => {
                run.audit.record(
                    TransactionAuditInfo::new(
                        transaction,
                        context,
                        AuditPhase::Compensated,
                        run.state,
                        self.clock.now(),
                    )
                    .with_outcome(false, Some(err.code())),
                );
            }
            Err(e) => {
                error!(
                    transaction_id = %transaction.id(),
                    error = %e,
                    "Compensation failed"
                );
            }
        }

        self.record_failure(transaction, context, err, started_at, run)
            .await;
    }

    /// Reject a transaction that never reached a handler
    pub async fn reject<P, T>(
        &self,
        transaction: &Transaction<P>,
        context: &TransactionContext,
        err: TransactionError,
    ) -> TransactionResult<T> {
        let started_at = self.clock.now();
        let mut run = Run {
            state: TransactionState::Created,
            audit: AuditTrail::new(),
            warnings: Vec::new(),
        };
        run.advance(TransactionState::Failed);

        warn!(
            transaction_id = %transaction.id(),
            transaction_type = %transaction.transaction_type(),
            error_code = err.code(),
            error = %err,
            "Transaction rejected"
        );
        self.record_failure(transaction, context, &err, started_at, &mut run)
            .await;

        let header = self.result_header(transaction, started_at, run);
        TransactionResult::failed(header, err, TransactionState::Failed)
    }

    /// Failed audit record, then audit and error events
    async fn record_failure<P>(
        &self,
        transaction: &Transaction<P>,
        context: &TransactionContext,
        err: &TransactionError,
        started_at: chrono::DateTime<chrono::Utc>,
        run: &mut Run,
    ) {
        let cancel = CancelSignal::none();
        let now = self.clock.now();
        let audit = run
            .audit
            .record(
                TransactionAuditInfo::new(transaction, context, AuditPhase::Failed, run.state, now)
                    .with_outcome(false, Some(err.code()))
                    .with_duration(elapsed_ms(started_at, now)),
            )
            .clone();
        self.publish(
            &TransactionEvent::Audit {
                header: self.event_header(transaction, context),
                audit,
            },
            &cancel,
        )
        .await;

        self.publish(
            &TransactionEvent::Error {
                header: self.event_header(transaction, context),
                error_code: err.code().to_string(),
                message: err.to_string(),
            },
            &cancel,
        )
        .await;
    }

    /// Fire-and-forget: failures are logged only
    async fn publish(&self, event: &TransactionEvent, cancel: &CancelSignal) {
        if let Err(e) = self.publisher.publish(event, cancel).await {
            warn!(
                kind = event.kind(),
                transaction_id = %event.header().transaction_id,
                error = %e,
                "Event publish failed"
            );
        } else {
            debug!(kind = event.kind(), "Event published");
        }
    }

    fn event_header<P>(
        &self,
        transaction: &Transaction<P>,
        context: &TransactionContext,
    ) -> EventHeader {
        EventHeader::new(
            transaction.id(),
            transaction.correlation_id().clone(),
            transaction.transaction_type(),
            context.application_id().map(str::to_string),
            self.clock.now(),
            transaction.metadata().clone(),
        )
    }

    fn result_header<P>(
        &self,
        transaction: &Transaction<P>,
        started_at: chrono::DateTime<chrono::Utc>,
        run: Run,
    ) -> ResultHeader {
        ResultHeader {
            transaction_id: transaction.id(),
            correlation_id: transaction.correlation_id().clone(),
            started_at,
            completed_at: self.clock.now(),
            metadata: transaction.metadata().clone(),
            warnings: run.warnings,
            audit: run.audit,
        }
    }
}

#[inline]
fn check_cancelled(cancel: &CancelSignal) -> Result<(), TransactionError> {
    if cancel.is_cancelled() {
        Err(TransactionError::Cancelled)
    } else {
        Ok(())
    }
}

/// Run a hook, racing it against cancellation and classifying its error
async fn guarded<H, T, F>(handler: &H, cancel: &CancelSignal, hook: F) -> Result<T, TransactionError>
where
    H: TransactionHandler,
    F: Future<Output = anyhow::Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransactionError::Cancelled),
        res = hook => res.map_err(|e| handler.classify_error(e)),
    }
}

fn elapsed_ms(from: chrono::DateTime<chrono::Utc>, to: chrono::DateTime<chrono::Utc>) -> u64 {
    (to - from).num_milliseconds().max(0) as u64
}
