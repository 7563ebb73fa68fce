//! Handler Registry
//!
//! Explicit mapping from transaction type name to handler. Handlers are
//! registered once at startup; dispatch takes a JSON-payload transaction,
//! decodes the payload into the handler's type and runs the pipeline.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

use super::context::TransactionContext;
use super::error::TransactionError;
use super::handler::TransactionHandler;
use super::pipeline::TransactionPipeline;
use super::result::TransactionResult;
use super::types::Transaction;
use crate::cancel::CancelSignal;

#[async_trait]
trait JsonHandler: Send + Sync {
    async fn dispatch(
        &self,
        pipeline: &TransactionPipeline,
        transaction: Transaction<Value>,
        context: &TransactionContext,
        cancel: &CancelSignal,
    ) -> TransactionResult<Value>;
}

struct Typed<H>(Arc<H>);

#[async_trait]
impl<H> JsonHandler for Typed<H>
where
    H: TransactionHandler + 'static,
    H::Payload: DeserializeOwned + 'static,
    H::Output: 'static,
{
    async fn dispatch(
        &self,
        pipeline: &TransactionPipeline,
        transaction: Transaction<Value>,
        context: &TransactionContext,
        cancel: &CancelSignal,
    ) -> TransactionResult<Value> {
        let payload: H::Payload = match serde_json::from_value(transaction.payload().clone()) {
            Ok(payload) => payload,
            Err(e) => {
                let err = TransactionError::validation(format!("invalid payload: {e}"));
                return pipeline.reject(&transaction, context, err).await;
            }
        };

        let typed = transaction.map_payload(|_| payload);
        pipeline
            .handle(self.0.as_ref(), typed, context, cancel)
            .await
            .and_then(|output| {
                serde_json::to_value(&output).map_err(|e| {
                    error!(
                        transaction_type = %self.0.transaction_type(),
                        error = %e,
                        "Handler output is not representable as JSON"
                    );
                    TransactionError::internal(format!("output serialization failed: {e}"))
                })
            })
    }
}

pub struct HandlerRegistry {
    pipeline: Arc<TransactionPipeline>,
    handlers: HashMap<String, Arc<dyn JsonHandler>>,
}

impl HandlerRegistry {
    pub fn new(pipeline: Arc<TransactionPipeline>) -> Self {
        Self {
            pipeline,
            handlers: HashMap::new(),
        }
    }

    /// Register under `handler.transaction_type()`. Duplicate names are rejected.
    pub fn register<H>(&mut self, handler: Arc<H>) -> Result<(), TransactionError>
    where
        H: TransactionHandler + 'static,
        H::Payload: DeserializeOwned + 'static,
        H::Output: 'static,
    {
        let name = handler.transaction_type().to_string();
        if self.handlers.contains_key(&name) {
            return Err(TransactionError::validation(format!(
                "handler already registered for '{name}'"
            )));
        }
        info!(transaction_type = %name, "Transaction handler registered");
        self.handlers.insert(name, Arc::new(Typed(handler)));
        Ok(())
    }

    pub fn contains(&self, transaction_type: &str) -> bool {
        self.handlers.contains_key(transaction_type)
    }

    /// Registered type names, sorted
    pub fn transaction_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn pipeline(&self) -> &Arc<TransactionPipeline> {
        &self.pipeline
    }

    /// Route to the handler for `transaction.transaction_type()`.
    ///
    /// Unknown types and undecodable payloads fail with VALIDATION_ERROR.
    pub async fn dispatch(
        &self,
        transaction: Transaction<Value>,
        context: &TransactionContext,
        cancel: &CancelSignal,
    ) -> TransactionResult<Value> {
        match self.handlers.get(transaction.transaction_type()) {
            Some(handler) => {
                handler
                    .dispatch(&self.pipeline, transaction, context, cancel)
                    .await
            }
            None => {
                let err = TransactionError::validation(format!(
                    "no handler registered for '{}'",
                    transaction.transaction_type()
                ));
                self.pipeline.reject(&transaction, context, err).await
            }
        }
    }
}
