//! Service wiring
//!
//! Builds the shared services from [`AppConfig`] once at startup:
//!
//! ```text
//! AppConfig ──► clock ──► storage ──► master key ──► token generator
//!                                                  └─► pipeline ──► registry
//! ```

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::cancel::CancelSignal;
use crate::clock::Clock;
use crate::config::{AppConfig, StorageBackend, TransactionConfig};
use crate::crypto::{CryptoService, MasterKey};
use crate::events::EventPublisher;
use crate::storage::{CleanupWorker, CleanupWorkerConfig, TokenStorage, build_storage};
use crate::token::SecureTokenGenerator;
use crate::transaction::{
    HandlerRegistry, PipelineConfig, TransactionBuilder, TransactionPipeline,
};

/// Shared services (cheap to clone)
#[derive(Clone)]
pub struct AppServices {
    pub clock: Arc<dyn Clock>,
    pub storage: Arc<dyn TokenStorage>,
    pub tokens: Arc<SecureTokenGenerator>,
    pub pipeline: Arc<TransactionPipeline>,
    backend: StorageBackend,
    cleanup_interval: std::time::Duration,
    transactions: TransactionConfig,
}

impl AppServices {
    pub async fn build(
        config: &AppConfig,
        clock: Arc<dyn Clock>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Result<Self> {
        let storage = build_storage(&config.storage, clock.clone())
            .await
            .context("Failed to build token storage")?;

        let crypto = CryptoService::new(config.security.hash);
        let security = &config.security;
        // PBKDF2 is CPU-bound
        let master_key = {
            let crypto = crypto.clone();
            let secret = security.master_secret.clone();
            let salt = security.kdf_salt.clone();
            let iterations = security.kdf_iterations;
            tokio::task::spawn_blocking(move || {
                MasterKey::derive(&crypto, &secret, salt.as_bytes(), iterations)
            })
            .await
            .context("Master key derivation task failed")?
            .context("Failed to derive master key")?
        };
        info!(key_id = %master_key.key_id(), "Master key derived");

        let tokens = Arc::new(
            SecureTokenGenerator::new(
                storage.clone(),
                crypto,
                Arc::new(master_key),
                clock.clone(),
            )
            .with_default_expiration(config.tokens.default_expiration()),
        );

        let pipeline = Arc::new(TransactionPipeline::new(
            publisher,
            Some(tokens.clone()),
            clock.clone(),
            PipelineConfig::from(&config.transactions),
        ));

        Ok(Self {
            clock,
            storage,
            tokens,
            pipeline,
            backend: config.storage.backend,
            cleanup_interval: std::time::Duration::from_secs(config.storage.cleanup_interval_secs),
            transactions: config.transactions.clone(),
        })
    }

    /// Empty registry over the shared pipeline
    pub fn registry(&self) -> HandlerRegistry {
        HandlerRegistry::new(self.pipeline.clone())
    }

    /// Builder stamped with the configured default timeout and the service clock
    pub fn new_transaction<P>(
        &self,
        transaction_type: impl Into<String>,
        payload: P,
    ) -> TransactionBuilder<P> {
        TransactionBuilder::new(transaction_type, payload)
            .created_at(self.clock.now())
            .timeout(self.transactions.default_timeout())
    }

    /// Spawn the periodic purge for external backends.
    ///
    /// The in-memory backend runs its own cleanup task, so `None` is
    /// returned for it.
    pub fn spawn_cleanup_worker(&self, cancel: CancelSignal) -> Option<JoinHandle<()>> {
        if self.backend == StorageBackend::Memory {
            return None;
        }
        let worker = CleanupWorker::new(
            self.storage.clone(),
            CleanupWorkerConfig {
                interval: self.cleanup_interval,
            },
        );
        Some(tokio::spawn(async move { worker.run(cancel).await }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::NoopEventPublisher;

    fn test_config() -> AppConfig {
        AppConfig::from_yaml(
            r#"
log_level: info
log_dir: ./logs
log_file: fintx.log
use_json: false
rotation: never
security:
  master_secret: wiring-secret
  kdf_salt: wiring-salt-01
  kdf_iterations: 1000
  hash:
    memory_kib: 256
    iterations: 1
    parallelism: 1
transactions:
  default_timeout_secs: 12
  issue_tokens: true
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_build_memory_services() {
        let clock = Arc::new(ManualClock::starting_now());
        let services = AppServices::build(&test_config(), clock.clone(), Arc::new(NoopEventPublisher))
            .await
            .unwrap();

        assert_eq!(services.storage.backend_name(), "memory");
        assert!(services.spawn_cleanup_worker(CancelSignal::new()).is_none());

        let tx = services.new_transaction("debit", 5u32).build();
        assert_eq!(tx.timeout(), std::time::Duration::from_secs(12));
        assert_eq!(tx.created_at(), clock.now());
        assert!(services.registry().transaction_types().is_empty());
    }

    #[tokio::test]
    async fn test_generator_uses_configured_expiration() {
        let clock = Arc::new(ManualClock::starting_now());
        let services = AppServices::build(&test_config(), clock.clone(), Arc::new(NoopEventPublisher))
            .await
            .unwrap();

        let token = services.tokens.generate_token(&"payload", None).await.unwrap();
        assert_eq!(
            token.expires_at,
            Some(token.created_at + chrono::Duration::hours(1))
        );
    }
}
