//! fintx - Secure Transaction Pipeline & Token Vault
//!
//! Runs business transactions through a uniform, audited pipeline and
//! wraps their outputs in encrypted, expiring, revocable tokens.
//!
//! # Modules
//!
//! - [`transaction`] - Pipeline, handler contract, registry, results
//! - [`token`] - Secure token minting and retrieval
//! - [`storage`] - Token persistence (memory, PostgreSQL, SQLite, MongoDB, Redis)
//! - [`crypto`] - AES-256-GCM, Argon2id, PBKDF2, master key
//! - [`events`] - Lifecycle event publishing
//! - [`app`] - Service wiring from configuration
//! - [`config`] / [`logging`] - YAML configuration and tracing setup

// Core types - must be first!
pub mod core_types;

pub mod cancel;
pub mod clock;
pub mod config;
pub mod logging;

pub mod crypto;
pub mod storage;
pub mod token;

pub mod events;
pub mod transaction;

pub mod app;

// Convenient re-exports at crate root
pub use app::AppServices;
pub use cancel::CancelSignal;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use core_types::{CorrelationId, Metadata, TokenId, TransactionId};
pub use crypto::{CryptoError, CryptoService, MasterKey};
pub use events::{EventPublisher, TransactionEvent};
pub use storage::{StorageError, TokenStorage};
pub use token::{SecureToken, SecureTokenGenerator, TokenError};
pub use transaction::{
    HandlerRegistry, Transaction, TransactionContext, TransactionError, TransactionHandler,
    TransactionPipeline, TransactionResult, TransactionState,
};
