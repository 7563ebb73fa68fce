//! Transaction Processing
//!
//! Uniform pipeline for business transactions:
//! validate → authenticate → authorize → business rules → execute →
//! audit → publish, with compensation on failure.
//!
//! # Types
//!
//! | Type                   | Role                                        |
//! |------------------------|---------------------------------------------|
//! | [`Transaction`]        | immutable request, built via builder        |
//! | [`TransactionContext`] | caller identity for one run                 |
//! | [`TransactionHandler`] | business hooks for one transaction type     |
//! | [`TransactionPipeline`]| ordering, error capture, audit, events      |
//! | [`TransactionResult`]  | terminal outcome                            |
//! | [`HandlerRegistry`]    | type name → handler dispatch                |

pub mod audit;
pub mod context;
pub mod error;
pub mod handler;
pub mod pipeline;
pub mod registry;
pub mod result;
pub mod state;
pub mod types;

pub use audit::{AuditPhase, AuditTrail, TransactionAuditInfo};
pub use context::{
    AuthenticationContext, AuthenticationProvider, StaticAuthenticationProvider,
    TransactionContext,
};
pub use error::TransactionError;
pub use handler::TransactionHandler;
pub use pipeline::{PipelineConfig, TransactionPipeline};
pub use registry::HandlerRegistry;
pub use result::TransactionResult;
pub use state::TransactionState;
pub use types::{DEFAULT_TIMEOUT, Transaction, TransactionBuilder};
