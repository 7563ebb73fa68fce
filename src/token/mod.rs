//! Secure Tokens
//!
//! Portable, encrypted, tamper-evident wrappers around arbitrary
//! serializable data, persisted through [`crate::storage::TokenStorage`].
//!
//! | Type                    | Role                                    |
//! |-------------------------|-----------------------------------------|
//! | [`SecureToken`]         | value handed to callers                 |
//! | [`TokenEnvelope`]       | Base64 JSON wire format                 |
//! | [`TokenPayload`]        | plaintext sealed inside the envelope    |
//! | [`SecureTokenGenerator`]| mint / retrieve / validate / revoke     |

pub mod error;
pub mod generator;
pub mod model;

pub use error::TokenError;
pub use generator::SecureTokenGenerator;
pub use model::{ENVELOPE_VERSION, SecureToken, TokenEnvelope, TokenInfo, TokenPayload};
