//! Token Cryptography
//!
//! AES-256-GCM authenticated encryption, Argon2id fingerprinting,
//! PBKDF2 key derivation and the process-wide master key.
//!
//! # Sizes
//!
//! | Item  | Bytes |
//! |-------|-------|
//! | key   | 32    |
//! | nonce | 12    |
//! | tag   | 16    |

pub mod error;
pub mod master_key;
pub mod service;

pub use error::CryptoError;
pub use master_key::MasterKey;
pub use service::{
    CryptoService, EncryptionResult, HashParams, constant_time_eq, constant_time_eq_str,
};

/// AES-256 key length in bytes
pub const KEY_LENGTH: usize = 32;
/// AES-GCM nonce length in bytes
pub const NONCE_LENGTH: usize = 12;
/// AES-GCM authentication tag length in bytes
pub const TAG_LENGTH: usize = 16;
/// Algorithm label written into token envelopes
pub const ALGORITHM: &str = "AES-256-GCM";
