//! Crypto Service
//!
//! Stateless primitives used by the token generator. Every method takes
//! `&self` and touches no shared mutable state, so one instance can be
//! shared across tasks behind an `Arc`.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{Engine, engine::general_purpose::STANDARD};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::error::CryptoError;
use super::{KEY_LENGTH, NONCE_LENGTH, TAG_LENGTH};

/// Output length of `compute_hash` before Base64 encoding
const HASH_LENGTH: usize = 32;

/// Argon2id cost parameters for `compute_hash`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashParams {
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Number of passes
    pub iterations: u32,
    /// Degree of parallelism
    pub parallelism: u32,
}

impl Default for HashParams {
    fn default() -> Self {
        Self {
            memory_kib: Params::DEFAULT_M_COST,
            iterations: Params::DEFAULT_T_COST,
            parallelism: Params::DEFAULT_P_COST,
        }
    }
}

/// Result of an AEAD encryption.
///
/// The key is wiped when the value is dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionResult {
    pub cipher_text: Vec<u8>,
    pub key: Vec<u8>,
    pub nonce: [u8; NONCE_LENGTH],
    pub tag: [u8; TAG_LENGTH],
}

impl fmt::Debug for EncryptionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionResult")
            .field("cipher_text_len", &self.cipher_text.len())
            .field("key", &"<redacted>")
            .field("nonce", &hex::encode(self.nonce))
            .field("tag", &hex::encode(self.tag))
            .finish()
    }
}

/// AEAD, hashing and key-derivation primitives.
#[derive(Debug, Clone, Default)]
pub struct CryptoService {
    hash_params: HashParams,
}

impl CryptoService {
    pub fn new(hash_params: HashParams) -> Self {
        Self { hash_params }
    }

    pub fn hash_params(&self) -> HashParams {
        self.hash_params
    }

    /// Encrypt under a freshly generated random key and nonce.
    pub fn encrypt(
        &self,
        data: &[u8],
        associated_data: Option<&[u8]>,
    ) -> Result<EncryptionResult, CryptoError> {
        let key = self.generate_random_bytes(KEY_LENGTH);
        self.encrypt_with_key(&key, data, associated_data)
    }

    /// Encrypt under a caller-supplied 256-bit key with a fresh nonce.
    pub fn encrypt_with_key(
        &self,
        key: &[u8],
        data: &[u8],
        associated_data: Option<&[u8]>,
    ) -> Result<EncryptionResult, CryptoError> {
        if key.len() != KEY_LENGTH {
            return Err(CryptoError::InvalidKeyLength(key.len()));
        }
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;

        let mut nonce = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce);

        let payload = Payload {
            msg: data,
            aad: associated_data.unwrap_or_default(),
        };
        let mut sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), payload)
            .map_err(|_| CryptoError::EncryptFailed)?;

        // aes-gcm appends the tag to the ciphertext
        let split_at = sealed
            .len()
            .checked_sub(TAG_LENGTH)
            .ok_or(CryptoError::EncryptFailed)?;
        let tag_bytes = sealed.split_off(split_at);
        let mut tag = [0u8; TAG_LENGTH];
        tag.copy_from_slice(&tag_bytes);

        Ok(EncryptionResult {
            cipher_text: sealed,
            key: key.to_vec(),
            nonce,
            tag,
        })
    }

    /// Decrypt and authenticate.
    ///
    /// Returns `None` for any failure: wrong key, bad lengths, modified
    /// ciphertext/nonce/tag or mismatched associated data.
    pub fn decrypt(
        &self,
        cipher_text: &[u8],
        key: &[u8],
        nonce: &[u8],
        tag: &[u8],
        associated_data: Option<&[u8]>,
    ) -> Option<Vec<u8>> {
        if key.len() != KEY_LENGTH || nonce.len() != NONCE_LENGTH || tag.len() != TAG_LENGTH {
            return None;
        }
        let cipher = Aes256Gcm::new_from_slice(key).ok()?;

        let mut sealed = Vec::with_capacity(cipher_text.len() + TAG_LENGTH);
        sealed.extend_from_slice(cipher_text);
        sealed.extend_from_slice(tag);

        let payload = Payload {
            msg: &sealed,
            aad: associated_data.unwrap_or_default(),
        };
        cipher.decrypt(Nonce::from_slice(nonce), payload).ok()
    }

    /// Salted Argon2id fingerprint, Base64 encoded.
    ///
    /// The salt must be at least 8 bytes.
    pub fn compute_hash(&self, data: &[u8], salt: &[u8]) -> Result<String, CryptoError> {
        let params = Params::new(
            self.hash_params.memory_kib,
            self.hash_params.iterations,
            self.hash_params.parallelism,
            Some(HASH_LENGTH),
        )
        .map_err(|e| CryptoError::InvalidKdfParams(e.to_string()))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut out = [0u8; HASH_LENGTH];
        argon2
            .hash_password_into(data, salt, &mut out)
            .map_err(|e| CryptoError::HashFailed(e.to_string()))?;

        Ok(STANDARD.encode(out))
    }

    /// Recompute a fingerprint and compare it in constant time
    pub fn verify_hash(&self, data: &[u8], salt: &[u8], expected: &str) -> bool {
        match self.compute_hash(data, salt) {
            Ok(actual) => constant_time_eq(actual.as_bytes(), expected.as_bytes()),
            Err(_) => false,
        }
    }

    /// Bytes from the operating system CSPRNG
    pub fn generate_random_bytes(&self, len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        OsRng.fill_bytes(&mut bytes);
        bytes
    }

    /// PBKDF2-HMAC-SHA256 key derivation
    pub fn derive_key(
        &self,
        password: &[u8],
        salt: &[u8],
        iterations: u32,
        key_length: usize,
    ) -> Result<Vec<u8>, CryptoError> {
        if iterations == 0 {
            return Err(CryptoError::InvalidKdfParams(
                "iterations must be greater than zero".to_string(),
            ));
        }
        if key_length == 0 {
            return Err(CryptoError::InvalidKdfParams(
                "key length must be greater than zero".to_string(),
            ));
        }

        let mut key = vec![0u8; key_length];
        pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut key);
        Ok(key)
    }
}

/// Constant-time byte comparison. Length mismatch returns early.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

#[inline]
pub fn constant_time_eq_str(a: &str, b: &str) -> bool {
    constant_time_eq(a.as_bytes(), b.as_bytes())
}
