//! Secure token lifecycle across the full stack: config → master key →
//! generator → storage, on the in-memory and SQLite backends.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use fintx::clock::{Clock, ManualClock};
use fintx::config::{AppConfig, SqlConfig};
use fintx::crypto::{CryptoService, HashParams, MasterKey};
use fintx::events::NoopEventPublisher;
use fintx::storage::{SqliteTokenStorage, TokenStorage};
use fintx::token::{ENVELOPE_VERSION, SecureTokenGenerator, TokenEnvelope};
use fintx::AppServices;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Payment {
    account_id: String,
    amount: u64,
    currency: String,
}

fn payment() -> Payment {
    Payment {
        account_id: "ACC-123".to_string(),
        amount: 500,
        currency: "EUR".to_string(),
    }
}

fn crypto() -> CryptoService {
    CryptoService::new(HashParams {
        memory_kib: 256,
        iterations: 1,
        parallelism: 1,
    })
}

fn derived_key(secret: &str) -> Arc<MasterKey> {
    Arc::new(MasterKey::derive(&crypto(), secret, b"fintx-test-salt", 1000).unwrap())
}

fn sqlite(clock: Arc<ManualClock>) -> Arc<dyn TokenStorage> {
    let config = SqlConfig {
        url: "sqlite::memory:".to_string(),
        max_connections: 1,
        acquire_timeout_secs: 5,
    };
    Arc::new(SqliteTokenStorage::connect_lazy(&config, clock).unwrap())
}

#[tokio::test]
async fn test_services_from_test_config() {
    let config = AppConfig::load("test").unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    let services = AppServices::build(&config, clock.clone(), Arc::new(NoopEventPublisher))
        .await
        .unwrap();

    let token = services.tokens.generate_token(&payment(), None).await.unwrap();
    let back: Option<Payment> = services.tokens.retrieve_data(&token.token).await.unwrap();
    assert_eq!(back, Some(payment()));

    // default expiration from config is one hour
    clock.advance(Duration::minutes(59));
    assert!(services.tokens.validate_token(&token.token).await.unwrap());
    clock.advance(Duration::minutes(1));
    assert!(!services.tokens.validate_token(&token.token).await.unwrap());
}

#[tokio::test]
async fn test_one_hour_token_invalid_after_two_hours() {
    let clock = Arc::new(ManualClock::starting_now());
    let generator =
        SecureTokenGenerator::new(sqlite(clock.clone()), crypto(), derived_key("s3cret"), clock.clone());

    let token = generator
        .generate_token(&payment(), Some(Duration::hours(1)))
        .await
        .unwrap();
    assert_eq!(token.expires_at, Some(token.created_at + Duration::hours(1)));

    let stored = generator.storage().get_token(&token.token_id).await.unwrap();
    assert_eq!(stored.as_ref().map(|t| &t.token), Some(&token.token));

    clock.advance(Duration::hours(2));
    let data: Option<Payment> = generator.retrieve_data(&token.token).await.unwrap();
    assert!(data.is_none());
    assert!(!generator.validate_token(&token.token).await.unwrap());
    assert_eq!(generator.storage().cleanup_expired().await.unwrap(), 1);
}

#[tokio::test]
async fn test_revocation_is_permanent_on_sqlite() {
    let clock = Arc::new(ManualClock::starting_now());
    let generator =
        SecureTokenGenerator::new(sqlite(clock.clone()), crypto(), derived_key("s3cret"), clock.clone());

    let token = generator.generate_token(&payment(), None).await.unwrap();
    assert!(token.expires_at.is_none());
    assert!(generator.revoke_token(&token.token).await.unwrap());
    assert!(!generator.revoke_token(&token.token).await.unwrap());

    clock.advance(Duration::days(365));
    let data: Option<Payment> = generator.retrieve_data(&token.token).await.unwrap();
    assert!(data.is_none());

    let stats = generator.storage().get_statistics().await.unwrap();
    assert_eq!(stats.revoked_tokens, 1);
    assert_eq!(stats.total_tokens, 1);
}

#[tokio::test]
async fn test_same_secret_shares_tokens_other_secret_does_not() {
    let clock = Arc::new(ManualClock::starting_now());
    let storage = sqlite(clock.clone());
    let issuer =
        SecureTokenGenerator::new(storage.clone(), crypto(), derived_key("s3cret"), clock.clone());
    let peer =
        SecureTokenGenerator::new(storage.clone(), crypto(), derived_key("s3cret"), clock.clone());
    let stranger =
        SecureTokenGenerator::new(storage, crypto(), derived_key("other"), clock.clone());

    let token = issuer.generate_token(&payment(), None).await.unwrap();

    let via_peer: Option<Payment> = peer.retrieve_data(&token.token).await.unwrap();
    assert_eq!(via_peer, Some(payment()));

    let via_stranger: Option<Payment> = stranger.retrieve_data(&token.token).await.unwrap();
    assert!(via_stranger.is_none());
    // existence checks do not need the key
    assert!(stranger.validate_token(&token.token).await.unwrap());
}

#[tokio::test]
async fn test_envelope_swap_is_rejected() {
    let clock = Arc::new(ManualClock::starting_now());
    let generator =
        SecureTokenGenerator::new(sqlite(clock.clone()), crypto(), derived_key("s3cret"), clock.clone());

    let first = generator.generate_token(&payment(), None).await.unwrap();
    let second = generator.generate_token(&"other data", None).await.unwrap();

    // ciphertext of the second token presented under the first token's id
    let mut forged = TokenEnvelope::decode(&second.token).unwrap();
    forged.token_id = first.token_id.clone();
    let forged = forged.encode().unwrap();

    let data: Option<Payment> = generator.retrieve_data(&forged).await.unwrap();
    assert!(data.is_none());

    let info = generator.inspect(&first.token).unwrap();
    assert_eq!(info.token_id, first.token_id);
    assert_eq!(info.version, ENVELOPE_VERSION);
    assert_eq!(info.algorithm, "AES-256-GCM");
    assert!(generator.verify_data_hash(&first, &payment()).await);
    assert!(!generator.verify_data_hash(&first, &"other data").await);
}

#[tokio::test]
async fn test_tokens_are_unique() {
    let clock = Arc::new(ManualClock::starting_now());
    let generator =
        SecureTokenGenerator::new(sqlite(clock.clone()), crypto(), derived_key("s3cret"), clock.clone());

    let a = generator.generate_token(&payment(), None).await.unwrap();
    let b = generator.generate_token(&payment(), None).await.unwrap();
    assert_ne!(a.token_id, b.token_id);
    assert_ne!(a.token, b.token);
    // timestamps are stored at millisecond precision
    assert!(a.created_at <= clock.now());
    assert_eq!(a.created_at.timestamp_subsec_nanos() % 1_000_000, 0);
    assert_eq!(uuid::Uuid::parse_str(&a.token_id).unwrap().get_version_num(), 4);
}
