use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;

use crate::crypto::HashParams;

/// Environment variable that overrides `security.master_secret`
pub const MASTER_SECRET_ENV: &str = "FINTX_MASTER_SECRET";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// Emit the `audit` target; when false it is filtered out
    #[serde(default = "default_true")]
    pub enable_audit_log: bool,
    pub security: SecurityConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub transactions: TransactionConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SecurityConfig {
    /// Secret the master key is derived from. Prefer the env override.
    #[serde(default)]
    pub master_secret: String,
    pub kdf_salt: String,
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,
    /// Argon2id cost for token data fingerprints
    #[serde(default)]
    pub hash: HashParams,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TokenConfig {
    /// Applied when a token is minted without an explicit expiration. 0 = never.
    pub default_expiration_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            default_expiration_secs: 3600,
        }
    }
}

impl TokenConfig {
    pub fn default_expiration(&self) -> Option<chrono::Duration> {
        (self.default_expiration_secs > 0)
            .then(|| chrono::Duration::seconds(self.default_expiration_secs as i64))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Postgres,
    Sqlite,
    Mongodb,
    Redis,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Purge interval for the in-memory backend and the cleanup worker
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    #[serde(default)]
    pub postgres: Option<SqlConfig>,
    #[serde(default)]
    pub sqlite: Option<SqlConfig>,
    #[serde(default)]
    pub mongodb: Option<MongoConfig>,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            cleanup_interval_secs: default_cleanup_interval(),
            postgres: None,
            sqlite: None,
            mongodb: None,
            redis: None,
        }
    }
}

/// Relational backend connection (PostgreSQL or SQLite)
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SqlConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MongoConfig {
    pub uri: String,
    pub database: String,
    #[serde(default = "default_collection")]
    pub collection: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// How long an expired record outlives its expiry before Redis evicts it
    #[serde(default = "default_expired_retention")]
    pub expired_retention_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TransactionConfig {
    /// Timeout for transactions built without an explicit one
    pub default_timeout_secs: u64,
    /// Mint a secure token over every successful output
    #[serde(default = "default_true")]
    pub issue_tokens: bool,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 30,
            issue_tokens: true,
        }
    }
}

impl TransactionConfig {
    pub fn default_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.default_timeout_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_kdf_iterations() -> u32 {
    100_000
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_max_connections() -> u32 {
    10
}

fn default_acquire_timeout() -> u64 {
    5
}

fn default_collection() -> String {
    "secure_tokens".to_string()
}

fn default_key_prefix() -> String {
    "fintx".to_string()
}

fn default_expired_retention() -> u64 {
    86_400
}

impl AppConfig {
    /// Load `config/{env}.yaml` and apply environment overrides
    pub fn load(env: &str) -> Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        let mut config = Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path))?;

        if let Some(secret) = std::env::var(MASTER_SECRET_ENV)
            .ok()
            .filter(|s| !s.is_empty())
        {
            config.security.master_secret = secret;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.security.master_secret.is_empty() {
            bail!(
                "security.master_secret is empty; set it in config or via {}",
                MASTER_SECRET_ENV
            );
        }
        if self.security.kdf_salt.len() < 8 {
            bail!("security.kdf_salt must be at least 8 bytes");
        }
        if self.security.kdf_iterations == 0 {
            bail!("security.kdf_iterations must be greater than zero");
        }

        let section_present = match self.storage.backend {
            StorageBackend::Memory => true,
            StorageBackend::Postgres => self.storage.postgres.is_some(),
            StorageBackend::Sqlite => self.storage.sqlite.is_some(),
            StorageBackend::Mongodb => self.storage.mongodb.is_some(),
            StorageBackend::Redis => self.storage.redis.is_some(),
        };
        if !section_present {
            bail!(
                "storage.backend is {:?} but its connection section is missing",
                self.storage.backend
            );
        }
        Ok(())
    }
}
