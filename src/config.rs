//! Admin key configuration.
//!
//! Loaded from a JSON file with environment variables taking precedence.
//! Secrets are only ever read from here, never from command-line arguments.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{KeyCustodyError, KeyCustodyResult};
use crate::keygen::ModulusBits;
use crate::secure_memory::SecretString;
use crate::validator::DEFAULT_VALIDATOR_PROGRAM;

pub const ENV_ENCRYPTION_SECRET: &str = "KEYWARDEN_ENCRYPTION_SECRET";
pub const ENV_PREVIOUS_SECRETS: &str = "KEYWARDEN_PREVIOUS_SECRETS";
pub const ENV_FALLBACK_KEY_PATH: &str = "KEYWARDEN_FALLBACK_KEY_PATH";
pub const ENV_STORE_PATH: &str = "KEYWARDEN_STORE_PATH";

pub const DEFAULT_KEY_NAME: &str = "default-admin-key";
pub const DEFAULT_COMMENT: &str = "keywarden-admin";

/// Secrets shorter than this are accepted with a warning
pub const RECOMMENDED_SECRET_LEN: usize = 32;

/// Settings for the admin key this process is responsible for
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdminKeyConfig {
    pub name: String,
    pub modulus_bits: ModulusBits,
    pub encryption_secret: SecretString,
    /// Comment appended to generated public keys
    pub comment: String,
    /// Secrets that may have encrypted the stored key before a rotation
    pub previous_secrets: Vec<SecretString>,
    /// A private key file to fall back to when no secret decrypts the store
    pub fallback_private_key_path: Option<PathBuf>,
    pub store_path: PathBuf,
    pub validator: ValidatorConfig,
}

/// External public key validation
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub enabled: bool,
    pub program: PathBuf,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: PathBuf::from(DEFAULT_VALIDATOR_PROGRAM),
        }
    }
}

impl Default for AdminKeyConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_KEY_NAME.to_string(),
            modulus_bits: ModulusBits::default(),
            encryption_secret: SecretString::default(),
            comment: DEFAULT_COMMENT.to_string(),
            previous_secrets: Vec::new(),
            fallback_private_key_path: None,
            store_path: default_store_path(),
            validator: ValidatorConfig::default(),
        }
    }
}

impl AdminKeyConfig {
    /// Defaults with the given encryption secret
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            encryption_secret: SecretString::new(secret),
            ..Self::default()
        }
    }

    /// Load from the default location, falling back to defaults when the
    /// file does not exist. Environment overrides apply either way.
    pub fn load() -> KeyCustodyResult<Self> {
        let path = default_config_path();
        if path.exists() {
            return Self::load_from(&path);
        }

        log::debug!("No config file at {}, using defaults", path.display());
        let mut config = Self::default();
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from `path`, then apply environment overrides
    pub fn load_from<P: AsRef<Path>>(path: P) -> KeyCustodyResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            KeyCustodyError::ConfigError(format!("reading {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_json(&contents).map_err(|e| {
            KeyCustodyError::ConfigError(format!("parsing {}: {}", path.display(), e))
        })?;

        log::info!("Loaded config from {}", path.display());
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_json(json: &str) -> KeyCustodyResult<Self> {
        serde_json::from_str(json).map_err(|e| KeyCustodyError::ConfigError(e.to_string()))
    }

    /// Apply `KEYWARDEN_*` variables from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(secret) = lookup(ENV_ENCRYPTION_SECRET) {
            self.encryption_secret = SecretString::new(secret);
        }
        if let Some(previous) = lookup(ENV_PREVIOUS_SECRETS) {
            self.previous_secrets = previous
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(SecretString::from)
                .collect();
        }
        if let Some(path) = lookup(ENV_FALLBACK_KEY_PATH) {
            self.fallback_private_key_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup(ENV_STORE_PATH) {
            self.store_path = PathBuf::from(path);
        }
    }

    pub fn validate(&self) -> KeyCustodyResult<()> {
        if self.name.trim().is_empty() {
            return Err(KeyCustodyError::ConfigError(
                "key name must not be empty".to_string(),
            ));
        }
        if self.encryption_secret.is_empty() {
            return Err(KeyCustodyError::ConfigError(format!(
                "encryption secret is not set; provide it in the config file or via {}",
                ENV_ENCRYPTION_SECRET
            )));
        }
        if self.encryption_secret.len() < RECOMMENDED_SECRET_LEN {
            log::warn!(
                "Encryption secret is {} bytes; at least {} is recommended",
                self.encryption_secret.len(),
                RECOMMENDED_SECRET_LEN
            );
        }
        Ok(())
    }
}

/// `<config_dir>/keywarden/config.json`
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("keywarden")
        .join("config.json")
}

/// `<data_dir>/keywarden/keys.json`
pub fn default_store_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("keywarden")
        .join("keys.json")
}
