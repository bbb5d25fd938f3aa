use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{SealError, SealResult};

/// Default plaintext bytes per encrypted chunk
pub const DEFAULT_CHUNK_SIZE: u32 = 65536;

/// Largest chunk size accepted from config or from an envelope header (16 MiB)
pub const MAX_CHUNK_SIZE: u32 = 16 * 1024 * 1024;

/// Top-level configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SealConfig {
    pub logging: LoggingConfig,
    pub crypto: CryptoConfig,
    pub output: OutputConfig,
    pub keys: KeysConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

/// Envelope and key-wrapping parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Plaintext bytes per chunk (default: 65536)
    pub chunk_size: u32,
    /// Threads used for chunk encryption (default: 1 = sequential)
    pub workers: usize,
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Suffix appended on encrypt and stripped on decrypt
    pub encrypted_suffix: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Default recipient public key for `encrypt`
    pub public_key: Option<PathBuf>,
    /// Default private key for `decrypt` and `reencrypt`
    pub private_key: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            workers: 1,
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            encrypted_suffix: ".c4gh".into(),
        }
    }
}

impl SealConfig {
    /// Read and validate a config file. A missing file yields defaults.
    pub fn from_file(path: &Path) -> SealResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: SealConfig = toml::from_str(&content).map_err(|e| {
            SealError::Configuration(format!("parsing config {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SealResult<()> {
        if self.crypto.chunk_size == 0 || self.crypto.chunk_size > MAX_CHUNK_SIZE {
            return Err(SealError::Configuration(format!(
                "chunk_size must be between 1 and {MAX_CHUNK_SIZE}, got {}",
                self.crypto.chunk_size
            )));
        }
        if self.output.encrypted_suffix.is_empty() {
            return Err(SealError::Configuration(
                "output.encrypted_suffix must not be empty".into(),
            ));
        }
        if !matches!(self.logging.format.as_str(), "json" | "text") {
            return Err(SealError::Configuration(format!(
                "logging.format must be \"json\" or \"text\", got {:?}",
                self.logging.format
            )));
        }
        Ok(())
    }
}
