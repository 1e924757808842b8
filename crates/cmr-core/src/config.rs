//! Configuration for credential minting and worker channels.

use crate::errors::{CmrError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CmrConfig {
    pub credential: CredentialConfig,
    pub sync: SyncConfig,
}

/// Credential minting configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// Expiry horizon of minted and attenuated credentials, in seconds
    pub ttl_secs: u64,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 60 * 60,
        }
    }
}

impl CredentialConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Worker and watcher channel configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Capacity of sub-worker and watcher channels
    pub channel_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1,
        }
    }
}

impl CmrConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: CmrConfig = toml::from_str(content)
            .map_err(|e| CmrError::not_valid(format!("configuration ({e})")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Apply `CMR_*` environment overrides
    pub fn merge_with_env(&mut self) -> Result<()> {
        self.merge_with_vars(std::env::vars())
    }

    fn merge_with_vars(&mut self, vars: impl IntoIterator<Item = (String, String)>) -> Result<()> {
        for (key, value) in vars {
            match key.as_str() {
                "CMR_CREDENTIAL_TTL_SECS" => {
                    self.credential.ttl_secs = parse_env(&key, &value)?;
                }
                "CMR_CHANNEL_CAPACITY" => {
                    self.sync.channel_capacity = parse_env(&key, &value)?;
                }
                _ => continue,
            }
            tracing::debug!(key = %key, value = %value, "configuration overridden from environment");
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.credential.ttl_secs == 0 {
            return Err(CmrError::not_valid("credential ttl of zero"));
        }
        if self.sync.channel_capacity == 0 {
            return Err(CmrError::not_valid("channel capacity of zero"));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| CmrError::not_valid(format!("{key}={value:?}")))
}
