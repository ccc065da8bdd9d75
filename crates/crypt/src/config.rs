//! Engine configuration and its validation.

use std::fmt;

use common::protocol::KEY_LEN;
use common::CryptError;
use serde::Deserialize;
use thiserror::Error;

/// Reasons a [`CryptConfig`] is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("local master key must be {KEY_LEN} bytes, got {0}")]
    InvalidLocalKeyLength(usize),

    #[error("schema cache TTL must be > 0")]
    ZeroSchemaTtl,

    #[error("AWS region must not be empty")]
    EmptyAwsRegion,

    #[error("no KMS provider configured: set a local master key or an AWS region")]
    NoKmsProvider,
}

impl From<ConfigError> for CryptError {
    fn from(err: ConfigError) -> Self {
        CryptError::client(err.to_string())
    }
}

/// AWS KMS settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AwsKmsConfig {
    pub region: String,
}

/// Settings for a [`crate::Crypt`] engine.
#[derive(Clone, Deserialize)]
pub struct CryptConfig {
    /// Raw 96-byte master key for keys whose provider is `"local"`.
    #[serde(default)]
    pub local_master_key: Option<Vec<u8>>,

    #[serde(default)]
    pub aws: Option<AwsKmsConfig>,

    /// How long a fetched collection schema stays cached.
    #[serde(default = "default_schema_cache_ttl")]
    pub schema_cache_ttl_secs: u64,
}

fn default_schema_cache_ttl() -> u64 {
    60
}

impl CryptConfig {
    /// A configuration using only the local KMS provider.
    pub fn local(master_key: impl Into<Vec<u8>>) -> Self {
        Self {
            local_master_key: Some(master_key.into()),
            aws: None,
            schema_cache_ttl_secs: default_schema_cache_ttl(),
        }
    }

    /// Check every field, returning the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(key) = &self.local_master_key {
            if key.len() != KEY_LEN {
                return Err(ConfigError::InvalidLocalKeyLength(key.len()));
            }
        }
        if let Some(aws) = &self.aws {
            if aws.region.trim().is_empty() {
                return Err(ConfigError::EmptyAwsRegion);
            }
        }
        if self.local_master_key.is_none() && self.aws.is_none() {
            return Err(ConfigError::NoKmsProvider);
        }
        if self.schema_cache_ttl_secs == 0 {
            return Err(ConfigError::ZeroSchemaTtl);
        }
        Ok(())
    }
}

impl fmt::Debug for CryptConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptConfig")
            .field(
                "local_master_key",
                &self.local_master_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("aws", &self.aws)
            .field("schema_cache_ttl_secs", &self.schema_cache_ttl_secs)
            .finish()
    }
}
