//! Configuration loading and validation for the driver.
//!
//! Values come from environment variables:
//!
//! | Variable                | Meaning                                   | Default |
//! |-------------------------|-------------------------------------------|---------|
//! | `LOCAL_MASTER_KEY`      | base64 of the 96-byte local master key    | unset   |
//! | `AWS_REGION`            | enables the AWS KMS provider              | unset   |
//! | `SCHEMA_CACHE_TTL_SECS` | lifetime of a cached collection schema    | `60`    |
//! | `LOG_LEVEL`             | tracing filter when `RUST_LOG` is unset   | `info`  |

use std::fmt;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use fle_crypt::{AwsKmsConfig, CryptConfig};
use serde::Deserialize;

/// Validated driver configuration.
#[derive(Clone, Deserialize)]
pub struct DriverConfig {
    #[serde(default)]
    pub local_master_key: Option<String>,

    #[serde(default)]
    pub aws_region: Option<String>,

    #[serde(default = "default_schema_cache_ttl")]
    pub schema_cache_ttl_secs: u64,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_schema_cache_ttl() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".into()
}

impl DriverConfig {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed or the resulting
    /// encryption configuration is invalid.
    pub fn from_env() -> Result<Self> {
        Self::load(config::Environment::default())
    }

    fn load(source: config::Environment) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(source)
            .build()
            .context("failed to build configuration from environment")?;

        let c: DriverConfig = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    fn validate(&self) -> Result<()> {
        if self.log_level.trim().is_empty() {
            anyhow::bail!("LOG_LEVEL must not be empty");
        }
        self.crypt_config()?
            .validate()
            .context("invalid encryption configuration")?;
        Ok(())
    }

    /// The engine configuration these settings describe.
    ///
    /// # Errors
    ///
    /// Returns an error if `LOCAL_MASTER_KEY` is not valid base64.
    pub fn crypt_config(&self) -> Result<CryptConfig> {
        let local_master_key = self
            .local_master_key
            .as_deref()
            .map(|encoded| STANDARD.decode(encoded.trim()))
            .transpose()
            .context("LOCAL_MASTER_KEY must be base64")?;

        Ok(CryptConfig {
            local_master_key,
            aws: self
                .aws_region
                .clone()
                .map(|region| AwsKmsConfig { region }),
            schema_cache_ttl_secs: self.schema_cache_ttl_secs,
        })
    }
}

impl fmt::Debug for DriverConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverConfig")
            .field(
                "local_master_key",
                &self.local_master_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("aws_region", &self.aws_region)
            .field("schema_cache_ttl_secs", &self.schema_cache_ttl_secs)
            .field("log_level", &self.log_level)
            .finish()
    }
}
