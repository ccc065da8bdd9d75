//! KMS collaborator: decrypts data keys wrapped by an external KMS.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use fle_crypt::{KmsRequest, MasterKey};
use parking_lot::Mutex;
use tracing::{debug, instrument};

/// Something that can unwrap a data key for a [`KmsRequest`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KmsBackend: Send + Sync {
    /// Return the plaintext data key for `request`.
    async fn decrypt(&self, request: &KmsRequest) -> Result<Vec<u8>>;
}

/// [`KmsBackend`] backed by AWS KMS.
///
/// One client is created per region named by the key documents and reused
/// afterwards; credentials resolve once through the shared [`SdkConfig`].
pub struct AwsKms {
    sdk: SdkConfig,
    clients: Mutex<HashMap<String, aws_sdk_kms::Client>>,
}

impl AwsKms {
    /// Load AWS configuration from the environment, defaulting to `region`.
    pub async fn init(region: &str) -> Self {
        let sdk = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_owned()))
            .load()
            .await;
        Self::from_sdk_config(sdk)
    }

    /// Build from an already loaded SDK configuration.
    pub fn from_sdk_config(sdk: SdkConfig) -> Self {
        Self {
            sdk,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client(&self, region: &str) -> aws_sdk_kms::Client {
        self.clients
            .lock()
            .entry(region.to_owned())
            .or_insert_with(|| {
                aws_sdk_kms::Client::from_conf(
                    aws_sdk_kms::config::Builder::from(&self.sdk)
                        .region(Region::new(region.to_owned()))
                        .build(),
                )
            })
            .clone()
    }
}

#[async_trait]
impl KmsBackend for AwsKms {
    #[instrument(skip_all, fields(key_id = %request.key_id))]
    async fn decrypt(&self, request: &KmsRequest) -> Result<Vec<u8>> {
        let (region, cmk) = match &request.master_key {
            MasterKey::Aws { region, key } => (region, key),
            MasterKey::Local => anyhow::bail!("key {} is not wrapped by AWS KMS", request.key_id),
        };

        let resp = self
            .client(region)
            .decrypt()
            .key_id(cmk)
            .ciphertext_blob(aws_sdk_kms::primitives::Blob::new(request.ciphertext.clone()))
            .send()
            .await
            .context("failed to decrypt data key via KMS")?;

        let plaintext = resp
            .plaintext()
            .context("KMS decrypt response contained no plaintext")?;
        debug!(region = %region, "data key decrypted by AWS KMS");
        Ok(plaintext.as_ref().to_vec())
    }
}
