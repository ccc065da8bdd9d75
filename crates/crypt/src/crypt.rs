//! The process-wide engine handle shared by every context.

use std::sync::Arc;
use std::time::Duration;

use bson::Document;
use common::protocol::{IV_LEN, KEY_LEN};
use common::CryptError;
use tracing::info;

use crate::config::CryptConfig;
use crate::crypto::{self, cipher, KeyMaterial};
use crate::key_broker::{KeyBroker, KeyDocument, KeyId, MasterKey};
use crate::schema::SchemaCache;

/// Engine state shared by contexts. Cloning is cheap and shares the schema
/// cache.
#[derive(Debug, Clone)]
pub struct Crypt {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: CryptConfig,
    local_master_key: Option<KeyMaterial>,
    schema_cache: SchemaCache,
}

impl Crypt {
    /// Validate `config`, initialise the crypto layer and build the engine.
    ///
    /// # Errors
    ///
    /// Returns [`CryptError::Client`] for an invalid configuration, or the
    /// crypto layer's self-test failure.
    pub fn new(config: CryptConfig) -> Result<Self, CryptError> {
        config.validate()?;
        crypto::init()?;

        let local_master_key = config
            .local_master_key
            .as_deref()
            .map(KeyMaterial::from_slice)
            .transpose()?;
        let schema_cache = SchemaCache::new(Duration::from_secs(config.schema_cache_ttl_secs));

        info!(
            version = crate::version(),
            local_kms = local_master_key.is_some(),
            aws_kms = config.aws.is_some(),
            "crypt engine initialised"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                local_master_key,
                schema_cache,
            }),
        })
    }

    /// The validated configuration.
    pub fn config(&self) -> &CryptConfig {
        &self.inner.config
    }

    /// The namespace to schema cache shared by every context.
    pub fn schema_cache(&self) -> &SchemaCache {
        &self.inner.schema_cache
    }

    /// A fresh key broker for one context.
    pub(crate) fn key_broker(&self) -> KeyBroker {
        KeyBroker::new(
            self.inner.local_master_key.clone(),
            self.inner.config.aws.is_some(),
        )
    }

    /// Create a random data key wrapped with the local master key.
    ///
    /// Returns the key vault document to insert; the plaintext key never
    /// leaves this function.
    ///
    /// # Errors
    ///
    /// Returns [`CryptError::Client`] if no local master key is configured.
    pub fn generate_local_data_key(&self, alt_names: &[&str]) -> Result<Document, CryptError> {
        let master = self
            .inner
            .local_master_key
            .as_ref()
            .ok_or_else(|| CryptError::client("no local master key configured"))?;

        let data_key = KeyMaterial::from_slice(&cipher::random_bytes(KEY_LEN)?)?;
        let iv = cipher::random_bytes(IV_LEN)?;
        let wrapped = cipher::encrypt(&iv, None, master.as_bytes(), data_key.as_bytes())?;

        let key = KeyDocument {
            id: KeyId::new_random(),
            alt_names: alt_names.iter().map(|n| (*n).to_owned()).collect(),
            key_material: wrapped,
            master_key: MasterKey::Local,
        };
        info!(key_id = %key.id, "generated local data key");
        Ok(key.to_document())
    }
}
