//! Client-side field-level encryption core.
//!
//! A [`Crypt`] engine is created once per process from a [`CryptConfig`].
//! Each encryption or decryption is a [`Context`] that the caller drives
//! through its states, running the database and KMS requests the context
//! asks for. The core itself performs no I/O and never blocks.

pub mod buffer;
pub mod ciphertext;
pub mod config;
pub mod crypt;
pub mod crypto;
pub mod ctx;
pub mod key_broker;
pub mod marking;
pub mod schema;

mod traverse;
mod value;

pub use buffer::Buffer;
pub use ciphertext::Ciphertext;
pub use config::{AwsKmsConfig, ConfigError, CryptConfig};
pub use crypt::Crypt;
pub use ctx::{Context, State};
pub use key_broker::{KeyBroker, KeyDocument, KeyId, KeyRef, KmsRequest, MasterKey};
pub use marking::Marking;

pub use common::{Algorithm, CryptError, KmsProvider, Status, StatusKind};

/// Version of this crate.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
