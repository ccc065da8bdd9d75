//! Binary format of an encrypted field value.
//!
//! # Layout
//!
//! ```text
//! [blob_subtype: 1][key_id: 16][original_bson_type: 1][AEAD output: rest]
//! ```
//!
//! `blob_subtype` is the algorithm code (1 deterministic, 2 random) and
//! distinguishes a ciphertext from a marking (lead byte 0) when both are stored
//! as BSON binary subtype 6.

use bson::{spec::BinarySubtype, Binary, Bson};
use common::protocol::KEY_ID_LEN;
use common::{Algorithm, CryptError};

use crate::crypto::{cipher, KeyMaterial};
use crate::key_broker::{KeyBroker, KeyId};
use crate::value;

/// Bytes before the AEAD output.
pub const HEADER_LEN: usize = 1 + KEY_ID_LEN + 1;

/// A parsed or freshly produced encrypted value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ciphertext {
    pub key_id: KeyId,
    /// BSON type tag of the plaintext before encryption.
    pub original_bson_type: u8,
    pub blob_subtype: Algorithm,
    /// AEAD output: `IV || C || T`.
    pub data: Vec<u8>,
}

impl Ciphertext {
    /// Parse the serialised form.
    ///
    /// # Errors
    ///
    /// Returns [`CryptError::Client`] if the blob is shorter than a header plus
    /// one byte, or if its lead byte is not an algorithm code.
    pub fn parse(bytes: &[u8]) -> Result<Self, CryptError> {
        if bytes.len() <= HEADER_LEN {
            return Err(CryptError::client("malformed ciphertext, too small"));
        }
        let blob_subtype = Algorithm::from_blob_subtype(bytes[0]).ok_or_else(|| {
            CryptError::client("malformed ciphertext, expected blob subtype of 1 or 2")
        })?;
        let key_id = KeyId::from_slice(&bytes[1..1 + KEY_ID_LEN])
            .ok_or_else(|| CryptError::client("malformed ciphertext, invalid key id"))?;

        Ok(Self {
            key_id,
            original_bson_type: bytes[1 + KEY_ID_LEN],
            blob_subtype,
            data: bytes[HEADER_LEN..].to_vec(),
        })
    }

    /// The blob bytes: subtype, key id, BSON type, then the encrypted value.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.data.len());
        out.push(self.blob_subtype.code());
        out.extend_from_slice(self.key_id.as_bytes());
        out.push(self.original_bson_type);
        out.extend_from_slice(&self.data);
        out
    }

    /// The value to store in a document in place of the plaintext.
    pub fn to_bson(&self) -> Bson {
        Bson::Binary(Binary {
            subtype: BinarySubtype::Encrypted,
            bytes: self.serialize(),
        })
    }

    /// Decrypt with key material resolved through `kb`.
    ///
    /// A lookup failure is the broker's own error, returned unchanged.
    pub fn decrypt(&self, kb: &mut KeyBroker) -> Result<Bson, CryptError> {
        let key = kb.decrypted_key_by_id(&self.key_id)?;
        self.decrypt_with(&key.material)
    }

    /// Decrypt with the given key material and rebuild the original value.
    pub fn decrypt_with(&self, key: &KeyMaterial) -> Result<Bson, CryptError> {
        let plaintext = cipher::decrypt(None, key.as_bytes(), &self.data)?;
        value::from_bytes(self.original_bson_type, &plaintext)
    }
}
