//! Marking parser and marking-to-ciphertext transform.
//!
//! A marking is the placeholder the query-analysis service leaves in a command
//! where a plaintext value must be encrypted:
//!
//! ```text
//! [0x00][BSON document { ki | ka, iv?, v, a }]
//! ```
//!
//! | field | type            | meaning                                    |
//! |-------|-----------------|--------------------------------------------|
//! | `ki`  | UUID binary     | key id (exclusive with `ka`)               |
//! | `ka`  | string          | key alt name (exclusive with `ki`)         |
//! | `iv`  | 16-byte binary  | required iff `a` is deterministic          |
//! | `v`   | any             | the plaintext                              |
//! | `a`   | int32           | 1 deterministic, 2 random                  |
//!
//! Any other field is rejected.

use bson::{Document, RawBsonRef, RawDocument};
use common::protocol::{IV_LEN, MARKING_MIN_LEN, MARKING_VERSION};
use common::{Algorithm, CryptError};

use crate::ciphertext::Ciphertext;
use crate::crypto::cipher;
use crate::key_broker::{KeyBroker, KeyId, KeyRef};
use crate::value;

/// A parsed marking.
///
/// `value` borrows from the bytes the marking was parsed from, so a marking
/// cannot outlive its source. Everything else is owned.
#[derive(Debug, Clone)]
pub struct Marking<'a> {
    key: KeyRef,
    iv: Option<[u8; IV_LEN]>,
    algorithm: Algorithm,
    value: RawBsonRef<'a>,
}

impl<'a> Marking<'a> {
    /// Parse and validate a marking blob.
    ///
    /// # Errors
    ///
    /// Returns [`CryptError::Client`] describing the first violated rule.
    pub fn parse(input: &'a [u8]) -> Result<Self, CryptError> {
        if input.len() < MARKING_MIN_LEN {
            return Err(CryptError::client("invalid marking, length < 5"));
        }
        if input[0] != MARKING_VERSION {
            return Err(CryptError::client("invalid marking, first byte must be 0"));
        }

        let raw = RawDocument::from_bytes(&input[1..])
            .map_err(|_| CryptError::client("invalid BSON"))?;
        // Validate the whole document, nested values included, before reading it.
        Document::try_from(raw).map_err(|_| CryptError::client("invalid BSON"))?;

        let mut key_id: Option<KeyId> = None;
        let mut alt_name: Option<String> = None;
        let mut iv: Option<[u8; IV_LEN]> = None;
        let mut v: Option<RawBsonRef<'a>> = None;
        let mut algorithm: Option<Algorithm> = None;
        let mut has_iv = false;

        for element in raw.iter() {
            let (field, element) = element.map_err(|_| CryptError::client("invalid BSON"))?;
            match field {
                "ki" => {
                    key_id = Some(
                        KeyId::from_raw(element)
                            .ok_or_else(|| CryptError::client("key id must be a UUID"))?,
                    );
                }
                "ka" => {
                    let name = element
                        .as_str()
                        .ok_or_else(|| CryptError::client("key alt name must be a UTF8"))?;
                    // The element view dies with `input`; keep an owned copy.
                    alt_name = Some(name.to_owned());
                }
                "iv" => {
                    has_iv = true;
                    let bin = element.as_binary().ok_or_else(|| {
                        CryptError::client("invalid marking, 'iv' is invalid binary")
                    })?;
                    let bytes: [u8; IV_LEN] = bin
                        .bytes
                        .try_into()
                        .map_err(|_| CryptError::client("iv must be 16 bytes"))?;
                    iv = Some(bytes);
                }
                "v" => {
                    v = Some(element);
                }
                "a" => {
                    let code = element.as_i32().ok_or_else(|| {
                        CryptError::client("invalid marking, 'a' must be an int32")
                    })?;
                    algorithm = Some(Algorithm::from_code(code).ok_or_else(|| {
                        CryptError::client(format!("invalid algorithm value: {code}"))
                    })?);
                }
                other => {
                    return Err(CryptError::client(format!("unrecognized field '{other}'")));
                }
            }
        }

        let value = v.ok_or_else(|| CryptError::client("no 'v' specified"))?;

        let key = match (key_id, alt_name) {
            (None, None) => {
                return Err(CryptError::client("neither 'ki' nor 'ka' specified"))
            }
            (Some(id), None) => KeyRef::Id(id),
            (None, Some(name)) => KeyRef::AltName(name),
            (Some(_), Some(_)) => {
                return Err(CryptError::client("both 'ki' and 'ka' specified"))
            }
        };

        let algorithm = algorithm.ok_or_else(|| CryptError::client("no 'a' specified"))?;

        match algorithm {
            Algorithm::Deterministic if !has_iv => {
                return Err(CryptError::client(
                    "deterministic encryption but no 'iv' present",
                ))
            }
            Algorithm::Random if has_iv => {
                return Err(CryptError::client("random encryption but 'iv' present"))
            }
            _ => {}
        }

        Ok(Self {
            key,
            iv,
            algorithm,
            value,
        })
    }

    /// The key the value must be encrypted with.
    pub fn key(&self) -> &KeyRef {
        &self.key
    }

    /// The IV for deterministic encryption.
    pub fn iv(&self) -> Option<&[u8; IV_LEN]> {
        self.iv.as_ref()
    }

    /// Deterministic or random.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The plaintext, borrowed from the marking's source bytes.
    pub fn value(&self) -> RawBsonRef<'a> {
        self.value
    }

    /// Encrypt the marked value with the key it references.
    ///
    /// The IV comes from the marking for deterministic encryption and from the
    /// CSPRNG for random encryption. The ciphertext always carries the id of
    /// the resolved key, even when the marking named it by alt name.
    ///
    /// # Errors
    ///
    /// A failed key lookup returns the broker's own error unchanged. Cipher
    /// failures propagate as-is.
    pub fn to_ciphertext(&self, kb: &mut KeyBroker) -> Result<Ciphertext, CryptError> {
        let key = match &self.key {
            KeyRef::AltName(name) => kb.decrypted_key_by_name(name)?,
            KeyRef::Id(id) => kb.decrypted_key_by_id(id)?,
        };

        let plaintext = value::to_bytes(self.value);
        let expected_len = cipher::ciphertext_len(plaintext.len());
        let mut data = vec![0u8; expected_len];

        let iv = match (self.algorithm, &self.iv) {
            (Algorithm::Deterministic, Some(iv)) => iv.to_vec(),
            (Algorithm::Random, None) => cipher::random_bytes(IV_LEN)?,
            _ => {
                return Err(CryptError::Internal(
                    "marking iv does not match its algorithm".into(),
                ))
            }
        };

        let written =
            cipher::encrypt_into(&iv, None, key.material.as_bytes(), &plaintext, &mut data)?;
        debug_assert_eq!(written, expected_len, "ciphertext length function disagrees with cipher");
        if written != expected_len {
            return Err(CryptError::Internal(format!(
                "wrote {written} ciphertext bytes, expected {expected_len}"
            )));
        }

        Ok(Ciphertext {
            key_id: key.id,
            original_bson_type: self.value.element_type() as u8,
            blob_subtype: self.algorithm,
            data,
        })
    }
}
