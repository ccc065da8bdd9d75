//! Key ids and key-vault documents.

use std::fmt;

use bson::{doc, spec::BinarySubtype, Binary, Bson, Document, RawBsonRef};
use common::protocol::KEY_ID_LEN;
use common::{CryptError, KmsProvider};
use uuid::Uuid;

/// Opaque 16-byte identifier of a data key, stored as a BSON UUID binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(Uuid);

impl KeyId {
    /// A fresh random (v4) key id.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Build a key id from exactly [`KEY_ID_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != KEY_ID_LEN {
            return None;
        }
        Uuid::from_slice(bytes).ok().map(Self)
    }

    /// Read a key id from a borrowed BSON value; it must be a 16-byte UUID binary.
    pub fn from_raw(value: RawBsonRef<'_>) -> Option<Self> {
        match value {
            RawBsonRef::Binary(bin) if bin.subtype == BinarySubtype::Uuid => {
                Self::from_slice(bin.bytes)
            }
            _ => None,
        }
    }

    /// Read a key id from an owned BSON value; it must be a 16-byte UUID binary.
    pub fn from_bson(value: &Bson) -> Option<Self> {
        match value {
            Bson::Binary(bin) if bin.subtype == BinarySubtype::Uuid => Self::from_slice(&bin.bytes),
            _ => None,
        }
    }

    /// The raw UUID bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_ID_LEN] {
        self.0.as_bytes()
    }

    /// Encode as a BSON UUID binary.
    pub fn to_bson(&self) -> Bson {
        Bson::Binary(Binary {
            subtype: BinarySubtype::Uuid,
            bytes: self.as_bytes().to_vec(),
        })
    }
}

impl From<Uuid> for KeyId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// The `masterKey` sub-document: which KMS wraps a data key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterKey {
    /// Wrapped with the locally configured master key.
    Local,
    /// Wrapped with an AWS KMS customer master key.
    Aws { region: String, key: String },
}

impl MasterKey {
    /// The KMS that wrapped the key.
    pub fn provider(&self) -> KmsProvider {
        match self {
            MasterKey::Local => KmsProvider::Local,
            MasterKey::Aws { .. } => KmsProvider::Aws,
        }
    }

    fn parse(doc: &Document) -> Result<Self, CryptError> {
        let provider = doc
            .get_str("provider")
            .map_err(|_| invalid("'masterKey.provider' must be a string"))?;
        match KmsProvider::from_name(provider) {
            Some(KmsProvider::Local) => Ok(MasterKey::Local),
            Some(KmsProvider::Aws) => {
                let region = doc
                    .get_str("region")
                    .map_err(|_| invalid("'masterKey.region' must be a string"))?;
                let key = doc
                    .get_str("key")
                    .map_err(|_| invalid("'masterKey.key' must be a string"))?;
                Ok(MasterKey::Aws {
                    region: region.to_owned(),
                    key: key.to_owned(),
                })
            }
            None => Err(invalid(&format!("unsupported KMS provider '{provider}'"))),
        }
    }

    fn to_document(&self) -> Document {
        match self {
            MasterKey::Local => doc! { "provider": "local" },
            MasterKey::Aws { region, key } => doc! {
                "provider": "aws",
                "region": region.as_str(),
                "key": key.as_str(),
            },
        }
    }
}

/// A parsed document from the key vault collection.
///
/// Only the fields the broker needs are kept; anything else in the source
/// document is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDocument {
    pub id: KeyId,
    pub alt_names: Vec<String>,
    /// Data key bytes, still wrapped by the master key.
    pub key_material: Vec<u8>,
    pub master_key: MasterKey,
}

impl KeyDocument {
    /// Parse and validate a key vault document.
    ///
    /// # Errors
    ///
    /// Returns [`CryptError::Client`] naming the first missing or mistyped field.
    pub fn parse(doc: &Document) -> Result<Self, CryptError> {
        let id = doc
            .get("_id")
            .and_then(KeyId::from_bson)
            .ok_or_else(|| invalid("'_id' must be a UUID"))?;

        let key_material = match doc.get("keyMaterial") {
            Some(Bson::Binary(bin)) if !bin.bytes.is_empty() => bin.bytes.clone(),
            _ => return Err(invalid("'keyMaterial' must be non-empty binary")),
        };

        let master_key = doc
            .get_document("masterKey")
            .map_err(|_| invalid("'masterKey' must be a document"))
            .and_then(MasterKey::parse)?;

        let alt_names = match doc.get("keyAltNames") {
            None | Some(Bson::Null) => Vec::new(),
            Some(Bson::Array(names)) => names
                .iter()
                .map(|n| match n {
                    Bson::String(s) => Ok(s.clone()),
                    _ => Err(invalid("'keyAltNames' must only contain strings")),
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => return Err(invalid("'keyAltNames' must be an array")),
        };

        Ok(Self {
            id,
            alt_names,
            key_material,
            master_key,
        })
    }

    /// Render as a document suitable for insertion into a key vault.
    pub fn to_document(&self) -> Document {
        let mut out = doc! {
            "_id": self.id.to_bson(),
            "keyMaterial": Bson::Binary(Binary {
                subtype: BinarySubtype::Generic,
                bytes: self.key_material.clone(),
            }),
            "masterKey": self.master_key.to_document(),
        };
        if !self.alt_names.is_empty() {
            out.insert("keyAltNames", self.alt_names.clone());
        }
        out
    }

    /// Returns `true` if `name` is one of the key's alt names.
    pub fn has_alt_name(&self, name: &str) -> bool {
        self.alt_names.iter().any(|n| n == name)
    }
}

fn invalid(detail: &str) -> CryptError {
    CryptError::client(format!("invalid key document: {detail}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: KeyId) -> Document {
        doc! {
            "_id": id.to_bson(),
            "keyMaterial": Bson::Binary(Binary { subtype: BinarySubtype::Generic, bytes: vec![1, 2, 3] }),
            "masterKey": { "provider": "aws", "region": "us-east-1", "key": "arn:aws:kms:us-east-1:1:key/k" },
            "keyAltNames": ["payments", "ssn"],
            "status": 0,
        }
    }

    #[test]
    fn key_id_requires_uuid_subtype_and_length() {
        let good = Bson::Binary(Binary { subtype: BinarySubtype::Uuid, bytes: vec![0; 16] });
        let wrong_subtype = Bson::Binary(Binary { subtype: BinarySubtype::Generic, bytes: vec![0; 16] });
        let wrong_len = Bson::Binary(Binary { subtype: BinarySubtype::Uuid, bytes: vec![0; 15] });
        assert!(KeyId::from_bson(&good).is_some());
        assert!(KeyId::from_bson(&wrong_subtype).is_none());
        assert!(KeyId::from_bson(&wrong_len).is_none());
        assert!(KeyId::from_bson(&Bson::String("x".into())).is_none());
    }

    #[test]
    fn parses_aws_key_document() {
        let id = KeyId::new_random();
        let parsed = KeyDocument::parse(&sample(id)).unwrap();
        assert_eq!(parsed.id, id);
        assert_eq!(parsed.key_material, vec![1, 2, 3]);
        assert_eq!(parsed.master_key.provider(), KmsProvider::Aws);
        assert!(parsed.has_alt_name("ssn"));
        assert!(!parsed.has_alt_name("other"));
    }

    #[test]
    fn to_document_round_trip() {
        let parsed = KeyDocument::parse(&sample(KeyId::new_random())).unwrap();
        assert_eq!(KeyDocument::parse(&parsed.to_document()).unwrap(), parsed);
    }

    #[test]
    fn rejects_missing_id() {
        let mut doc = sample(KeyId::new_random());
        doc.remove("_id");
        let err = KeyDocument::parse(&doc).unwrap_err();
        assert!(err.to_string().contains("'_id'"));
    }

    #[test]
    fn rejects_unknown_provider() {
        let mut doc = sample(KeyId::new_random());
        doc.insert("masterKey", doc! { "provider": "gcp" });
        let err = KeyDocument::parse(&doc).unwrap_err();
        assert!(err.to_string().contains("unsupported KMS provider 'gcp'"));
    }

    #[test]
    fn rejects_non_string_alt_name() {
        let mut doc = sample(KeyId::new_random());
        doc.insert("keyAltNames", vec![Bson::Int32(1)]);
        assert!(KeyDocument::parse(&doc).is_err());
    }

    #[test]
    fn aws_master_key_requires_region() {
        let mut doc = sample(KeyId::new_random());
        doc.insert("masterKey", doc! { "provider": "aws", "key": "k" });
        assert!(KeyDocument::parse(&doc).is_err());
    }
}
