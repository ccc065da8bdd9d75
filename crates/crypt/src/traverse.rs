//! Recursive walks over documents looking for encrypted-subtype binaries.

use bson::{spec::BinarySubtype, Binary, Bson, Document};
use common::protocol::MARKING_VERSION;
use common::{Algorithm, CryptError};

/// Which subtype-6 binaries a walk is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlobKind {
    /// Lead byte 0: placeholders to encrypt.
    Marking,
    /// Lead byte 1 or 2: values to decrypt.
    Ciphertext,
}

impl BlobKind {
    fn matches(self, bin: &Binary) -> bool {
        if bin.subtype != BinarySubtype::Encrypted {
            return false;
        }
        match (self, bin.bytes.first()) {
            (BlobKind::Marking, Some(&lead)) => lead == MARKING_VERSION,
            (BlobKind::Ciphertext, Some(&lead)) => Algorithm::from_blob_subtype(lead).is_some(),
            (_, None) => false,
        }
    }
}

/// Call `visit` with the bytes of every matching binary in `doc`, depth first.
pub(crate) fn visit<F>(doc: &Document, kind: BlobKind, f: &mut F) -> Result<(), CryptError>
where
    F: FnMut(&[u8]) -> Result<(), CryptError>,
{
    for value in doc.values() {
        visit_value(value, kind, f)?;
    }
    Ok(())
}

fn visit_value<F>(value: &Bson, kind: BlobKind, f: &mut F) -> Result<(), CryptError>
where
    F: FnMut(&[u8]) -> Result<(), CryptError>,
{
    match value {
        Bson::Document(doc) => {
            for child in doc.values() {
                visit_value(child, kind, f)?;
            }
        }
        Bson::Array(items) => {
            for child in items {
                visit_value(child, kind, f)?;
            }
        }
        Bson::Binary(bin) if kind.matches(bin) => f(&bin.bytes)?,
        _ => {}
    }
    Ok(())
}

/// Replace every matching binary in `doc` with the value `transform` returns
/// for its bytes.
pub(crate) fn transform<F>(
    doc: &mut Document,
    kind: BlobKind,
    f: &mut F,
) -> Result<(), CryptError>
where
    F: FnMut(&[u8]) -> Result<Bson, CryptError>,
{
    for (_, value) in doc.iter_mut() {
        transform_value(value, kind, f)?;
    }
    Ok(())
}

fn transform_value<F>(value: &mut Bson, kind: BlobKind, f: &mut F) -> Result<(), CryptError>
where
    F: FnMut(&[u8]) -> Result<Bson, CryptError>,
{
    let replacement = match value {
        Bson::Document(doc) => {
            for (_, child) in doc.iter_mut() {
                transform_value(child, kind, f)?;
            }
            None
        }
        Bson::Array(items) => {
            for child in items.iter_mut() {
                transform_value(child, kind, f)?;
            }
            None
        }
        Bson::Binary(bin) if kind.matches(bin) => Some(f(&bin.bytes)?),
        _ => None,
    };
    if let Some(replacement) = replacement {
        *value = replacement;
    }
    Ok(())
}
