//! Conversion between BSON values and the raw value bytes that get encrypted.
//!
//! The plaintext of an encrypted field is the value's BSON encoding without
//! its element header (type byte and key). The type byte travels separately
//! in the ciphertext as `original_bson_type`.

use bson::{spec::ElementType, Bson, Document, RawBsonRef, RawDocumentBuf};
use common::CryptError;

// A wrapper document with an empty key: len (4) + type (1) + "\0" (1).
const WRAPPER_HEADER_LEN: usize = 6;

/// The raw encoded bytes of `value`, without type tag or key.
pub(crate) fn to_bytes(value: RawBsonRef<'_>) -> Vec<u8> {
    let mut wrapper = RawDocumentBuf::new();
    wrapper.append("", value.to_raw_bson());
    let bytes = wrapper.into_bytes();
    bytes[WRAPPER_HEADER_LEN..bytes.len() - 1].to_vec()
}

/// Rebuild a value from its type tag and raw encoded bytes.
///
/// # Errors
///
/// Returns [`CryptError::Client`] if `bson_type` is not a BSON type or the
/// bytes do not decode as a value of that type.
pub(crate) fn from_bytes(bson_type: u8, bytes: &[u8]) -> Result<Bson, CryptError> {
    if ElementType::from(bson_type).is_none() {
        return Err(CryptError::client(format!(
            "invalid original BSON type: 0x{bson_type:02x}"
        )));
    }

    let total = WRAPPER_HEADER_LEN + bytes.len() + 1;
    let len = i32::try_from(total)
        .map_err(|_| CryptError::client("decrypted value too large"))?;
    let mut wrapper = Vec::with_capacity(total);
    wrapper.extend_from_slice(&len.to_le_bytes());
    wrapper.push(bson_type);
    wrapper.push(0);
    wrapper.extend_from_slice(bytes);
    wrapper.push(0);

    let mut doc = Document::from_reader(wrapper.as_slice())
        .map_err(|e| CryptError::client(format!("decrypted value is not valid BSON: {e}")))?;
    doc.remove("")
        .ok_or_else(|| CryptError::client("decrypted value is not valid BSON"))
}
