//! [`KeyMaterial`]: decrypted data-key bytes.

use common::protocol::KEY_LEN;
use common::CryptError;

/// Fixed-size key buffer that holds exactly [`KEY_LEN`] bytes.
///
/// Owned by the key broker and cloned into the call stack of a single
/// encrypt or decrypt. When this type is dropped, the memory is overwritten
/// with zeroes to minimise the window during which plaintext key material
/// lives in RAM.
#[derive(Clone)]
pub struct KeyMaterial(Box<[u8; KEY_LEN]>);

impl KeyMaterial {
    /// Copy `bytes` into a new key buffer.
    ///
    /// # Errors
    ///
    /// Returns [`CryptError::Kms`] if `bytes` is not exactly [`KEY_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptError> {
        if bytes.len() != KEY_LEN {
            return Err(CryptError::kms(format!(
                "decrypted key is incorrect length, expected: {KEY_LEN}, got: {}",
                bytes.len()
            )));
        }
        let mut buf = Box::new([0u8; KEY_LEN]);
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        // Zero the key material on drop.
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material — not even in debug builds.
        f.write_str("KeyMaterial([REDACTED])")
    }
}

impl PartialEq for KeyMaterial {
    fn eq(&self, other: &Self) -> bool {
        self.0[..] == other.0[..]
    }
}

impl Eq for KeyMaterial {}
