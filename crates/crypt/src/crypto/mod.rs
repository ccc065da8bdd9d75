//! AEAD primitive, CSPRNG, and key material handling.
//!
//! This module is intentionally free of document and broker dependencies.
//! It provides the low-level encrypt/decrypt operations used by the marking
//! transform, the ciphertext format, and local key unwrapping.

pub mod cipher;
pub mod key;

pub use cipher::{ciphertext_len, CipherError};
pub use key::KeyMaterial;

use std::sync::OnceLock;

use common::protocol::{IV_LEN, KEY_LEN};
use common::CryptError;
use tracing::debug;

static INIT: OnceLock<Result<(), CryptError>> = OnceLock::new();

/// One-time, process-wide initialisation of the crypto layer.
///
/// Runs a known-answer round trip through the AEAD and draws from the CSPRNG
/// exactly once per process. Later calls return the memoised outcome.
pub fn init() -> Result<(), CryptError> {
    INIT.get_or_init(self_test).clone()
}

fn self_test() -> Result<(), CryptError> {
    let key: Vec<u8> = (0..KEY_LEN as u8).collect();
    let iv = [0x5Au8; IV_LEN];
    let plaintext = b"fle-crypt self test";

    let encrypted = cipher::encrypt(&iv, Some(&b"aad"[..]), &key, plaintext)?;
    let again = cipher::encrypt(&iv, Some(&b"aad"[..]), &key, plaintext)?;
    if encrypted != again {
        return Err(CryptError::Internal(
            "crypto self test: deterministic encryption is not deterministic".into(),
        ));
    }
    if cipher::decrypt(Some(&b"aad"[..]), &key, &encrypted)? != plaintext {
        return Err(CryptError::Internal(
            "crypto self test: round trip mismatch".into(),
        ));
    }
    cipher::random_bytes(IV_LEN)?;

    debug!("crypto layer initialised");
    Ok(())
}
