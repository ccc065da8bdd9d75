//! AEAD_AES_256_CBC_HMAC_SHA_512 encryption and decryption of single values.
//!
//! **Construction:** encrypt-then-MAC. AES-256-CBC with PKCS#7 padding, then an
//! HMAC-SHA-512 tag truncated to 32 bytes over `AAD || IV || C || AL`, where
//! `AL` is the bit length of the associated data as a big-endian `u64`.
//!
//! **Key layout (96 bytes):** `[0..32)` AES key, `[32..64)` HMAC key,
//! `[64..96)` reserved.
//!
//! **Output layout:** `IV (16) || C || T (32)`.
//!
//! The IV is always supplied by the caller. Deterministic encryption passes
//! the IV from the marking; random encryption passes fresh bytes from
//! [`random_bytes`]. Nothing in this module derives or reuses an IV.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use common::protocol::{IV_LEN, KEY_LEN};
use common::CryptError;
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha512;
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha512 = Hmac<Sha512>;

/// Byte length of the AES-256 sub-key.
pub const ENC_KEY_LEN: usize = 32;

/// Byte length of the HMAC-SHA-512 sub-key.
pub const MAC_KEY_LEN: usize = 32;

/// Byte length of the truncated authentication tag.
pub const HMAC_LEN: usize = 32;

/// AES block size.
pub const BLOCK_LEN: usize = 16;

/// Errors produced by the cipher layer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    /// The key is the wrong length (must be [`KEY_LEN`] bytes).
    #[error("invalid key length: expected {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),

    /// The IV is the wrong length (must be [`IV_LEN`] bytes).
    #[error("invalid iv length: expected {IV_LEN} bytes, got {0}")]
    InvalidIvLength(usize),

    /// The caller-provided output buffer cannot hold the ciphertext.
    #[error("output buffer too small: need {need} bytes, have {have}")]
    OutputTooSmall { need: usize, have: usize },

    /// The ciphertext length is not a valid output of [`encrypt_into`].
    #[error("invalid ciphertext length: {0}")]
    InvalidCiphertextLength(usize),

    /// Tag verification or unpadding failed (wrong key or tampered data).
    #[error("decryption failed: HMAC validation failure")]
    AeadFailure,

    /// The operating system CSPRNG failed.
    #[error("failed to generate random bytes: {0}")]
    Rng(String),
}

impl From<CipherError> for CryptError {
    fn from(err: CipherError) -> Self {
        match err {
            CipherError::OutputTooSmall { .. } => CryptError::Internal(err.to_string()),
            _ => CryptError::Client(err.to_string()),
        }
    }
}

/// Length of the ciphertext produced for a plaintext of `plaintext_len` bytes.
///
/// Depends only on the length: PKCS#7 always adds between 1 and 16 bytes.
pub fn ciphertext_len(plaintext_len: usize) -> usize {
    IV_LEN + (plaintext_len - plaintext_len % BLOCK_LEN + BLOCK_LEN) + HMAC_LEN
}

/// Upper bound on the plaintext length recoverable from `ciphertext_len` bytes,
/// or `None` if no plaintext encrypts to that length.
pub fn plaintext_len(ciphertext_len: usize) -> Option<usize> {
    let body = ciphertext_len.checked_sub(IV_LEN + HMAC_LEN)?;
    if body < BLOCK_LEN || body % BLOCK_LEN != 0 {
        return None;
    }
    Some(body - 1)
}

/// Encrypt `plaintext` into `out` and return the number of bytes written.
///
/// `out` must be at least [`ciphertext_len`]`(plaintext.len())` bytes.
///
/// # Errors
///
/// Returns [`CipherError::InvalidKeyLength`] / [`CipherError::InvalidIvLength`]
/// for malformed inputs and [`CipherError::OutputTooSmall`] if `out` is short.
pub fn encrypt_into(
    iv: &[u8],
    associated_data: Option<&[u8]>,
    key: &[u8],
    plaintext: &[u8],
    out: &mut [u8],
) -> Result<usize, CipherError> {
    let (enc_key, mac_key) = split_key(key)?;
    if iv.len() != IV_LEN {
        return Err(CipherError::InvalidIvLength(iv.len()));
    }
    let need = ciphertext_len(plaintext.len());
    let have = out.len();
    if have < need {
        return Err(CipherError::OutputTooSmall { need, have });
    }

    out[..IV_LEN].copy_from_slice(iv);
    let encryptor = Aes256CbcEnc::new_from_slices(enc_key, iv)
        .map_err(|_| CipherError::InvalidKeyLength(key.len()))?;
    let c_len = encryptor
        .encrypt_padded_b2b_mut::<Pkcs7>(plaintext, &mut out[IV_LEN..])
        .map_err(|_| CipherError::OutputTooSmall { need, have })?
        .len();

    let c_end = IV_LEN + c_len;
    let tag = compute_tag(mac_key, associated_data.unwrap_or_default(), &out[..c_end])?;
    out[c_end..c_end + HMAC_LEN].copy_from_slice(&tag);
    Ok(c_end + HMAC_LEN)
}

/// Encrypt `plaintext` into a freshly allocated buffer.
pub fn encrypt(
    iv: &[u8],
    associated_data: Option<&[u8]>,
    key: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CipherError> {
    let mut out = vec![0u8; ciphertext_len(plaintext.len())];
    let written = encrypt_into(iv, associated_data, key, plaintext, &mut out)?;
    out.truncate(written);
    Ok(out)
}

/// Verify and decrypt a ciphertext produced by [`encrypt_into`].
///
/// # Errors
///
/// Returns [`CipherError::AeadFailure`] if authentication fails (wrong key,
/// wrong associated data, or tampered bytes).
pub fn decrypt(
    associated_data: Option<&[u8]>,
    key: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CipherError> {
    let (enc_key, mac_key) = split_key(key)?;
    if plaintext_len(ciphertext.len()).is_none() {
        return Err(CipherError::InvalidCiphertextLength(ciphertext.len()));
    }

    let (signed, tag) = ciphertext.split_at(ciphertext.len() - HMAC_LEN);
    let mut mac = new_mac(mac_key)?;
    feed_mac(&mut mac, associated_data.unwrap_or_default(), signed);
    mac.verify_truncated_left(tag)
        .map_err(|_| CipherError::AeadFailure)?;

    let (iv, body) = signed.split_at(IV_LEN);
    let decryptor = Aes256CbcDec::new_from_slices(enc_key, iv)
        .map_err(|_| CipherError::InvalidKeyLength(key.len()))?;
    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(body)
        .map_err(|_| CipherError::AeadFailure)
}

/// Fill a new buffer with `len` bytes from the OS CSPRNG.
pub fn random_bytes(len: usize) -> Result<Vec<u8>, CipherError> {
    let mut out = vec![0u8; len];
    OsRng
        .try_fill_bytes(&mut out)
        .map_err(|e| CipherError::Rng(e.to_string()))?;
    Ok(out)
}

fn split_key(key: &[u8]) -> Result<(&[u8], &[u8]), CipherError> {
    if key.len() != KEY_LEN {
        return Err(CipherError::InvalidKeyLength(key.len()));
    }
    Ok((
        &key[..ENC_KEY_LEN],
        &key[ENC_KEY_LEN..ENC_KEY_LEN + MAC_KEY_LEN],
    ))
}

fn new_mac(mac_key: &[u8]) -> Result<HmacSha512, CipherError> {
    <HmacSha512 as Mac>::new_from_slice(mac_key)
        .map_err(|_| CipherError::InvalidKeyLength(mac_key.len()))
}

fn feed_mac(mac: &mut HmacSha512, aad: &[u8], iv_and_ciphertext: &[u8]) {
    let al = (aad.len() as u64 * 8).to_be_bytes();
    mac.update(aad);
    mac.update(iv_and_ciphertext);
    mac.update(&al);
}

fn compute_tag(
    mac_key: &[u8],
    aad: &[u8],
    iv_and_ciphertext: &[u8],
) -> Result<[u8; HMAC_LEN], CipherError> {
    let mut mac = new_mac(mac_key)?;
    feed_mac(&mut mac, aad, iv_and_ciphertext);
    let full = mac.finalize().into_bytes();
    let mut tag = [0u8; HMAC_LEN];
    tag.copy_from_slice(&full[..HMAC_LEN]);
    Ok(tag)
}
