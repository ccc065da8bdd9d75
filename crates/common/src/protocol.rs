//! Wire-level constants and small protocol types.
//!
//! These values are fixed by the binary formats exchanged with the
//! query-analysis service and stored in encrypted documents; they must never
//! change.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Binary blobs
// ---------------------------------------------------------------------------

/// Lead byte of a marking blob.
pub const MARKING_VERSION: u8 = 0;

/// Minimum length of a marking blob: the lead byte plus an empty document.
pub const MARKING_MIN_LEN: usize = 5;

/// Byte length of a key id.
pub const KEY_ID_LEN: usize = 16;

/// Byte length of an initialisation vector.
pub const IV_LEN: usize = 16;

/// Byte length of a data encryption key.
pub const KEY_LEN: usize = 96;

// ---------------------------------------------------------------------------
// Algorithms
// ---------------------------------------------------------------------------

/// Field encryption algorithm.
///
/// The discriminant is both the `a` value in a marking and the lead byte
/// (blob subtype) of the resulting ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Algorithm {
    /// Caller-supplied IV; equal plaintexts encrypt equally.
    Deterministic = 1,
    /// Fresh random IV per value.
    Random = 2,
}

impl Algorithm {
    /// Map a marking `a` value to an algorithm.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Algorithm::Deterministic),
            2 => Some(Algorithm::Random),
            _ => None,
        }
    }

    /// Map a ciphertext lead byte to an algorithm.
    pub fn from_blob_subtype(subtype: u8) -> Option<Self> {
        Self::from_code(i32::from(subtype))
    }

    /// The numeric code carried in markings and ciphertexts.
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::Deterministic => f.write_str("deterministic"),
            Algorithm::Random => f.write_str("random"),
        }
    }
}

// ---------------------------------------------------------------------------
// KMS providers
// ---------------------------------------------------------------------------

/// Which key-management service wraps a data key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KmsProvider {
    /// Wrapped with a locally held 96-byte master key.
    Local,
    /// Wrapped with an AWS KMS customer master key.
    Aws,
}

impl KmsProvider {
    /// Parse the `masterKey.provider` string of a key document.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "local" => Some(KmsProvider::Local),
            "aws" => Some(KmsProvider::Aws),
            _ => None,
        }
    }

    /// The `masterKey.provider` string.
    pub fn name(self) -> &'static str {
        match self {
            KmsProvider::Local => "local",
            KmsProvider::Aws => "aws",
        }
    }
}
