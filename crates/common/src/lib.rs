//! Common types, protocol constants, and errors shared across the field-encryption crates.

pub mod error;
pub mod protocol;

pub use error::{CryptError, Status, StatusKind};
pub use protocol::{Algorithm, KmsProvider};
