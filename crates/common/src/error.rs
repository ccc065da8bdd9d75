//! Error taxonomy shared by the encryption core and its callers.

use std::fmt;

use thiserror::Error;

/// Status code attached to client and KMS errors.
pub const CODE_GENERIC: u32 = 1;

/// Status code attached to internal invariant violations.
pub const CODE_INTERNAL: u32 = 2;

/// Error returned by every fallible operation of the encryption core.
///
/// Variants map to [`StatusKind`] values when recorded in a [`Status`]:
/// - [`CryptError::Client`] → [`StatusKind::Client`]
/// - [`CryptError::Kms`] → [`StatusKind::Kms`]
/// - [`CryptError::Internal`] → [`StatusKind::Client`] with [`CODE_INTERNAL`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptError {
    /// Malformed or policy-violating input: a bad marking, a wrong field type,
    /// an invalid namespace or document, or a hook called in the wrong state.
    #[error("{0}")]
    Client(String),

    /// A failure surfaced from the key broker or key-management path.
    #[error("{0}")]
    Kms(String),

    /// An internal invariant was violated. Indicates a bug, not bad input.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CryptError {
    /// Shorthand for a [`CryptError::Client`] built from anything displayable.
    pub fn client(msg: impl Into<String>) -> Self {
        CryptError::Client(msg.into())
    }

    /// Shorthand for a [`CryptError::Kms`] built from anything displayable.
    pub fn kms(msg: impl Into<String>) -> Self {
        CryptError::Kms(msg.into())
    }

    /// The [`StatusKind`] this error is recorded as.
    pub fn kind(&self) -> StatusKind {
        match self {
            CryptError::Client(_) | CryptError::Internal(_) => StatusKind::Client,
            CryptError::Kms(_) => StatusKind::Kms,
        }
    }

    /// The numeric code this error is recorded with.
    pub fn code(&self) -> u32 {
        match self {
            CryptError::Client(_) | CryptError::Kms(_) => CODE_GENERIC,
            CryptError::Internal(_) => CODE_INTERNAL,
        }
    }
}

/// Classification of a [`Status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusKind {
    /// No error. The only success value.
    #[default]
    Ok,
    /// Client-side error (bad input or misuse).
    Client,
    /// Key-management error.
    Kms,
}

/// Snapshot of the most recent failure of a context or key broker.
///
/// A fresh status is [`StatusKind::Ok`]. It only changes through an explicit
/// [`Status::set`]; nothing clears it afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Status {
    kind: StatusKind,
    code: u32,
    message: String,
    error: Option<CryptError>,
}

impl Status {
    /// A successful status.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `err` in this status, replacing whatever was there.
    pub fn set(&mut self, err: &CryptError) {
        self.kind = err.kind();
        self.code = err.code();
        self.message = err.to_string();
        self.error = Some(err.clone());
    }

    /// Returns `true` if no error has been recorded.
    pub fn is_ok(&self) -> bool {
        self.kind == StatusKind::Ok
    }

    /// The error category, or [`StatusKind::Ok`].
    pub fn kind(&self) -> StatusKind {
        self.kind
    }

    /// Numeric error code; `0` when ok.
    pub fn code(&self) -> u32 {
        self.code
    }

    /// The error message; empty when ok.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The recorded error, if any, cloned verbatim.
    pub fn error(&self) -> Option<CryptError> {
        self.error.clone()
    }
}

impl From<&CryptError> for Status {
    fn from(err: &CryptError) -> Self {
        let mut status = Status::new();
        status.set(err);
        status
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            StatusKind::Ok => f.write_str("ok"),
            StatusKind::Client => write!(f, "client error {}: {}", self.code, self.message),
            StatusKind::Kms => write!(f, "kms error {}: {}", self.code, self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_kinds_and_codes() {
        assert_eq!(CryptError::client("x").kind(), StatusKind::Client);
        assert_eq!(CryptError::kms("x").kind(), StatusKind::Kms);
        assert_eq!(CryptError::Internal("x".into()).kind(), StatusKind::Client);
        assert_eq!(CryptError::client("x").code(), CODE_GENERIC);
        assert_eq!(CryptError::Internal("x".into()).code(), CODE_INTERNAL);
    }

    #[test]
    fn fresh_status_is_ok() {
        let status = Status::new();
        assert!(status.is_ok());
        assert_eq!(status.kind(), StatusKind::Ok);
        assert!(status.error().is_none());
        assert_eq!(status.to_string(), "ok");
    }

    #[test]
    fn set_records_message_verbatim() {
        let err = CryptError::kms("no key found for id");
        let status = Status::from(&err);
        assert_eq!(status.kind(), StatusKind::Kms);
        assert_eq!(status.message(), "no key found for id");
        assert_eq!(status.error(), Some(err));
    }

    #[test]
    fn display_includes_message() {
        let e = CryptError::client("invalid marking, length < 5");
        assert!(e.to_string().contains("length < 5"));
        assert!(Status::from(&e).to_string().starts_with("client error 1"));
    }
}
