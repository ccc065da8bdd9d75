//! [`Buffer`]: a byte sequence that either owns its bytes or borrows them.
//!
//! Buffers are how bytes cross every boundary of the core: documents fed in by
//! the caller, requests handed back out, and intermediate values. The
//! ownership tag is the enum variant, so a borrowed buffer can never be freed
//! and an owned buffer is released exactly once by `Drop`.

use std::ops::Deref;

use bson::{Document, RawDocument};
use common::CryptError;

/// Owned-or-borrowed byte sequence.
#[derive(Debug, Clone)]
pub enum Buffer<'a> {
    /// Bytes exclusively owned by this buffer.
    Owned(Vec<u8>),
    /// A view into a longer-lived buffer, e.g. a document being iterated.
    Borrowed(&'a [u8]),
}

impl<'a> Buffer<'a> {
    /// Create an owned, zero-initialised buffer of `len` bytes.
    pub fn new_owned(len: usize) -> Buffer<'static> {
        Buffer::Owned(vec![0u8; len])
    }

    /// Wrap borrowed bytes without copying.
    pub fn borrowed(bytes: &'a [u8]) -> Self {
        Buffer::Borrowed(bytes)
    }

    /// An empty owned buffer.
    pub fn empty() -> Buffer<'static> {
        Buffer::Owned(Vec::new())
    }

    /// Returns `true` if the buffer owns its bytes.
    pub fn is_owned(&self) -> bool {
        matches!(self, Buffer::Owned(_))
    }

    /// Number of bytes held.
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Returns `true` if the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }

    /// The bytes, owned or borrowed.
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Buffer::Owned(v) => v.as_slice(),
            Buffer::Borrowed(b) => b,
        }
    }

    /// Resize an owned buffer, zero-filling any new bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptError::Client`] if the buffer is borrowed; a borrow
    /// cannot be reallocated.
    pub fn resize(&mut self, len: usize) -> Result<(), CryptError> {
        match self {
            Buffer::Owned(v) => {
                v.resize(len, 0);
                Ok(())
            }
            Buffer::Borrowed(_) => Err(CryptError::client("cannot resize a borrowed buffer")),
        }
    }

    /// Produce an owned copy, regardless of how `self` holds its bytes.
    pub fn copy_to_owned(&self) -> Buffer<'static> {
        Buffer::Owned(self.as_slice().to_vec())
    }

    /// Take the bytes out as a `Vec`, copying only if borrowed.
    pub fn into_vec(self) -> Vec<u8> {
        match self {
            Buffer::Owned(v) => v,
            Buffer::Borrowed(b) => b.to_vec(),
        }
    }

    /// Release the bytes and leave an empty buffer behind.
    ///
    /// Owned bytes are freed; a borrow is simply dropped. Calling this more
    /// than once is a no-op.
    pub fn release(&mut self) {
        *self = Buffer::Borrowed(&[]);
    }

    /// View the bytes as a validated-on-access BSON document.
    pub fn as_raw_document(&self) -> Result<&RawDocument, CryptError> {
        RawDocument::from_bytes(self.as_slice())
            .map_err(|e| CryptError::client(format!("invalid BSON: {e}")))
    }

    /// Fully parse the bytes into an owned [`Document`].
    ///
    /// Every element, including nested documents and arrays, is validated.
    pub fn to_document(&self) -> Result<Document, CryptError> {
        let raw = self.as_raw_document()?;
        Document::try_from(raw).map_err(|e| CryptError::client(format!("invalid BSON: {e}")))
    }

    /// Serialise a document into a new owned buffer.
    pub fn from_document(doc: &Document) -> Result<Buffer<'static>, CryptError> {
        let mut bytes = Vec::new();
        doc.to_writer(&mut bytes)
            .map_err(|e| CryptError::Internal(format!("failed to serialise document: {e}")))?;
        Ok(Buffer::Owned(bytes))
    }
}

impl Default for Buffer<'_> {
    fn default() -> Self {
        Buffer::Borrowed(&[])
    }
}

impl Deref for Buffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for Buffer<'_> {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl PartialEq for Buffer<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for Buffer<'_> {}

impl From<Vec<u8>> for Buffer<'static> {
    fn from(bytes: Vec<u8>) -> Self {
        Buffer::Owned(bytes)
    }
}

impl<'a> From<&'a [u8]> for Buffer<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        Buffer::Borrowed(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn new_owned_is_zeroed() {
        let buf = Buffer::new_owned(8);
        assert!(buf.is_owned());
        assert_eq!(buf.as_slice(), &[0u8; 8]);
    }

    #[test]
    fn borrowed_cannot_resize() {
        let data = [1u8, 2, 3];
        let mut buf = Buffer::borrowed(&data);
        assert!(buf.resize(10).is_err());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn owned_resize_zero_fills() {
        let mut buf = Buffer::from(vec![7u8, 7]);
        buf.resize(4).unwrap();
        assert_eq!(buf.as_slice(), &[7, 7, 0, 0]);
    }

    #[test]
    fn copy_to_owned_detaches_from_source() {
        let data = vec![9u8; 4];
        let copy = {
            let borrowed = Buffer::borrowed(&data);
            borrowed.copy_to_owned()
        };
        drop(data);
        assert!(copy.is_owned());
        assert_eq!(copy.as_slice(), &[9u8; 4]);
    }

    #[test]
    fn release_is_idempotent() {
        let mut buf = Buffer::from(vec![1u8; 16]);
        buf.release();
        assert!(buf.is_empty());
        buf.release();
        assert!(buf.is_empty());
    }

    #[test]
    fn equality_compares_contents() {
        let data = [1u8, 2];
        assert_eq!(Buffer::borrowed(&data), Buffer::from(vec![1u8, 2]));
        assert_ne!(Buffer::borrowed(&data), Buffer::empty());
        assert!(Buffer::default().is_empty());
    }

    #[test]
    fn document_round_trip() {
        let doc = doc! { "a": 1, "b": { "c": "d" } };
        let buf = Buffer::from_document(&doc).unwrap();
        assert_eq!(buf.to_document().unwrap(), doc);
    }

    #[test]
    fn garbage_is_not_a_document() {
        let buf = Buffer::from(vec![0xFFu8, 0, 0, 0, 0]);
        assert!(buf.to_document().is_err());
    }
}
