//! Decrypt-side payload: collect the keys referenced by ciphertexts, then
//! rewrite every ciphertext back to its value.

use common::CryptError;
use tracing::debug;

use super::State;
use crate::buffer::Buffer;
use crate::ciphertext::Ciphertext;
use crate::key_broker::KeyBroker;
use crate::traverse::{self, BlobKind};

#[derive(Debug)]
pub(crate) struct DecryptPayload {
    original_doc: Buffer<'static>,
    decrypted_doc: Buffer<'static>,
}

impl DecryptPayload {
    /// Validate `doc` and request the key of every ciphertext in it.
    pub(crate) fn new(doc: &[u8], kb: &mut KeyBroker) -> Result<(Self, State), CryptError> {
        let original_doc = Buffer::from(doc).copy_to_owned();
        let parsed = original_doc.to_document()?;

        let mut count = 0usize;
        traverse::visit(&parsed, BlobKind::Ciphertext, &mut |bytes| {
            let ciphertext = Ciphertext::parse(bytes)?;
            kb.add_id(ciphertext.key_id)?;
            count += 1;
            Ok(())
        })?;
        debug!(ciphertexts = count, "decrypt context scanned document");

        let next = if count == 0 {
            State::NothingToDo
        } else {
            State::NeedMongoKeys
        };
        Ok((
            Self {
                original_doc,
                decrypted_doc: Buffer::empty(),
            },
            next,
        ))
    }

    pub(crate) fn output(&self) -> &[u8] {
        &self.decrypted_doc
    }

    pub(crate) fn finalize(&mut self, kb: &mut KeyBroker) -> Result<(), CryptError> {
        let mut doc = self.original_doc.to_document()?;
        traverse::transform(&mut doc, BlobKind::Ciphertext, &mut |bytes| {
            Ciphertext::parse(bytes)?.decrypt(kb)
        })?;
        self.decrypted_doc = Buffer::from_document(&doc)?;
        Ok(())
    }

    pub(crate) fn finalize_unchanged(&mut self) {
        self.decrypted_doc = self.original_doc.copy_to_owned();
    }

    pub(crate) fn cleanup(&mut self) {
        self.original_doc.release();
        self.decrypted_doc.release();
    }
}
