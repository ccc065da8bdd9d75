//! Key broker: resolves key references to decrypted key material.
//!
//! # Lifecycle
//!
//! 1. While markings or ciphertexts are collected, [`KeyBroker::add_id`] and
//!    [`KeyBroker::add_name`] record every key reference that will be needed.
//! 2. [`KeyBroker::filter`] produces the key-vault query; the caller runs it
//!    and hands each returned document to [`KeyBroker::add_doc`].
//! 3. [`KeyBroker::done_adding_docs`] checks that every request was satisfied,
//!    unwraps locally wrapped keys in-process, and leaves AWS-wrapped keys
//!    pending as [`KmsRequest`]s.
//! 4. The caller answers each request through [`KeyBroker::kms_feed`] and
//!    finishes with [`KeyBroker::kms_done`].
//! 5. [`KeyBroker::decrypted_key_by_id`] / [`KeyBroker::decrypted_key_by_name`]
//!    hand out copies of the decrypted material.
//!
//! # Invariants
//!
//! - Every failure is recorded in [`KeyBroker::status`] and returned as the
//!   same error value, so callers can propagate it verbatim.
//! - Resolution fails closed: an alt name claimed by two keys is an error,
//!   never a choice.
//! - Plaintext key material is never logged.

pub mod key_doc;

pub use key_doc::{KeyDocument, KeyId, MasterKey};

use bson::{doc, Bson, Document};
use common::{CryptError, Status};
use tracing::debug;

use crate::crypto::{cipher, KeyMaterial};

/// A reference to a data key, as carried by a marking.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyRef {
    Id(KeyId),
    AltName(String),
}

/// Decrypted key material together with the id of the key it came from.
#[derive(Debug, Clone)]
pub struct ResolvedKey {
    pub id: KeyId,
    pub material: KeyMaterial,
}

/// A wrapped data key that must be decrypted by an external KMS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmsRequest {
    pub key_id: KeyId,
    pub master_key: MasterKey,
    /// Wrapped key bytes to send to the KMS.
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Requesting,
    AddingDocs,
    Kms,
    Done,
}

#[derive(Debug)]
struct KeyEntry {
    doc: KeyDocument,
    decrypted: Option<KeyMaterial>,
}

/// Per-context key resolution state.
#[derive(Debug)]
pub struct KeyBroker {
    phase: Phase,
    requests: Vec<KeyRef>,
    entries: Vec<KeyEntry>,
    local_master_key: Option<KeyMaterial>,
    aws_enabled: bool,
    status: Status,
}

impl KeyBroker {
    /// Create an empty broker. `local_master_key` unwraps keys whose
    /// `masterKey.provider` is `"local"`; `aws_enabled` admits keys wrapped by
    /// AWS KMS.
    pub fn new(local_master_key: Option<KeyMaterial>, aws_enabled: bool) -> Self {
        Self {
            phase: Phase::Requesting,
            requests: Vec::new(),
            entries: Vec::new(),
            local_master_key,
            aws_enabled,
            status: Status::new(),
        }
    }

    /// The most recent broker failure, or an ok status.
    pub fn status(&self) -> &Status {
        &self.status
    }

    /// Returns `true` if no key has been requested.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Returns `true` once every key is decrypted.
    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Returns `true` while AWS-wrapped keys await [`KeyBroker::kms_feed`].
    pub fn needs_kms(&self) -> bool {
        self.phase == Phase::Kms
    }

    /// Request the key with id `id`.
    pub fn add_id(&mut self, id: KeyId) -> Result<(), CryptError> {
        self.add_request(KeyRef::Id(id))
    }

    /// Request the key carrying alt name `name`.
    pub fn add_name(&mut self, name: &str) -> Result<(), CryptError> {
        self.add_request(KeyRef::AltName(name.to_owned()))
    }

    /// Request a key by whichever reference a marking carries.
    pub fn add_ref(&mut self, key: &KeyRef) -> Result<(), CryptError> {
        self.add_request(key.clone())
    }

    fn add_request(&mut self, key: KeyRef) -> Result<(), CryptError> {
        if self.phase != Phase::Requesting {
            return Err(self.fail(CryptError::client(
                "attempting to request a key after key documents were added",
            )));
        }
        if !self.requests.contains(&key) {
            self.requests.push(key);
        }
        Ok(())
    }

    /// The key-vault query matching every requested key.
    ///
    /// `{ "$or": [ { "_id": { "$in": [..] } }, { "keyAltNames": { "$in": [..] } } ] }`
    pub fn filter(&self) -> Document {
        let mut ids: Vec<Bson> = Vec::new();
        let mut names: Vec<Bson> = Vec::new();
        for request in &self.requests {
            match request {
                KeyRef::Id(id) => ids.push(id.to_bson()),
                KeyRef::AltName(name) => names.push(Bson::String(name.clone())),
            }
        }
        doc! {
            "$or": [
                { "_id": { "$in": ids } },
                { "keyAltNames": { "$in": names } },
            ]
        }
    }

    /// Add one key document returned by the key-vault query.
    ///
    /// # Errors
    ///
    /// Fails if the document is malformed, matches no request, repeats an
    /// `_id` already added, or shares an alt name with another key.
    pub fn add_doc(&mut self, doc: &Document) -> Result<(), CryptError> {
        match self.phase {
            Phase::Requesting | Phase::AddingDocs => {}
            _ => {
                return Err(self.fail(CryptError::client(
                    "attempting to add key documents after key broker finished adding",
                )))
            }
        }
        self.phase = Phase::AddingDocs;

        let key = KeyDocument::parse(doc).map_err(|e| self.fail(e))?;

        let requested = self.requests.iter().any(|r| match r {
            KeyRef::Id(id) => *id == key.id,
            KeyRef::AltName(name) => key.has_alt_name(name),
        });
        if !requested {
            return Err(self.fail(CryptError::kms(format!(
                "unexpected key returned: {}",
                key.id
            ))));
        }

        if self.entries.iter().any(|e| e.doc.id == key.id) {
            return Err(self.fail(CryptError::kms(format!(
                "duplicate key document for id {}",
                key.id
            ))));
        }

        if let Some(name) = key
            .alt_names
            .iter()
            .find(|name| self.entries.iter().any(|e| e.doc.has_alt_name(name)))
        {
            let err = CryptError::kms(format!("key alt name '{name}' matched multiple keys"));
            return Err(self.fail(err));
        }

        debug!(key_id = %key.id, provider = key.master_key.provider().name(), "key document added");
        self.entries.push(KeyEntry {
            doc: key,
            decrypted: None,
        });
        Ok(())
    }

    /// Finish adding key documents.
    ///
    /// Locally wrapped keys are decrypted immediately. If any key is wrapped by
    /// AWS KMS, the broker moves to the KMS phase; otherwise it is done.
    pub fn done_adding_docs(&mut self) -> Result<(), CryptError> {
        match self.phase {
            Phase::Requesting | Phase::AddingDocs => {}
            _ => {
                return Err(self.fail(CryptError::client(
                    "key broker already finished adding key documents",
                )))
            }
        }

        let unsatisfied = self.requests.iter().any(|r| match r {
            KeyRef::Id(id) => !self.entries.iter().any(|e| e.doc.id == *id),
            KeyRef::AltName(name) => !self.entries.iter().any(|e| e.doc.has_alt_name(name)),
        });
        if unsatisfied {
            return Err(self.fail(CryptError::kms("not all keys requested were satisfied")));
        }

        if !self.aws_enabled
            && self
                .entries
                .iter()
                .any(|e| matches!(e.doc.master_key, MasterKey::Aws { .. }))
        {
            let err = CryptError::kms("aws kms provider required but not configured");
            return Err(self.fail(err));
        }

        for i in 0..self.entries.len() {
            if self.entries[i].doc.master_key != MasterKey::Local {
                continue;
            }
            let material = self.unwrap_local(&self.entries[i].doc).map_err(|e| self.fail(e))?;
            self.entries[i].decrypted = Some(material);
        }

        self.phase = if self.entries.iter().any(|e| e.decrypted.is_none()) {
            Phase::Kms
        } else {
            Phase::Done
        };
        debug!(keys = self.entries.len(), needs_kms = self.needs_kms(), "key documents complete");
        Ok(())
    }

    fn unwrap_local(&self, doc: &KeyDocument) -> Result<KeyMaterial, CryptError> {
        let master = self
            .local_master_key
            .as_ref()
            .ok_or_else(|| CryptError::kms("local master key required but not configured"))?;
        let plaintext = cipher::decrypt(None, master.as_bytes(), &doc.key_material).map_err(|e| {
            CryptError::kms(format!("failed to decrypt key {} with local master key: {e}", doc.id))
        })?;
        KeyMaterial::from_slice(&plaintext)
    }

    /// Wrapped keys still awaiting decryption by an external KMS.
    pub fn kms_requests(&self) -> Vec<KmsRequest> {
        if self.phase != Phase::Kms {
            return Vec::new();
        }
        self.entries
            .iter()
            .filter(|e| e.decrypted.is_none())
            .map(|e| KmsRequest {
                key_id: e.doc.id,
                master_key: e.doc.master_key.clone(),
                ciphertext: e.doc.key_material.clone(),
            })
            .collect()
    }

    /// Supply the KMS-decrypted material for key `id`.
    pub fn kms_feed(&mut self, id: &KeyId, plaintext: &[u8]) -> Result<(), CryptError> {
        if self.phase != Phase::Kms {
            return Err(self.fail(CryptError::client("key broker is not awaiting KMS replies")));
        }
        let material = KeyMaterial::from_slice(plaintext).map_err(|e| self.fail(e))?;
        match self.entries.iter().position(|e| e.doc.id == *id) {
            None => Err(self.fail(CryptError::kms(format!("no KMS request for key {id}")))),
            Some(i) if self.entries[i].decrypted.is_some() => {
                Err(self.fail(CryptError::kms(format!("key {id} was already decrypted"))))
            }
            Some(i) => {
                self.entries[i].decrypted = Some(material);
                Ok(())
            }
        }
    }

    /// Finish the KMS phase; every wrapped key must have been fed.
    pub fn kms_done(&mut self) -> Result<(), CryptError> {
        if self.phase != Phase::Kms {
            return Err(self.fail(CryptError::client("key broker is not awaiting KMS replies")));
        }
        if self.entries.iter().any(|e| e.decrypted.is_none()) {
            return Err(self.fail(CryptError::kms("not all KMS requests were satisfied")));
        }
        self.phase = Phase::Done;
        Ok(())
    }

    /// Look up decrypted key material by key id.
    pub fn decrypted_key_by_id(&mut self, id: &KeyId) -> Result<ResolvedKey, CryptError> {
        let found = match self.entries.iter().find(|e| e.doc.id == *id) {
            None => Err(CryptError::kms(format!("no key found for id {id}"))),
            Some(entry) => resolved(entry),
        };
        found.map_err(|e| self.fail(e))
    }

    /// Look up decrypted key material by alt name.
    ///
    /// Fails closed if more than one key carries `name`.
    pub fn decrypted_key_by_name(&mut self, name: &str) -> Result<ResolvedKey, CryptError> {
        let mut matches = self.entries.iter().filter(|e| e.doc.has_alt_name(name));
        let found = match (matches.next(), matches.next()) {
            (None, _) => Err(CryptError::kms(format!("no key found for alt name '{name}'"))),
            (Some(_), Some(_)) => Err(CryptError::kms(format!(
                "key alt name '{name}' matched multiple keys"
            ))),
            (Some(entry), None) => resolved(entry),
        };
        found.map_err(|e| self.fail(e))
    }

    /// Drop every request, document, and decrypted key.
    pub fn release(&mut self) {
        self.requests.clear();
        self.entries.clear();
        self.local_master_key = None;
    }

    fn fail(&mut self, err: CryptError) -> CryptError {
        self.status.set(&err);
        err
    }
}

fn resolved(entry: &KeyEntry) -> Result<ResolvedKey, CryptError> {
    match &entry.decrypted {
        Some(material) => Ok(ResolvedKey {
            id: entry.doc.id,
            material: material.clone(),
        }),
        None => Err(CryptError::kms(format!(
            "key {} has not been decrypted",
            entry.doc.id
        ))),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bson::{spec::BinarySubtype, Binary};
    use common::protocol::{IV_LEN, KEY_LEN};
    use common::StatusKind;

    pub(crate) fn local_master_key() -> KeyMaterial {
        KeyMaterial::from_slice(&[0x11u8; KEY_LEN]).unwrap()
    }

    /// A key document wrapped with [`local_master_key`] around `data_key`.
    pub(crate) fn local_key_doc(id: KeyId, data_key: &[u8], alt_names: &[&str]) -> Document {
        let wrapped = cipher::encrypt(
            &[0x22u8; IV_LEN],
            None,
            local_master_key().as_bytes(),
            data_key,
        )
        .unwrap();
        KeyDocument {
            id,
            alt_names: alt_names.iter().map(|s| s.to_string()).collect(),
            key_material: wrapped,
            master_key: MasterKey::Local,
        }
        .to_document()
    }

    pub(crate) fn aws_key_doc(id: KeyId) -> Document {
        doc! {
            "_id": id.to_bson(),
            "keyMaterial": Bson::Binary(Binary { subtype: BinarySubtype::Generic, bytes: vec![9; 40] }),
            "masterKey": { "provider": "aws", "region": "us-east-1", "key": "cmk" },
        }
    }

    #[test]
    fn filter_lists_ids_and_names() {
        let mut kb = KeyBroker::new(None, true);
        let id = KeyId::new_random();
        kb.add_id(id).unwrap();
        kb.add_id(id).unwrap();
        kb.add_name("ssn").unwrap();
        let filter = kb.filter();
        let or = filter.get_array("$or").unwrap();
        let ids = or[0].as_document().unwrap().get_document("_id").unwrap();
        assert_eq!(ids.get_array("$in").unwrap(), &vec![id.to_bson()]);
        let names = or[1].as_document().unwrap().get_document("keyAltNames").unwrap();
        assert_eq!(names.get_array("$in").unwrap(), &vec![Bson::String("ssn".into())]);
    }

    #[test]
    fn local_key_resolves_by_id_and_name() {
        let mut kb = KeyBroker::new(Some(local_master_key()), false);
        let id = KeyId::new_random();
        let data_key = [0x33u8; KEY_LEN];
        kb.add_id(id).unwrap();
        kb.add_name("ssn").unwrap();
        kb.add_doc(&local_key_doc(id, &data_key, &["ssn"])).unwrap();
        kb.done_adding_docs().unwrap();
        assert!(kb.is_done());

        let by_id = kb.decrypted_key_by_id(&id).unwrap();
        assert_eq!(by_id.material.as_bytes(), &data_key[..]);
        let by_name = kb.decrypted_key_by_name("ssn").unwrap();
        assert_eq!(by_name.id, id);
        assert!(kb.status().is_ok());
    }

    #[test]
    fn unknown_id_records_status() {
        let mut kb = KeyBroker::new(Some(local_master_key()), false);
        let missing = KeyId::new_random();
        let err = kb.decrypted_key_by_id(&missing).unwrap_err();
        assert_eq!(kb.status().kind(), StatusKind::Kms);
        assert_eq!(kb.status().error(), Some(err));
    }

    #[test]
    fn unsatisfied_request_fails() {
        let mut kb = KeyBroker::new(Some(local_master_key()), false);
        kb.add_id(KeyId::new_random()).unwrap();
        let err = kb.done_adding_docs().unwrap_err();
        assert_eq!(err, CryptError::kms("not all keys requested were satisfied"));
    }

    #[test]
    fn unexpected_document_rejected() {
        let mut kb = KeyBroker::new(Some(local_master_key()), false);
        kb.add_id(KeyId::new_random()).unwrap();
        let other = KeyId::new_random();
        let err = kb.add_doc(&local_key_doc(other, &[0u8; KEY_LEN], &[])).unwrap_err();
        assert!(err.to_string().contains("unexpected key returned"));
    }

    #[test]
    fn duplicate_document_rejected() {
        let mut kb = KeyBroker::new(Some(local_master_key()), false);
        let id = KeyId::new_random();
        kb.add_id(id).unwrap();
        let doc = local_key_doc(id, &[0u8; KEY_LEN], &[]);
        kb.add_doc(&doc).unwrap();
        assert!(kb.add_doc(&doc).is_err());
    }

    #[test]
    fn ambiguous_alt_name_rejected() {
        let mut kb = KeyBroker::new(Some(local_master_key()), false);
        kb.add_name("shared").unwrap();
        kb.add_doc(&local_key_doc(KeyId::new_random(), &[1u8; KEY_LEN], &["shared"]))
            .unwrap();
        let err = kb
            .add_doc(&local_key_doc(KeyId::new_random(), &[2u8; KEY_LEN], &["shared"]))
            .unwrap_err();
        assert!(err.to_string().contains("matched multiple keys"));
    }

    #[test]
    fn requests_closed_after_documents() {
        let mut kb = KeyBroker::new(Some(local_master_key()), false);
        let id = KeyId::new_random();
        kb.add_id(id).unwrap();
        kb.add_doc(&local_key_doc(id, &[0u8; KEY_LEN], &[])).unwrap();
        assert!(kb.add_name("late").is_err());
    }

    #[test]
    fn local_key_without_master_key_fails() {
        let mut kb = KeyBroker::new(None, true);
        let id = KeyId::new_random();
        kb.add_id(id).unwrap();
        kb.add_doc(&local_key_doc(id, &[0u8; KEY_LEN], &[])).unwrap();
        let err = kb.done_adding_docs().unwrap_err();
        assert!(err.to_string().contains("local master key"));
    }

    #[test]
    fn aws_key_goes_through_kms() {
        let mut kb = KeyBroker::new(None, true);
        let id = KeyId::new_random();
        kb.add_id(id).unwrap();
        kb.add_doc(&aws_key_doc(id)).unwrap();
        kb.done_adding_docs().unwrap();
        assert!(kb.needs_kms());

        let requests = kb.kms_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].key_id, id);
        assert_eq!(requests[0].ciphertext, vec![9; 40]);

        // Not yet decrypted.
        assert!(kb.decrypted_key_by_id(&id).is_err());
        assert!(kb.kms_done().is_err());

        assert!(kb.kms_feed(&id, &[0u8; 10]).is_err());
        kb.kms_feed(&id, &[0x44u8; KEY_LEN]).unwrap();
        kb.kms_done().unwrap();
        assert!(kb.is_done());
        assert_eq!(
            kb.decrypted_key_by_id(&id).unwrap().material.as_bytes(),
            &[0x44u8; KEY_LEN][..]
        );
    }

    #[test]
    fn aws_key_without_aws_provider_fails() {
        let mut kb = KeyBroker::new(Some(local_master_key()), false);
        let id = KeyId::new_random();
        kb.add_id(id).unwrap();
        kb.add_doc(&aws_key_doc(id)).unwrap();
        let err = kb.done_adding_docs().unwrap_err();
        assert_eq!(err, CryptError::kms("aws kms provider required but not configured"));
        assert!(!kb.needs_kms());
        assert_eq!(kb.status().kind(), StatusKind::Kms);
    }

    #[test]
    fn kms_feed_for_unknown_key_fails() {
        let mut kb = KeyBroker::new(None, true);
        let id = KeyId::new_random();
        kb.add_id(id).unwrap();
        kb.add_doc(&aws_key_doc(id)).unwrap();
        kb.done_adding_docs().unwrap();
        let err = kb.kms_feed(&KeyId::new_random(), &[0u8; KEY_LEN]).unwrap_err();
        assert!(err.to_string().contains("no KMS request"));
    }
}
