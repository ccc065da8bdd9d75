//! Encrypt-side payload: schema lookup, marking round and the final
//! marking → ciphertext rewrite of a command.

use bson::{doc, Document};
use common::CryptError;
use tracing::debug;

use super::State;
use crate::buffer::Buffer;
use crate::crypt::Crypt;
use crate::key_broker::KeyBroker;
use crate::marking::Marking;
use crate::schema;
use crate::traverse::{self, BlobKind};

#[derive(Debug)]
pub(crate) struct EncryptPayload {
    ns: String,
    db: String,
    coll_name: String,
    original_cmd: Buffer<'static>,
    list_collections_filter: Buffer<'static>,
    schema: Option<Document>,
    collinfo_fed: bool,
    marking_cmd: Buffer<'static>,
    marked_cmd: Option<Document>,
    encrypted_cmd: Buffer<'static>,
}

impl EncryptPayload {
    /// Validate the namespace and command and pick the first state.
    pub(crate) fn new(crypt: &Crypt, ns: &str, cmd: &[u8]) -> Result<(Self, State), CryptError> {
        let (db, coll) = ns
            .split_once('.')
            .filter(|(db, coll)| !db.is_empty() && !coll.is_empty())
            .ok_or_else(|| CryptError::client(format!("invalid namespace '{ns}'")))?;
        debug!(db, coll, "encrypt context namespace");

        let original_cmd = Buffer::from(cmd).copy_to_owned();
        original_cmd.to_document()?;

        let schema = crypt.schema_cache().get(ns);
        let next = if schema.is_some() {
            State::NeedMongoMarkings
        } else {
            State::NeedMongoCollinfo
        };

        Ok((
            Self {
                ns: ns.to_owned(),
                db: db.to_owned(),
                coll_name: coll.to_owned(),
                original_cmd,
                list_collections_filter: Buffer::empty(),
                schema,
                collinfo_fed: false,
                marking_cmd: Buffer::empty(),
                marked_cmd: None,
                encrypted_cmd: Buffer::empty(),
            },
            next,
        ))
    }

    pub(crate) fn ns(&self) -> &str {
        &self.ns
    }

    pub(crate) fn db(&self) -> &str {
        &self.db
    }

    pub(crate) fn list_collections_filter(&self) -> &[u8] {
        &self.list_collections_filter
    }

    pub(crate) fn marking_cmd(&self) -> &[u8] {
        &self.marking_cmd
    }

    pub(crate) fn output(&self) -> &[u8] {
        &self.encrypted_cmd
    }

    pub(crate) fn op_collinfo(&mut self) -> Result<(), CryptError> {
        if self.list_collections_filter.is_empty() {
            let filter = doc! { "name": self.coll_name.as_str() };
            self.list_collections_filter = Buffer::from_document(&filter)?;
        }
        Ok(())
    }

    pub(crate) fn feed_collinfo(&mut self, reply: &[u8]) -> Result<(), CryptError> {
        if self.collinfo_fed {
            return Err(CryptError::client(
                "received more than one collection info document",
            ));
        }
        let info = Buffer::borrowed(reply).to_document()?;
        self.collinfo_fed = true;
        self.schema = schema::from_collinfo(&info);
        Ok(())
    }

    /// No schema means the collection has nothing to encrypt.
    pub(crate) fn done_collinfo(&mut self, crypt: &Crypt) -> Result<State, CryptError> {
        match &self.schema {
            Some(schema) => {
                crypt.schema_cache().insert(&self.ns, schema.clone());
                Ok(State::NeedMongoMarkings)
            }
            None => {
                debug!(ns = %self.ns, "collection has no JSON schema");
                Ok(State::NothingToDo)
            }
        }
    }

    pub(crate) fn op_markings(&mut self) -> Result<(), CryptError> {
        if self.marking_cmd.is_empty() {
            let schema = self
                .schema
                .clone()
                .ok_or_else(|| CryptError::Internal("marking requested without a schema".into()))?;
            let mut cmd = self.original_cmd.to_document()?;
            cmd.insert("jsonSchema", schema);
            self.marking_cmd = Buffer::from_document(&cmd)?;
        }
        Ok(())
    }

    pub(crate) fn feed_markings(&mut self, reply: &[u8]) -> Result<(), CryptError> {
        if self.marked_cmd.is_some() {
            return Err(CryptError::client("received more than one markings reply"));
        }
        let mut reply = Buffer::borrowed(reply).to_document()?;
        match reply.remove("result") {
            Some(bson::Bson::Document(result)) => {
                self.marked_cmd = Some(result);
                Ok(())
            }
            _ => Err(CryptError::client(
                "malformed markings reply, expected a 'result' document",
            )),
        }
    }

    /// Hand every marking's key reference to the broker.
    pub(crate) fn done_markings(&mut self, kb: &mut KeyBroker) -> Result<State, CryptError> {
        let marked = self
            .marked_cmd
            .as_ref()
            .ok_or_else(|| CryptError::client("no markings reply received"))?;

        let mut count = 0usize;
        traverse::visit(marked, BlobKind::Marking, &mut |bytes| {
            let marking = Marking::parse(bytes)?;
            kb.add_ref(marking.key())?;
            count += 1;
            Ok(())
        })?;

        debug!(ns = %self.ns, markings = count, "markings collected");
        Ok(if count == 0 {
            State::NothingToDo
        } else {
            State::NeedMongoKeys
        })
    }

    /// Replace every marking with its ciphertext.
    pub(crate) fn finalize(&mut self, kb: &mut KeyBroker) -> Result<(), CryptError> {
        let mut cmd = self
            .marked_cmd
            .clone()
            .ok_or_else(|| CryptError::Internal("finalize without a marked command".into()))?;
        traverse::transform(&mut cmd, BlobKind::Marking, &mut |bytes| {
            Ok(Marking::parse(bytes)?.to_ciphertext(kb)?.to_bson())
        })?;
        self.encrypted_cmd = Buffer::from_document(&cmd)?;
        Ok(())
    }

    pub(crate) fn finalize_unchanged(&mut self) {
        self.encrypted_cmd = self.original_cmd.copy_to_owned();
    }

    pub(crate) fn cleanup(&mut self) {
        self.original_cmd.release();
        self.list_collections_filter.release();
        self.marking_cmd.release();
        self.encrypted_cmd.release();
        self.schema = None;
        self.marked_cmd = None;
    }
}
