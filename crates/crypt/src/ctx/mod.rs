//! The per-operation state machine that callers drive to encrypt a command
//! or decrypt a reply.
//!
//! # Driving protocol
//!
//! The context never performs I/O. At each `Need*` state the caller asks for
//! the outbound request (`mongo_op_*`), runs it, feeds every reply back
//! (`mongo_feed_*`) and closes the round (`mongo_done_*`), which validates
//! what was fed and moves to the next state. Keys wrapped by an external KMS
//! are resolved the same way through `kms_requests`, `kms_feed` and
//! `kms_done`. In [`State::Ready`] or [`State::NothingToDo`] the caller calls
//! [`Context::finalize`] to obtain the result.
//!
//! ```text
//! Nothing ─encrypt_init─▶ NeedMongoCollinfo ─▶ NeedMongoMarkings ─▶ NeedMongoKeys
//!    │                        │ (cached schema skips)   │               │
//!    └─decrypt_init───────────┼─────────────────────────┼──────────────▶│
//!                             ▼                         ▼               ▼
//!                        NothingToDo ◀──────────────────┘     NeedKms ─▶ Ready
//!                             │                                          │
//!                             └──────────────finalize──▶ Done ◀──────────┘
//! ```
//!
//! Every state can move to [`State::Error`].
//!
//! # Invariants
//!
//! - [`Context::fail`] and [`Context::fail_w_msg`] are the only ways into
//!   [`State::Error`]; the first recorded status is never overwritten.
//! - In [`State::Done`] or [`State::Error`], every hook returns an error and
//!   leaves both state and status untouched.
//! - A hook called in the wrong non-terminal state fails the context.
//! - Output buffers are only written once the step producing them succeeds.

mod decrypt;
mod encrypt;

use std::fmt;

use common::{CryptError, Status};
use tracing::{debug, warn};

use crate::buffer::Buffer;
use crate::crypt::Crypt;
use crate::key_broker::{KeyBroker, KeyId, KmsRequest};

use decrypt::DecryptPayload;
use encrypt::EncryptPayload;

/// Where a context is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Created, not yet initialised.
    Nothing,
    /// Waiting for the collection's `listCollections` entry.
    NeedMongoCollinfo,
    /// Waiting for the marked command.
    NeedMongoMarkings,
    /// Waiting for key vault documents.
    NeedMongoKeys,
    /// Waiting for an external KMS to decrypt wrapped keys.
    NeedKms,
    /// All inputs gathered; `finalize` will produce the result.
    Ready,
    /// No field needs encrypting or decrypting; `finalize` returns the input.
    NothingToDo,
    Done,
    Error,
}

impl State {
    /// `Done` and `Error` are terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Done | State::Error)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Nothing => "nothing",
            State::NeedMongoCollinfo => "need_mongo_collinfo",
            State::NeedMongoMarkings => "need_mongo_markings",
            State::NeedMongoKeys => "need_mongo_keys",
            State::NeedKms => "need_kms",
            State::Ready => "ready",
            State::NothingToDo => "nothing_to_do",
            State::Done => "done",
            State::Error => "error",
        };
        f.write_str(name)
    }
}

/// Operation-specific data, chosen at init.
#[derive(Debug)]
enum Payload {
    Encrypt(EncryptPayload),
    Decrypt(DecryptPayload),
}

impl Payload {
    fn finalize(&mut self, kb: &mut KeyBroker) -> Result<(), CryptError> {
        match self {
            Payload::Encrypt(enc) => enc.finalize(kb),
            Payload::Decrypt(dec) => dec.finalize(kb),
        }
    }

    fn finalize_unchanged(&mut self) {
        match self {
            Payload::Encrypt(enc) => enc.finalize_unchanged(),
            Payload::Decrypt(dec) => dec.finalize_unchanged(),
        }
    }

    fn output(&self) -> &[u8] {
        match self {
            Payload::Encrypt(enc) => enc.output(),
            Payload::Decrypt(dec) => dec.output(),
        }
    }

    fn cleanup(&mut self) {
        match self {
            Payload::Encrypt(enc) => enc.cleanup(),
            Payload::Decrypt(dec) => dec.cleanup(),
        }
    }
}

/// Disjoint borrows of a context handed to a hook body.
struct Parts<'c> {
    state: State,
    crypt: &'c Crypt,
    kb: &'c mut KeyBroker,
    key_filter: &'c mut Buffer<'static>,
    payload: &'c mut Payload,
}

type Step<T> = Result<(T, Option<State>), CryptError>;

/// One encryption or decryption operation.
#[derive(Debug)]
pub struct Context {
    crypt: Crypt,
    state: State,
    status: Status,
    kb: KeyBroker,
    key_filter: Buffer<'static>,
    payload: Option<Payload>,
}

impl Context {
    /// Create an uninitialised context bound to `crypt`.
    pub fn new(crypt: &Crypt) -> Self {
        Self {
            crypt: crypt.clone(),
            state: State::Nothing,
            status: Status::new(),
            kb: crypt.key_broker(),
            key_filter: Buffer::empty(),
            payload: None,
        }
    }

    /// The current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// The namespace (`db.coll`) of an encrypt context.
    pub fn ns(&self) -> Option<&str> {
        self.encrypt_payload().map(EncryptPayload::ns)
    }

    /// The database an encrypt context targets, where `listCollections` runs.
    pub fn db(&self) -> Option<&str> {
        self.encrypt_payload().map(EncryptPayload::db)
    }

    /// The first failure recorded, or an ok status.
    pub fn status(&self) -> &Status {
        &self.status
    }

    /// Start encrypting `cmd`, a command against namespace `ns` (`db.coll`).
    pub fn encrypt_init(&mut self, ns: &str, cmd: &[u8]) -> Result<(), CryptError> {
        self.check("encrypt_init", &[State::Nothing])?;
        match EncryptPayload::new(&self.crypt, ns, cmd) {
            Ok((payload, next)) => {
                debug!(ns = payload.ns(), "encrypt context initialised");
                self.payload = Some(Payload::Encrypt(payload));
                self.transition(next);
                Ok(())
            }
            Err(err) => Err(self.fail_with(err)),
        }
    }

    /// Start decrypting `doc`, typically a server reply.
    pub fn decrypt_init(&mut self, doc: &[u8]) -> Result<(), CryptError> {
        self.check("decrypt_init", &[State::Nothing])?;
        match DecryptPayload::new(doc, &mut self.kb) {
            Ok((payload, next)) => {
                self.payload = Some(Payload::Decrypt(payload));
                self.transition(next);
                Ok(())
            }
            Err(err) => Err(self.fail_with(err)),
        }
    }

    /// The `listCollections` filter selecting the target collection.
    pub fn mongo_op_collinfo(&mut self) -> Result<Buffer<'_>, CryptError> {
        self.advance("mongo_op_collinfo", &[State::NeedMongoCollinfo], |p| {
            encrypt_payload(p.payload)?.op_collinfo()?;
            Ok(((), None))
        })?;
        Ok(Buffer::borrowed(
            self.encrypt_payload().map_or(&[][..], EncryptPayload::list_collections_filter),
        ))
    }

    /// Feed one collection info document. At most one may be fed.
    pub fn mongo_feed_collinfo(&mut self, reply: &[u8]) -> Result<(), CryptError> {
        self.advance("mongo_feed_collinfo", &[State::NeedMongoCollinfo], |p| {
            encrypt_payload(p.payload)?.feed_collinfo(reply)?;
            Ok(((), None))
        })
    }

    /// Finish the collection info round; a collection without a schema has nothing to do.
    pub fn mongo_done_collinfo(&mut self) -> Result<(), CryptError> {
        self.advance("mongo_done_collinfo", &[State::NeedMongoCollinfo], |p| {
            let next = encrypt_payload(p.payload)?.done_collinfo(p.crypt)?;
            Ok(((), Some(next)))
        })
    }

    /// The command to send for marking: the original plus `jsonSchema`.
    pub fn mongo_op_markings(&mut self) -> Result<Buffer<'_>, CryptError> {
        self.advance("mongo_op_markings", &[State::NeedMongoMarkings], |p| {
            encrypt_payload(p.payload)?.op_markings()?;
            Ok(((), None))
        })?;
        Ok(Buffer::borrowed(
            self.encrypt_payload().map_or(&[][..], EncryptPayload::marking_cmd),
        ))
    }

    /// Feed the marking reply; it must carry a `result` document.
    pub fn mongo_feed_markings(&mut self, reply: &[u8]) -> Result<(), CryptError> {
        self.advance("mongo_feed_markings", &[State::NeedMongoMarkings], |p| {
            encrypt_payload(p.payload)?.feed_markings(reply)?;
            Ok(((), None))
        })
    }

    /// Parse the markings and request their keys.
    pub fn mongo_done_markings(&mut self) -> Result<(), CryptError> {
        self.advance("mongo_done_markings", &[State::NeedMongoMarkings], |p| {
            let next = encrypt_payload(p.payload)?.done_markings(p.kb)?;
            Ok(((), Some(next)))
        })
    }

    /// The key vault filter matching every key this operation needs.
    pub fn mongo_op_keys(&mut self) -> Result<Buffer<'_>, CryptError> {
        self.advance("mongo_op_keys", &[State::NeedMongoKeys], |p| {
            *p.key_filter = Buffer::from_document(&p.kb.filter())?;
            Ok(((), None))
        })?;
        Ok(Buffer::borrowed(&self.key_filter))
    }

    /// Feed one key vault document.
    pub fn mongo_feed_keys(&mut self, reply: &[u8]) -> Result<(), CryptError> {
        self.advance("mongo_feed_keys", &[State::NeedMongoKeys], |p| {
            let doc = Buffer::borrowed(reply).to_document()?;
            p.kb.add_doc(&doc)?;
            Ok(((), None))
        })
    }

    /// Finish the key vault round and unwrap locally wrapped keys.
    pub fn mongo_done_keys(&mut self) -> Result<(), CryptError> {
        self.advance("mongo_done_keys", &[State::NeedMongoKeys], |p| {
            p.kb.done_adding_docs()?;
            let next = if p.kb.needs_kms() {
                State::NeedKms
            } else {
                State::Ready
            };
            Ok(((), Some(next)))
        })
    }

    /// Wrapped keys that an external KMS must decrypt.
    pub fn kms_requests(&mut self) -> Result<Vec<KmsRequest>, CryptError> {
        self.advance("kms_requests", &[State::NeedKms], |p| {
            Ok((p.kb.kms_requests(), None))
        })
    }

    /// Feed the KMS-decrypted material of key `id`.
    pub fn kms_feed(&mut self, id: &KeyId, plaintext: &[u8]) -> Result<(), CryptError> {
        self.advance("kms_feed", &[State::NeedKms], |p| {
            p.kb.kms_feed(id, plaintext)?;
            Ok(((), None))
        })
    }

    /// Finish the KMS round; every request must have been answered.
    pub fn kms_done(&mut self) -> Result<(), CryptError> {
        self.advance("kms_done", &[State::NeedKms], |p| {
            p.kb.kms_done()?;
            Ok(((), Some(State::Ready)))
        })
    }

    /// Produce the encrypted command or decrypted document.
    ///
    /// In [`State::NothingToDo`] the input is returned unchanged.
    pub fn finalize(&mut self) -> Result<Buffer<'_>, CryptError> {
        self.advance("finalize", &[State::Ready, State::NothingToDo], |p| {
            if p.state == State::Ready {
                p.payload.finalize(p.kb)?;
            } else {
                p.payload.finalize_unchanged();
            }
            Ok(((), Some(State::Done)))
        })?;
        Ok(Buffer::borrowed(
            self.payload.as_ref().map_or(&[][..], Payload::output),
        ))
    }

    /// Move to [`State::Error`] with the status already recorded.
    ///
    /// Falls back to the key broker's status, then to an internal error, if
    /// nothing was recorded. Idempotent in [`State::Error`].
    pub fn fail(&mut self) -> CryptError {
        let err = self
            .status
            .error()
            .or_else(|| self.kb.status().error())
            .unwrap_or_else(|| {
                CryptError::Internal("context failed without an error status".into())
            });
        self.fail_with(err)
    }

    /// Move to [`State::Error`] with a client error carrying `msg`.
    pub fn fail_w_msg(&mut self, msg: impl Into<String>) -> CryptError {
        self.fail_with(CryptError::client(msg))
    }

    /// Release every buffer and key held by this context.
    pub fn cleanup(mut self) {
        if let Some(payload) = self.payload.as_mut() {
            payload.cleanup();
        }
        self.key_filter.release();
        self.kb.release();
        debug!(state = %self.state, "context cleaned up");
    }

    fn encrypt_payload(&self) -> Option<&EncryptPayload> {
        match &self.payload {
            Some(Payload::Encrypt(enc)) => Some(enc),
            _ => None,
        }
    }

    /// Reject terminal states without touching them; fail on any other
    /// state not in `allowed`.
    fn check(&mut self, hook: &str, allowed: &[State]) -> Result<(), CryptError> {
        if self.state.is_terminal() {
            return Err(CryptError::client(format!(
                "cannot call {hook} in state {}",
                self.state
            )));
        }
        if !allowed.contains(&self.state) {
            let err = CryptError::client(format!("{hook} called in state {}", self.state));
            return Err(self.fail_with(err));
        }
        Ok(())
    }

    fn advance<T>(
        &mut self,
        hook: &str,
        allowed: &[State],
        body: impl FnOnce(Parts<'_>) -> Step<T>,
    ) -> Result<T, CryptError> {
        self.check(hook, allowed)?;
        let outcome = match self.payload.as_mut() {
            Some(payload) => body(Parts {
                state: self.state,
                crypt: &self.crypt,
                kb: &mut self.kb,
                key_filter: &mut self.key_filter,
                payload,
            }),
            None => Err(CryptError::Internal(format!("{hook} on an uninitialised context"))),
        };
        match outcome {
            Ok((value, next)) => {
                if let Some(next) = next {
                    self.transition(next);
                }
                Ok(value)
            }
            Err(err) => Err(self.fail_with(err)),
        }
    }

    fn transition(&mut self, next: State) {
        debug!(from = %self.state, to = %next, "context state transition");
        self.state = next;
    }

    fn fail_with(&mut self, err: CryptError) -> CryptError {
        match self.state {
            State::Error => self.status.error().unwrap_or(err),
            State::Done => CryptError::client("cannot fail a context in state done"),
            from => {
                self.status.set(&err);
                self.state = State::Error;
                warn!(from = %from, error = %err, "context failed");
                err
            }
        }
    }
}

fn encrypt_payload(payload: &mut Payload) -> Result<&mut EncryptPayload, CryptError> {
    match payload {
        Payload::Encrypt(enc) => Ok(enc),
        Payload::Decrypt(_) => Err(CryptError::Internal(
            "encrypt hook on a decrypt context".into(),
        )),
    }
}
