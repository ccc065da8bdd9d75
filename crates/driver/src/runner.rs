//! Drives a [`Context`] through every state, running the requests it asks
//! for against the database and KMS collaborators.

use anyhow::{Context as _, Result};
use bson::Document;
use fle_crypt::{Context, Crypt, State};
use tracing::{debug, info_span, Instrument};

use crate::kms::KmsBackend;
use crate::mongo::MongoBackend;

/// Run `ctx` to completion and return the finalized bytes.
///
/// A collaborator failure fails the context with a message naming the step,
/// so the context status always explains why the run stopped.
///
/// # Errors
///
/// Returns the context's error, or the collaborator's error with context.
pub async fn run_context(
    mut ctx: Context,
    mongo: &dyn MongoBackend,
    kms: &dyn KmsBackend,
) -> Result<Vec<u8>> {
    let outcome = drive(&mut ctx, mongo, kms).await;
    if outcome.is_err() && ctx.state() != State::Error {
        ctx.fail();
    }
    ctx.cleanup();
    outcome
}

/// Encrypt `cmd`, a command against `ns`.
pub async fn encrypt_command(
    crypt: &Crypt,
    ns: &str,
    cmd: &Document,
    mongo: &dyn MongoBackend,
    kms: &dyn KmsBackend,
) -> Result<Document> {
    let mut ctx = Context::new(crypt);
    ctx.encrypt_init(ns, &to_bytes(cmd)?)?;
    let out = run_context(ctx, mongo, kms)
        .instrument(info_span!("encrypt_command", ns))
        .await?;
    from_bytes(&out)
}

/// Decrypt every encrypted field in `doc`.
pub async fn decrypt_document(
    crypt: &Crypt,
    doc: &Document,
    mongo: &dyn MongoBackend,
    kms: &dyn KmsBackend,
) -> Result<Document> {
    let mut ctx = Context::new(crypt);
    ctx.decrypt_init(&to_bytes(doc)?)?;
    let out = run_context(ctx, mongo, kms)
        .instrument(info_span!("decrypt_document"))
        .await?;
    from_bytes(&out)
}

async fn drive(
    ctx: &mut Context,
    mongo: &dyn MongoBackend,
    kms: &dyn KmsBackend,
) -> Result<Vec<u8>> {
    loop {
        let state = ctx.state();
        debug!(state = %state, "driving context");
        match state {
            State::NeedMongoCollinfo => {
                let filter = ctx.mongo_op_collinfo()?.to_document()?;
                let db = ctx.db().unwrap_or_default().to_owned();
                let infos = step(
                    ctx,
                    "collection info lookup",
                    mongo.collection_info(&db, &filter).await,
                )?;
                for info in &infos {
                    ctx.mongo_feed_collinfo(&to_bytes(info)?)?;
                }
                ctx.mongo_done_collinfo()?;
            }
            State::NeedMongoMarkings => {
                let cmd = ctx.mongo_op_markings()?.to_document()?;
                let reply = step(ctx, "marking command", mongo.mark_command(&cmd).await)?;
                ctx.mongo_feed_markings(&to_bytes(&reply)?)?;
                ctx.mongo_done_markings()?;
            }
            State::NeedMongoKeys => {
                let filter = ctx.mongo_op_keys()?.to_document()?;
                let keys = step(ctx, "key vault query", mongo.fetch_keys(&filter).await)?;
                for key in &keys {
                    ctx.mongo_feed_keys(&to_bytes(key)?)?;
                }
                ctx.mongo_done_keys()?;
            }
            State::NeedKms => {
                for request in ctx.kms_requests()? {
                    let plaintext = step(ctx, "KMS decrypt", kms.decrypt(&request).await)?;
                    ctx.kms_feed(&request.key_id, &plaintext)?;
                }
                ctx.kms_done()?;
            }
            State::Ready | State::NothingToDo => {
                return Ok(ctx.finalize()?.into_vec());
            }
            State::Nothing => anyhow::bail!("context was not initialised"),
            State::Done => anyhow::bail!("context already finalized"),
            State::Error => anyhow::bail!("context failed: {}", ctx.status()),
        }
    }
}

/// Fail `ctx` if a collaborator call failed.
fn step<T>(ctx: &mut Context, what: &str, result: Result<T>) -> Result<T> {
    result.map_err(|err| {
        ctx.fail_w_msg(format!("{what} failed: {err:#}"));
        err.context(format!("{what} failed"))
    })
}

fn to_bytes(doc: &Document) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    doc.to_writer(&mut out).context("failed to serialise document")?;
    Ok(out)
}

fn from_bytes(bytes: &[u8]) -> Result<Document> {
    Document::from_reader(bytes).context("context produced an invalid document")
}
