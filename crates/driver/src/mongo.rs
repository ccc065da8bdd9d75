//! Database collaborator: the three queries a context asks its caller to run.

use anyhow::Result;
use async_trait::async_trait;
use bson::Document;

/// Runs the database round trips an encryption context needs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MongoBackend: Send + Sync {
    /// `listCollections` in database `db` with `filter`.
    async fn collection_info(&self, db: &str, filter: &Document) -> Result<Vec<Document>>;

    /// Send `cmd` to the marking service and return its whole reply.
    async fn mark_command(&self, cmd: &Document) -> Result<Document>;

    /// Query the key vault collection with `filter`.
    async fn fetch_keys(&self, filter: &Document) -> Result<Vec<Document>>;
}
