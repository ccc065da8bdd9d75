//! Async caller side of the field-level encryption core.
//!
//! The core never performs I/O. This crate supplies the collaborators it
//! talks to through its context hooks: a [`MongoBackend`] for collection
//! info, marking and key vault queries, and a [`KmsBackend`] (with an AWS
//! implementation) for data keys wrapped by an external KMS.

pub mod config;
pub mod kms;
pub mod mongo;
pub mod runner;
pub mod telemetry;

pub use config::DriverConfig;
pub use kms::{AwsKms, KmsBackend};
pub use mongo::MongoBackend;
pub use runner::{decrypt_document, encrypt_command, run_context};
