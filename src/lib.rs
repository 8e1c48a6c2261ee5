//! # fieldvault
//!
//! Client-side field-level encryption for document stores.
//!
//! Three pieces cooperate:
//!
//! - **Key provisioning** ([`provision`]): generate a local master key,
//!   register a wrapped data key in a key-vault collection, and persist the
//!   master key to a file.
//! - **Schema binding** ([`schema`]): declare per collection which fields are
//!   encrypted, with which algorithm (Deterministic or Random) and key.
//! - **The gateway** ([`gateway`]): a store wrapper that encrypts schema
//!   fields on write, encrypts equality filters on Deterministic fields,
//!   refuses filters on Random fields, and decrypts on read.
//!
//! The document store itself is a collaborator behind the
//! [`store::DocumentStore`] trait; [`memory::MemoryStore`] is an in-process
//! implementation.

pub(crate) mod crypto;
pub mod codec;
pub mod config;
pub mod document;
pub mod error;
pub mod gateway;
pub mod keys;
pub mod memory;
pub mod provision;
pub mod schema;
pub mod store;
pub mod vault;

pub use codec::FieldCodec;
pub use config::FieldVaultConfig;
pub use document::{BsonType, Document, Namespace};
pub use error::{FieldVaultError, Result};
pub use gateway::{Gateway, GatewayOptions, GatewayState};
pub use keys::{KeyId, MasterKey};
pub use memory::MemoryStore;
pub use provision::{load_key, persist_key, KeyProvisioner};
pub use schema::{bind_to_collection, build_schema, Algorithm, CollectionBinding, FieldSchema, RawDirective};
pub use store::DocumentStore;

/// Generate a master key of the default length (96 bytes).
///
/// In production, callers may prefer to source master keys from a
/// dedicated KMS rather than generating them locally.
pub fn generate_master_key() -> Result<MasterKey> {
    provision::generate_key(keys::DEFAULT_MASTER_KEY_LEN)
}
