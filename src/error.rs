//! Error types for fieldvault.
//!
//! Every variant is a distinct failure mode of the key/schema lifecycle.
//! Messages are intentionally minimal: they name *what* failed and never
//! carry key material or plaintext field values.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::document::Namespace;
use crate::keys::KeyId;
use crate::store::StoreError;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, FieldVaultError>;

/// The single error type for all fieldvault operations.
#[derive(Debug, Error)]
pub enum FieldVaultError {
    /// The key-vault collection could not be reached during registration
    /// or lookup.
    #[error("key vault unavailable: {0}")]
    VaultUnavailable(String),

    /// A local key or schema file could not be written or read.
    #[error("persistence failed for {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A schema directive named an algorithm other than Deterministic or Random.
    #[error("unknown encryption algorithm: {0}")]
    UnknownAlgorithm(String),

    /// The key referenced by a schema directive has no vault entry.
    #[error("no key vault entry for key {0}")]
    EncryptionUnavailable(KeyId),

    /// An equality filter targeted a Random-algorithm field.
    #[error("field `{0}` is encrypted with the Random algorithm and cannot be filtered")]
    NonFilterableField(String),

    /// A filter or update used an operator encrypted fields cannot support.
    #[error("unsupported operation on encrypted field: {0}")]
    UnsupportedFilter(String),

    /// Key material was malformed or could not be used by the cipher.
    #[error("invalid key")]
    InvalidKey,

    /// Key material had the wrong length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    KeyLength { expected: usize, actual: usize },

    #[error("encryption failed")]
    EncryptionFailure,

    /// Wrong key, tampered ciphertext, or a corrupted GCM tag.
    #[error("decryption failed")]
    DecryptionFailure,

    #[error("key derivation failed")]
    KeyDerivationFailure,

    #[error("randomness source failed")]
    RandomnessFailure,

    /// A schema document or directive set was malformed.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// A field value did not match its declared bsonType.
    #[error("field `{field}` does not match declared bsonType `{expected}`")]
    TypeMismatch { field: String, expected: String },

    /// A namespace was given more than one schema.
    #[error("namespace {0} already has a bound schema")]
    DuplicateBinding(Namespace),

    /// A key alt name is already used by another vault entry.
    #[error("key alt name already in use: {0}")]
    DuplicateKeyAltName(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Errors from the underlying document store propagate unchanged.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl FieldVaultError {
    pub(crate) fn persistence(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Persistence {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn vault(err: StoreError) -> Self {
        Self::VaultUnavailable(err.to_string())
    }
}
