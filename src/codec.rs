//! Field-value encryption.
//!
//! `FieldCodec` is the explicit encryption API: it turns a single value into
//! an encrypted binary (subtype 6) and back, fetching the data key from the
//! key vault on every call. The gateway uses it for automatic encryption;
//! callers may also use it directly.
//!
//! ## Encrypted blob layout
//!
//! ```text
//! [ algorithm (1) ][ key id (16) ][ bson type (1) ][ nonce (12) ][ ciphertext + tag ]
//! ```
//!
//! The 18-byte header is authenticated as associated data, so neither the
//! key id nor the declared type can be altered without failing decryption.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::crypto;
use crate::document::{Binary, BinarySubtype, BsonType, Namespace};
use crate::error::{FieldVaultError, Result};
use crate::keys::{self, KeyId, MasterKey};
use crate::schema::Algorithm;
use crate::store::DocumentStore;
use crate::vault::KeyVault;

/// Size of the blob header in bytes.
pub const HEADER_LEN: usize = 18;

/// The plaintext header of an encrypted blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobHeader {
    pub algorithm: Algorithm,
    pub key_id: KeyId,
    pub bson_type: BsonType,
}

impl BlobHeader {
    fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.algorithm.code();
        out[1..17].copy_from_slice(self.key_id.as_bytes());
        out[17] = self.bson_type.code();
        out
    }

    /// Parse the header at the start of `blob`.
    pub fn parse(blob: &[u8]) -> Option<Self> {
        if blob.len() < HEADER_LEN {
            return None;
        }
        Some(Self {
            algorithm: Algorithm::from_code(blob[0])?,
            key_id: KeyId::from_slice(&blob[1..17]).ok()?,
            bson_type: BsonType::from_code(blob[17])?,
        })
    }
}

/// True when `value` is an encrypted binary.
pub fn is_encrypted(value: &Value) -> bool {
    Binary::from_value(value)
        .map(|b| b.subtype == BinarySubtype::Encrypted)
        .unwrap_or(false)
}

/// Explicit encryption against a key vault.
pub struct FieldCodec<S> {
    vault: KeyVault<S>,
    master: Arc<MasterKey>,
}

impl<S: DocumentStore> FieldCodec<S> {
    pub fn new(store: S, key_vault_namespace: Namespace, master: Arc<MasterKey>) -> Self {
        Self {
            vault: KeyVault::new(store, key_vault_namespace),
            master,
        }
    }

    pub fn vault(&self) -> &KeyVault<S> {
        &self.vault
    }

    /// Register a new data key under this codec's master key.
    pub fn create_data_key<I, N>(&self, alt_names: I) -> Result<KeyId>
    where
        I: IntoIterator<Item = N>,
        N: AsRef<str>,
    {
        self.vault.create_data_key(&self.master, alt_names)
    }

    /// Encrypt `value`, recording its inferred type.
    pub fn encrypt(&self, value: &Value, algorithm: Algorithm, key_id: &KeyId) -> Result<Value> {
        let bson_type = BsonType::of(value).ok_or_else(|| FieldVaultError::TypeMismatch {
            field: String::new(),
            expected: "non-null".into(),
        })?;
        self.encrypt_as(value, bson_type, algorithm, key_id)
    }

    /// Encrypt `value` as `bson_type`. The caller has already checked that
    /// the value is an instance of the type.
    pub(crate) fn encrypt_as(
        &self,
        value: &Value,
        bson_type: BsonType,
        algorithm: Algorithm,
        key_id: &KeyId,
    ) -> Result<Value> {
        let data_key = self.vault.data_key(&self.master, key_id)?;
        let field_keys = keys::derive_field_keys(&data_key, key_id)?;

        let header = BlobHeader {
            algorithm,
            key_id: *key_id,
            bson_type,
        }
        .to_bytes();
        let plaintext = serde_json::to_vec(value)?;

        let sealed = match algorithm {
            Algorithm::Deterministic => {
                crypto::encrypt_deterministic(&field_keys.enc, &field_keys.mac, &header, &plaintext)?
            }
            Algorithm::Random => crypto::encrypt_random(&field_keys.enc, &header, &plaintext)?,
        };

        let mut blob = Vec::with_capacity(HEADER_LEN + sealed.len());
        blob.extend_from_slice(&header);
        blob.extend_from_slice(&sealed);
        Ok(Binary::new(BinarySubtype::Encrypted, blob).to_value())
    }

    /// Decrypt an encrypted binary back to its original value.
    pub fn decrypt(&self, value: &Value) -> Result<Value> {
        let binary = Binary::from_value(value)
            .filter(|b| b.subtype == BinarySubtype::Encrypted)
            .ok_or(FieldVaultError::DecryptionFailure)?;
        let header = BlobHeader::parse(&binary.bytes).ok_or(FieldVaultError::DecryptionFailure)?;

        let data_key = self.vault.data_key(&self.master, &header.key_id)?;
        let field_keys = keys::derive_field_keys(&data_key, &header.key_id)?;

        let plaintext = crypto::decrypt(
            &field_keys.enc,
            &binary.bytes[..HEADER_LEN],
            &binary.bytes[HEADER_LEN..],
        )?;
        let restored: Value = serde_json::from_slice(&plaintext)?;
        if !header.bson_type.matches(&restored) {
            return Err(FieldVaultError::DecryptionFailure);
        }
        debug!(key_id = %header.key_id, algorithm = %header.algorithm, "value decrypted");
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::DEFAULT_MASTER_KEY_LEN;
    use crate::memory::MemoryStore;
    use serde_json::json;

    fn codec() -> (FieldCodec<MemoryStore>, KeyId) {
        let master = MasterKey::from_bytes(vec![5u8; DEFAULT_MASTER_KEY_LEN], DEFAULT_MASTER_KEY_LEN)
            .unwrap();
        let codec = FieldCodec::new(
            MemoryStore::new(),
            "fle_demo.__keystore".parse().unwrap(),
            Arc::new(master),
        );
        let id = codec.create_data_key(["example"]).unwrap();
        (codec, id)
    }

    #[test]
    fn test_header_layout() {
        let header = BlobHeader {
            algorithm: Algorithm::Random,
            key_id: KeyId::new(),
            bson_type: BsonType::String,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes[0], 2);
        assert_eq!(bytes[17], 0x02);
        assert_eq!(BlobHeader::parse(&bytes), Some(header));
        assert_eq!(BlobHeader::parse(&bytes[..10]), None);
    }

    #[test]
    fn test_explicit_roundtrip_preserves_type() {
        let (codec, id) = codec();
        for value in [json!("123-12-1234"), json!(42), json!(1_i64 << 40), json!({"$date": "2020-02-07T00:00:00.000Z"})] {
            let sealed = codec.encrypt(&value, Algorithm::Deterministic, &id).unwrap();
            assert!(is_encrypted(&sealed));
            assert_eq!(codec.decrypt(&sealed).unwrap(), value);
        }
    }

    #[test]
    fn test_deterministic_vs_random() {
        let (codec, id) = codec();
        let v = json!("123-12-1234");
        let d1 = codec.encrypt(&v, Algorithm::Deterministic, &id).unwrap();
        let d2 = codec.encrypt(&v, Algorithm::Deterministic, &id).unwrap();
        let r1 = codec.encrypt(&v, Algorithm::Random, &id).unwrap();
        let r2 = codec.encrypt(&v, Algorithm::Random, &id).unwrap();
        assert_eq!(d1, d2);
        assert_ne!(r1, r2);
    }

    #[test]
    fn test_unknown_key_is_encryption_unavailable() {
        let (codec, _) = codec();
        let missing = KeyId::new();
        let err = codec
            .encrypt(&json!("x"), Algorithm::Random, &missing)
            .unwrap_err();
        assert!(matches!(err, FieldVaultError::EncryptionUnavailable(id) if id == missing));
    }

    #[test]
    fn test_null_cannot_be_encrypted() {
        let (codec, id) = codec();
        assert!(codec.encrypt(&Value::Null, Algorithm::Random, &id).is_err());
    }

    #[test]
    fn test_decrypt_rejects_plain_values() {
        let (codec, _) = codec();
        assert!(matches!(
            codec.decrypt(&json!("plain")),
            Err(FieldVaultError::DecryptionFailure)
        ));
    }
}
