//! Key material and derivation.
//!
//! This module owns three responsibilities:
//! 1. Holding secret material (`MasterKey`, `DataKey`, `FieldKeys`) in
//!    types that are opaque, non-cloneable, and zeroised on drop.
//! 2. Deriving subkeys with HKDF-SHA256.
//! 3. Wrapping data keys under the master key for storage in the key vault.
//!
//! This is one of exactly two modules permitted to import `ring` directly
//! (the other is `crypto`).
//!
//! ## Key hierarchy
//!
//! ```text
//! MasterKey (N bytes, local file)
//!   └─ HKDF(info = "local:wrap")            -> wrapping key
//!        └─ AES-256-GCM(aad = key id)       -> keyMaterial in the vault
//! DataKey (32 bytes, one per vault entry)
//!   ├─ HKDF(info = "{key_id}:enc")          -> field encryption key
//!   └─ HKDF(info = "{key_id}:mac")          -> synthetic nonce key
//! ```

use std::fmt;
use std::str::FromStr;

use ring::hkdf;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{self, KEY_LEN};
use crate::document::{Binary, BinarySubtype};
use crate::error::FieldVaultError;

/// Default master key length, matching the local KMS provider.
pub const DEFAULT_MASTER_KEY_LEN: usize = 96;

/// Smallest master key length accepted by configuration.
pub const MIN_MASTER_KEY_LEN: usize = KEY_LEN;

const WRAP_INFO: &str = "local:wrap";

// ---------------------------------------------------------------------------
// Master key
// ---------------------------------------------------------------------------

/// The local master key. It never leaves the client; it only wraps and
/// unwraps data keys held in the key vault.
///
/// - Not `Clone`. Share it with `Arc<MasterKey>`.
/// - Zeroised on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: Vec<u8>,
}

impl MasterKey {
    /// Construct a `MasterKey` from raw bytes, checking the expected length.
    pub fn from_bytes(bytes: Vec<u8>, expected_len: usize) -> Result<Self, FieldVaultError> {
        if bytes.len() != expected_len {
            return Err(FieldVaultError::KeyLength {
                expected: expected_len,
                actual: bytes.len(),
            });
        }
        if bytes.len() < MIN_MASTER_KEY_LEN {
            return Err(FieldVaultError::InvalidKey);
        }
        Ok(Self { bytes })
    }

    /// Number of raw key bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// `pub(crate)`: raw bytes leave the crate only through `persist_key`.
    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("len", &self.bytes.len())
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Data key
// ---------------------------------------------------------------------------

/// A data key, stored wrapped in a key-vault entry.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DataKey {
    bytes: [u8; KEY_LEN],
}

impl DataKey {
    pub(crate) fn generate() -> Result<Self, FieldVaultError> {
        Ok(Self {
            bytes: crypto::generate_random_key()?,
        })
    }
}

/// The two subkeys a field cipher needs.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct FieldKeys {
    pub(crate) enc: [u8; KEY_LEN],
    pub(crate) mac: [u8; KEY_LEN],
}

// ---------------------------------------------------------------------------
// Key id
// ---------------------------------------------------------------------------

/// Identifier of a key-vault entry. Stored as a UUID (binary subtype 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyId(Uuid);

impl KeyId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parse the 16 raw bytes of a UUID.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, FieldVaultError> {
        Uuid::from_slice(bytes)
            .map(Self)
            .map_err(|_| FieldVaultError::InvalidSchema("key id must be 16 bytes".into()))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// The extended-JSON binary form (`$binary`, subtype `04`).
    pub fn to_binary(&self) -> Binary {
        Binary::new(BinarySubtype::Uuid, self.as_bytes().to_vec())
    }

    /// Parse from a binary value, requiring the UUID subtype.
    pub fn from_binary(binary: &Binary) -> Result<Self, FieldVaultError> {
        if binary.subtype != BinarySubtype::Uuid {
            return Err(FieldVaultError::InvalidSchema(
                "key id must be binary subtype 04".into(),
            ));
        }
        Self::from_slice(&binary.bytes)
    }
}

impl Default for KeyId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for KeyId {
    type Err = FieldVaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| FieldVaultError::InvalidSchema(format!("malformed key id: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Derivation
// ---------------------------------------------------------------------------

/// HKDF-SHA256 with an empty salt, producing one 256-bit subkey.
fn derive(ikm: &[u8], info: &str) -> Result<[u8; KEY_LEN], FieldVaultError> {
    // An empty salt is treated by HKDF as a zero-filled salt of hash length.
    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, &[]);
    let prk = salt.extract(ikm);

    let info_slices = [info.as_bytes()];
    let okm = prk
        .expand(&info_slices, hkdf::HKDF_SHA256)
        .map_err(|_| FieldVaultError::KeyDerivationFailure)?;

    let mut out = [0u8; KEY_LEN];
    okm.fill(&mut out)
        .map_err(|_| FieldVaultError::KeyDerivationFailure)?;
    Ok(out)
}

/// Derive the encryption and nonce subkeys of a data key.
pub(crate) fn derive_field_keys(
    data_key: &DataKey,
    key_id: &KeyId,
) -> Result<FieldKeys, FieldVaultError> {
    Ok(FieldKeys {
        enc: derive(&data_key.bytes, &format!("{key_id}:enc"))?,
        mac: derive(&data_key.bytes, &format!("{key_id}:mac"))?,
    })
}

/// Wrap a data key under the master key. The key id is bound as associated
/// data, so wrapped material cannot be moved to another vault entry.
pub(crate) fn wrap_data_key(
    master: &MasterKey,
    key_id: &KeyId,
    data_key: &DataKey,
) -> Result<Vec<u8>, FieldVaultError> {
    let mut wrapping = derive(master.as_bytes(), WRAP_INFO)?;
    let wrapped = crypto::encrypt_random(&wrapping, key_id.as_bytes(), &data_key.bytes);
    wrapping.zeroize();
    wrapped
}

/// Reverse of [`wrap_data_key`]. Fails with `DecryptionFailure` when the
/// master key differs from the one that wrapped the entry.
pub(crate) fn unwrap_data_key(
    master: &MasterKey,
    key_id: &KeyId,
    wrapped: &[u8],
) -> Result<DataKey, FieldVaultError> {
    let mut wrapping = derive(master.as_bytes(), WRAP_INFO)?;
    let opened = crypto::decrypt(&wrapping, key_id.as_bytes(), wrapped);
    wrapping.zeroize();
    let mut plain = opened?;

    if plain.len() != KEY_LEN {
        let actual = plain.len();
        plain.zeroize();
        return Err(FieldVaultError::KeyLength {
            expected: KEY_LEN,
            actual,
        });
    }
    let mut bytes = [0u8; KEY_LEN];
    bytes.copy_from_slice(&plain);
    plain.zeroize();
    Ok(DataKey { bytes })
}
