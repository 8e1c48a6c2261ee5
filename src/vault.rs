//! The key vault.
//!
//! A key vault is an ordinary collection in the document store. Each entry
//! holds one data key, wrapped under the local master key:
//!
//! ```text
//! { "_id":          <$binary subtype 04>,
//!   "keyMaterial":  <$binary subtype 00>,   // wrapped data key
//!   "keyAltNames":  ["example"],
//!   "creationDate": {"$date": ...},
//!   "updateDate":   {"$date": ...},
//!   "status":       0,
//!   "masterKey":    {"provider": "local"} }
//! ```
//!
//! Every store failure during registration or lookup surfaces as
//! `VaultUnavailable`.

use std::collections::BTreeSet;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::document::{Binary, BinarySubtype, Document, Namespace};
use crate::error::{FieldVaultError, Result};
use crate::keys::{self, DataKey, KeyId, MasterKey};
use crate::store::DocumentStore;

/// The KMS provider name recorded on every entry.
pub const LOCAL_PROVIDER: &str = "local";

/// A stored, wrapped data key and its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyVaultEntry {
    pub id: KeyId,
    pub key_material: Vec<u8>,
    pub key_alt_names: Vec<String>,
    pub creation_date: DateTime<Utc>,
    pub update_date: DateTime<Utc>,
    pub status: i32,
    pub provider: String,
}

fn date_value(date: &DateTime<Utc>) -> Value {
    json!({ "$date": date.to_rfc3339_opts(SecondsFormat::Millis, true) })
}

fn parse_date(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let text = value?.get("$date")?.as_str()?;
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

impl KeyVaultEntry {
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("_id".into(), self.id.to_binary().to_value());
        doc.insert(
            "keyMaterial".into(),
            Binary::new(BinarySubtype::Generic, self.key_material.clone()).to_value(),
        );
        doc.insert("keyAltNames".into(), json!(self.key_alt_names));
        doc.insert("creationDate".into(), date_value(&self.creation_date));
        doc.insert("updateDate".into(), date_value(&self.update_date));
        doc.insert("status".into(), json!(self.status));
        doc.insert("masterKey".into(), json!({ "provider": self.provider }));
        doc
    }

    pub fn from_document(doc: &Document) -> Result<Self> {
        let id = doc
            .get("_id")
            .and_then(Binary::from_value)
            .ok_or(FieldVaultError::InvalidKey)
            .and_then(|b| KeyId::from_binary(&b).map_err(|_| FieldVaultError::InvalidKey))?;
        let key_material = doc
            .get("keyMaterial")
            .and_then(Binary::from_value)
            .ok_or(FieldVaultError::InvalidKey)?
            .bytes;
        let key_alt_names = doc
            .get("keyAltNames")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let creation_date = parse_date(doc.get("creationDate")).ok_or(FieldVaultError::InvalidKey)?;
        let update_date = parse_date(doc.get("updateDate")).unwrap_or(creation_date);
        let status = doc
            .get("status")
            .and_then(Value::as_i64)
            .and_then(|s| i32::try_from(s).ok())
            .unwrap_or(0);
        let provider = doc
            .get("masterKey")
            .and_then(|m| m.get("provider"))
            .and_then(Value::as_str)
            .unwrap_or(LOCAL_PROVIDER)
            .to_string();

        Ok(Self {
            id,
            key_material,
            key_alt_names,
            creation_date,
            update_date,
            status,
            provider,
        })
    }
}

/// Handle to the key-vault collection.
#[derive(Clone)]
pub struct KeyVault<S> {
    store: S,
    namespace: Namespace,
}

impl<S: DocumentStore> KeyVault<S> {
    pub fn new(store: S, namespace: Namespace) -> Self {
        Self { store, namespace }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Create a data key, wrap it under `master`, and store the entry.
    ///
    /// Alt names form a set; each must be unused across the vault.
    pub fn create_data_key<I, N>(&self, master: &MasterKey, alt_names: I) -> Result<KeyId>
    where
        I: IntoIterator<Item = N>,
        N: AsRef<str>,
    {
        let names: BTreeSet<String> = alt_names
            .into_iter()
            .map(|n| n.as_ref().to_string())
            .collect();

        for name in &names {
            if self.find_by_alt_name(name)?.is_some() {
                return Err(FieldVaultError::DuplicateKeyAltName(name.clone()));
            }
        }

        let id = KeyId::new();
        let data_key = DataKey::generate()?;
        let now = Utc::now();
        let entry = KeyVaultEntry {
            id,
            key_material: keys::wrap_data_key(master, &id, &data_key)?,
            key_alt_names: names.into_iter().collect(),
            creation_date: now,
            update_date: now,
            status: 0,
            provider: LOCAL_PROVIDER.to_string(),
        };

        self.store
            .insert_one(&self.namespace, entry.to_document())
            .map_err(FieldVaultError::vault)?;
        info!(key_id = %id, vault = %self.namespace, alt_names = ?entry.key_alt_names, "data key registered");
        Ok(id)
    }

    pub fn find_by_id(&self, id: &KeyId) -> Result<Option<KeyVaultEntry>> {
        let mut filter = Document::new();
        filter.insert("_id".into(), id.to_binary().to_value());
        self.find_one(&filter)
    }

    pub fn find_by_alt_name(&self, name: &str) -> Result<Option<KeyVaultEntry>> {
        let mut filter = Document::new();
        filter.insert("keyAltNames".into(), json!(name));
        self.find_one(&filter)
    }

    /// Every entry in the vault.
    pub fn entries(&self) -> Result<Vec<KeyVaultEntry>> {
        self.store
            .find(&self.namespace, &Document::new())
            .map_err(FieldVaultError::vault)?
            .iter()
            .map(KeyVaultEntry::from_document)
            .collect()
    }

    fn find_one(&self, filter: &Document) -> Result<Option<KeyVaultEntry>> {
        let found = self
            .store
            .find_one(&self.namespace, filter)
            .map_err(FieldVaultError::vault)?;
        debug!(vault = %self.namespace, hit = found.is_some(), "key vault lookup");
        found.as_ref().map(KeyVaultEntry::from_document).transpose()
    }

    /// Look up `id` and unwrap its data key. A missing entry means nothing
    /// can be encrypted or decrypted under that key.
    pub(crate) fn data_key(&self, master: &MasterKey, id: &KeyId) -> Result<DataKey> {
        let entry = self
            .find_by_id(id)?
            .ok_or(FieldVaultError::EncryptionUnavailable(*id))?;
        keys::unwrap_data_key(master, id, &entry.key_material)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::DEFAULT_MASTER_KEY_LEN;
    use crate::memory::MemoryStore;

    fn vault() -> (MemoryStore, KeyVault<MemoryStore>) {
        let store = MemoryStore::new();
        let vault = KeyVault::new(store.clone(), "fle_demo.__keystore".parse().unwrap());
        (store, vault)
    }

    fn master() -> MasterKey {
        MasterKey::from_bytes(vec![3u8; DEFAULT_MASTER_KEY_LEN], DEFAULT_MASTER_KEY_LEN).unwrap()
    }

    #[test]
    fn test_entry_document_roundtrip() {
        let (_, vault) = vault();
        let id = vault.create_data_key(&master(), ["example"]).unwrap();
        let entry = vault.find_by_id(&id).unwrap().unwrap();
        let doc = entry.to_document();
        assert_eq!(doc["masterKey"]["provider"], "local");
        assert_eq!(KeyVaultEntry::from_document(&doc).unwrap(), entry);
    }

    #[test]
    fn test_lookup_by_alt_name() {
        let (_, vault) = vault();
        let id = vault.create_data_key(&master(), ["example", "ssn-key"]).unwrap();
        assert_eq!(vault.find_by_alt_name("ssn-key").unwrap().unwrap().id, id);
        assert!(vault.find_by_alt_name("other").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_alt_name_rejected() {
        let (_, vault) = vault();
        vault.create_data_key(&master(), ["example"]).unwrap();
        let err = vault.create_data_key(&master(), ["example"]).unwrap_err();
        assert!(matches!(err, FieldVaultError::DuplicateKeyAltName(n) if n == "example"));
        assert_eq!(vault.entries().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_key_is_encryption_unavailable() {
        let (_, vault) = vault();
        let id = KeyId::new();
        assert!(matches!(
            vault.data_key(&master(), &id),
            Err(FieldVaultError::EncryptionUnavailable(missing)) if missing == id
        ));
    }

    #[test]
    fn test_store_outage_is_vault_unavailable() {
        let (store, vault) = vault();
        store.set_available(false);
        assert!(matches!(
            vault.create_data_key(&master(), ["example"]),
            Err(FieldVaultError::VaultUnavailable(_))
        ));
    }
}
