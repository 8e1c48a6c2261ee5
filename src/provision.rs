//! Key provisioning.
//!
//! Provisioning is a one-time bootstrap: it resets the vault's database,
//! generates the local master key, registers a data key in the key vault,
//! and writes the master key to a local file. Running it again destroys the
//! previous vault, and with it every value encrypted under its keys.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use tracing::{info, warn};

use crate::config::FieldVaultConfig;
use crate::crypto;
use crate::document::Namespace;
use crate::error::{FieldVaultError, Result};
use crate::keys::{KeyId, MasterKey};
use crate::store::DocumentStore;
use crate::vault::KeyVault;

/// Generate `len` bytes of master key material from the OS secure RNG.
pub fn generate_key(len: usize) -> Result<MasterKey> {
    let bytes = crypto::random_bytes(len)?;
    MasterKey::from_bytes(bytes, len)
}

/// Write the raw key bytes to `dest`: no header, no checksum.
///
/// The file handle is scoped to this call; it is flushed to disk and closed
/// on every path, including a failed write.
pub fn persist_key(master: &MasterKey, dest: impl AsRef<Path>) -> Result<()> {
    let dest = dest.as_ref();
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(dest)
        .map_err(|e| FieldVaultError::persistence(dest, e))?;
    file.write_all(master.as_bytes())
        .and_then(|_| file.sync_all())
        .map_err(|e| FieldVaultError::persistence(dest, e))?;

    info!(path = %dest.display(), len = master.len(), "master key written");
    Ok(())
}

/// Read a key file, requiring exactly `expected_len` bytes.
pub fn load_key(path: impl AsRef<Path>, expected_len: usize) -> Result<MasterKey> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|e| FieldVaultError::persistence(path, e))?;
    MasterKey::from_bytes(bytes, expected_len)
}

/// Creates and registers keys against one key vault.
pub struct KeyProvisioner<S> {
    store: S,
    vault: KeyVault<S>,
    key_len: usize,
}

impl<S: DocumentStore + Clone> KeyProvisioner<S> {
    pub fn new(store: S, key_vault_namespace: Namespace, key_len: usize) -> Self {
        Self {
            vault: KeyVault::new(store.clone(), key_vault_namespace),
            store,
            key_len,
        }
    }

    pub fn from_config(store: S, config: &FieldVaultConfig) -> Self {
        Self::new(store, config.key_vault_namespace.clone(), config.key_len)
    }

    pub fn vault(&self) -> &KeyVault<S> {
        &self.vault
    }

    pub fn generate_key(&self) -> Result<MasterKey> {
        generate_key(self.key_len)
    }

    /// Register a data key wrapped under `master`. Returns the vault id.
    pub fn register_key<I, N>(&self, master: &MasterKey, alt_names: I) -> Result<KeyId>
    where
        I: IntoIterator<Item = N>,
        N: AsRef<str>,
    {
        if master.len() != self.key_len {
            return Err(FieldVaultError::KeyLength {
                expected: self.key_len,
                actual: master.len(),
            });
        }
        self.vault.create_data_key(master, alt_names)
    }

    pub fn persist_key(&self, master: &MasterKey, dest: impl AsRef<Path>) -> Result<()> {
        persist_key(master, dest)
    }

    /// Drop the database holding the key vault, including every other
    /// collection in it.
    pub fn reset_vault(&self) -> Result<()> {
        let db = self.vault.namespace().db();
        warn!(database = db, "dropping key vault database");
        self.store
            .drop_database(db)
            .map_err(FieldVaultError::vault)
    }

    /// Reset, generate, register, persist. Returns the new master key and
    /// the id of its first data key.
    pub fn bootstrap<I, N>(&self, alt_names: I, dest: impl AsRef<Path>) -> Result<(MasterKey, KeyId)>
    where
        I: IntoIterator<Item = N>,
        N: AsRef<str>,
    {
        self.reset_vault()?;
        let master = self.generate_key()?;
        let key_id = self.register_key(&master, alt_names)?;
        self.persist_key(&master, dest)?;
        info!(key_id = %key_id, vault = %self.vault.namespace(), "key vault bootstrapped");
        Ok((master, key_id))
    }
}
