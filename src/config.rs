//! Runtime configuration.
//!
//! Read once at startup and passed explicitly to the components that need
//! it. Nothing in the crate reads the environment on its own.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::document::Namespace;
use crate::error::{FieldVaultError, Result};
use crate::keys::{DEFAULT_MASTER_KEY_LEN, MIN_MASTER_KEY_LEN};

pub const ENV_CONNECTION_STRING: &str = "MDB_URL";
pub const ENV_KEY_VAULT: &str = "FIELDVAULT_KEY_VAULT";
pub const ENV_KEY_PATH: &str = "FIELDVAULT_KEY_PATH";
pub const ENV_SCHEMA_PATH: &str = "FIELDVAULT_SCHEMA_PATH";
pub const ENV_KEY_LEN: &str = "FIELDVAULT_KEY_LEN";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldVaultConfig {
    /// Connection string for the document store, if it needs one.
    pub connection_string: Option<String>,
    /// Where key-vault entries live.
    pub key_vault_namespace: Namespace,
    /// Local master key file.
    pub key_path: PathBuf,
    /// Saved schema file.
    pub schema_path: PathBuf,
    /// Master key length in bytes.
    pub key_len: usize,
    /// Alt names given to the data key created at bootstrap.
    pub key_alt_names: Vec<String>,
}

impl Default for FieldVaultConfig {
    fn default() -> Self {
        Self {
            connection_string: None,
            key_vault_namespace: Namespace::new("fle_demo", "__keystore"),
            key_path: PathBuf::from("key_bytes.bin"),
            schema_path: PathBuf::from("json_schema.json"),
            key_len: DEFAULT_MASTER_KEY_LEN,
            key_alt_names: vec!["example".to_string()],
        }
    }
}

impl FieldVaultConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(url) = lookup(ENV_CONNECTION_STRING) {
            config.connection_string = Some(url);
        }
        if let Some(ns) = lookup(ENV_KEY_VAULT) {
            config.key_vault_namespace = ns.parse()?;
        }
        if let Some(path) = lookup(ENV_KEY_PATH) {
            config.key_path = PathBuf::from(path);
        }
        if let Some(path) = lookup(ENV_SCHEMA_PATH) {
            config.schema_path = PathBuf::from(path);
        }
        if let Some(len) = lookup(ENV_KEY_LEN) {
            config.key_len = len
                .trim()
                .parse()
                .map_err(|_| FieldVaultError::Config(format!("{ENV_KEY_LEN} is not a number: {len}")))?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| FieldVaultError::persistence(path, e))?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.key_len < MIN_MASTER_KEY_LEN {
            return Err(FieldVaultError::Config(format!(
                "key_len must be at least {MIN_MASTER_KEY_LEN} bytes, got {}",
                self.key_len
            )));
        }
        if self.key_path.as_os_str().is_empty() {
            return Err(FieldVaultError::Config("key_path is empty".into()));
        }
        if self.schema_path.as_os_str().is_empty() {
            return Err(FieldVaultError::Config("schema_path is empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = FieldVaultConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.key_vault_namespace.to_string(), "fle_demo.__keystore");
        assert_eq!(config.key_len, 96);
        assert_eq!(config.key_alt_names, vec!["example"]);
        assert!(config.connection_string.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let config = FieldVaultConfig::from_lookup(lookup(&[
            (ENV_CONNECTION_STRING, "mongodb://localhost:27017"),
            (ENV_KEY_VAULT, "vaults.keys"),
            (ENV_KEY_LEN, "64"),
        ]))
        .unwrap();
        assert_eq!(config.connection_string.as_deref(), Some("mongodb://localhost:27017"));
        assert_eq!(config.key_vault_namespace, Namespace::new("vaults", "keys"));
        assert_eq!(config.key_len, 64);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            FieldVaultConfig::from_lookup(lookup(&[(ENV_KEY_LEN, "16")])),
            Err(FieldVaultError::Config(_))
        ));
        assert!(matches!(
            FieldVaultConfig::from_lookup(lookup(&[(ENV_KEY_LEN, "lots")])),
            Err(FieldVaultError::Config(_))
        ));
        assert!(FieldVaultConfig::from_lookup(lookup(&[(ENV_KEY_VAULT, "novault")])).is_err());
    }

    #[test]
    fn test_from_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fieldvault.json");
        fs::write(&path, r#"{"key_vault_namespace": "hr.__keys", "key_path": "/tmp/k.bin"}"#).unwrap();
        let config = FieldVaultConfig::from_file(&path).unwrap();
        assert_eq!(config.key_vault_namespace, Namespace::new("hr", "__keys"));
        assert_eq!(config.key_path, PathBuf::from("/tmp/k.bin"));
        assert_eq!(config.key_len, 96);
    }
}
