mod common;

use std::fs;

use common::vault_ns;
use fieldvault::{load_key, FieldVaultConfig, FieldVaultError, KeyProvisioner, MemoryStore};

#[test]
fn test_bootstrap_writes_key_file_and_vault_entry() {
    let dir = tempfile::tempdir().unwrap();
    let key_path = dir.path().join("key_bytes.bin");
    let store = MemoryStore::new();
    let provisioner = KeyProvisioner::new(store, vault_ns(), 96);

    let (master, key_id) = provisioner.bootstrap(["example"], &key_path).unwrap();

    assert_eq!(master.len(), 96);
    assert_eq!(fs::read(&key_path).unwrap().len(), 96);

    let entry = provisioner.vault().find_by_id(&key_id).unwrap().unwrap();
    assert_eq!(entry.key_alt_names, vec!["example"]);
    assert_eq!(entry.provider, "local");
    assert_eq!(
        provisioner.vault().find_by_alt_name("example").unwrap().unwrap().id,
        key_id
    );
}

#[test]
fn test_bootstrap_again_resets_previous_vault() {
    let dir = tempfile::tempdir().unwrap();
    let key_path = dir.path().join("key_bytes.bin");
    let provisioner = KeyProvisioner::new(MemoryStore::new(), vault_ns(), 96);

    let (_, first) = provisioner.bootstrap(["example"], &key_path).unwrap();
    let (_, second) = provisioner.bootstrap(["example"], &key_path).unwrap();

    assert_ne!(first, second);
    assert!(provisioner.vault().find_by_id(&first).unwrap().is_none());
    assert_eq!(provisioner.vault().entries().unwrap().len(), 1);
}

#[test]
fn test_persisted_key_reloads_for_a_later_session() {
    let dir = tempfile::tempdir().unwrap();
    let key_path = dir.path().join("key_bytes.bin");
    let store = MemoryStore::new();
    let provisioner = KeyProvisioner::new(store.clone(), vault_ns(), 96);
    let (_, key_id) = provisioner.bootstrap(["example"], &key_path).unwrap();

    let reloaded = load_key(&key_path, 96).unwrap();
    let codec = fieldvault::FieldCodec::new(store, vault_ns(), std::sync::Arc::new(reloaded));
    let sealed = codec
        .encrypt(&serde_json::json!("x"), fieldvault::Algorithm::Random, &key_id)
        .unwrap();
    assert_eq!(codec.decrypt(&sealed).unwrap(), "x");
}

#[test]
fn test_truncated_key_file_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let key_path = dir.path().join("key_bytes.bin");
    fs::write(&key_path, [0u8; 50]).unwrap();
    assert!(matches!(
        load_key(&key_path, 96),
        Err(FieldVaultError::KeyLength { expected: 96, actual: 50 })
    ));
    assert!(matches!(
        load_key(dir.path().join("absent.bin"), 96),
        Err(FieldVaultError::Persistence { .. })
    ));
}

#[test]
fn test_registration_fails_when_vault_unreachable() {
    let store = MemoryStore::new();
    let provisioner = KeyProvisioner::from_config(store.clone(), &FieldVaultConfig::default());
    let master = provisioner.generate_key().unwrap();
    store.set_available(false);
    assert!(matches!(
        provisioner.register_key(&master, ["example"]),
        Err(FieldVaultError::VaultUnavailable(_))
    ));
}
