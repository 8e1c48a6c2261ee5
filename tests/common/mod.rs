//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use fieldvault::{
    bind_to_collection, build_schema, Document, FieldSchema, Gateway, GatewayOptions, KeyId,
    KeyProvisioner, MasterKey, MemoryStore, Namespace, RawDirective,
};
use serde_json::Value;
use tempfile::TempDir;

pub fn doc(v: Value) -> Document {
    v.as_object().expect("test documents are objects").clone()
}

pub fn people() -> Namespace {
    Namespace::new("fle_demo", "people")
}

pub fn vault_ns() -> Namespace {
    "fle_demo.__keystore".parse().unwrap()
}

/// A bootstrapped store: one master key on disk, one data key in the vault.
pub struct Fixture {
    pub store: MemoryStore,
    pub master: Arc<MasterKey>,
    pub key_id: KeyId,
    pub dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let provisioner = KeyProvisioner::new(store.clone(), vault_ns(), 96);
        let (master, key_id) = provisioner
            .bootstrap(["example"], dir.path().join("key_bytes.bin"))
            .unwrap();
        Self {
            store,
            master: Arc::new(master),
            key_id,
            dir,
        }
    }

    pub fn ssn_schema(&self, algorithm: &str) -> FieldSchema {
        build_schema([("ssn", RawDirective::new("string", algorithm, self.key_id))]).unwrap()
    }

    pub fn gateway(&self, schema: FieldSchema) -> Gateway<MemoryStore> {
        let options = GatewayOptions::new(vault_ns())
            .bind(bind_to_collection(schema, people()))
            .unwrap();
        Gateway::new(self.store.clone(), Arc::clone(&self.master), options)
    }

    pub fn unbound(&self) -> Gateway<MemoryStore> {
        Gateway::unbound(self.store.clone())
    }

    /// The document exactly as the store holds it.
    pub fn raw_one(&self, filter: Value) -> Option<Document> {
        use fieldvault::DocumentStore;
        self.store.find_one(&people(), &doc(filter)).unwrap()
    }
}
