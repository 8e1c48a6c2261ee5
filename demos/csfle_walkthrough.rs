//! Walkthrough: provision a key, bind a schema, and read the result with and
//! without the key.
//!
//! Run with: `cargo run --example csfle_walkthrough`
//! Set `RUST_LOG=fieldvault=debug` to see each vault lookup.

use std::sync::Arc;

use fieldvault::{
    bind_to_collection, build_schema, load_key, DocumentStore, FieldSchema, FieldVaultConfig,
    FieldVaultError, Gateway, GatewayOptions, KeyProvisioner, MemoryStore, Namespace, RawDirective,
};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

fn doc(v: Value) -> fieldvault::Document {
    v.as_object().cloned().unwrap_or_default()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // 1. Configuration, with key and schema files under a scratch directory
    let dir = tempfile::tempdir()?;
    let mut config = FieldVaultConfig::from_env()?;
    config.key_path = dir.path().join("key_bytes.bin");
    config.schema_path = dir.path().join("json_schema.json");

    let store = MemoryStore::new();
    let people = Namespace::new("fle_demo", "people");

    // 2. Provision: reset the vault, create the master key and a data key
    let provisioner = KeyProvisioner::from_config(store.clone(), &config);
    let (_, key_id) = provisioner.bootstrap(&config.key_alt_names, &config.key_path)?;
    println!("Provisioned data key {key_id}");

    // 3. Declare the encrypted fields and save the schema
    let schema = build_schema([
        ("ssn", RawDirective::new("string", "Deterministic", key_id)),
        ("blood_type", RawDirective::new("string", "Random", key_id)),
    ])?;
    schema.save(&config.schema_path)?;

    // 4. A later session: reload key and schema from disk
    let master = Arc::new(load_key(&config.key_path, config.key_len)?);
    let schema = FieldSchema::load(&config.schema_path)?;
    let options = GatewayOptions::from_config(&config).bind(bind_to_collection(schema, people.clone()))?;
    let secure = Gateway::new(store.clone(), master, options);

    secure.insert_one(
        &people,
        doc(json!({
            "full_name": "Sophia Duleep Singh",
            "ssn": "123-12-1234",
            "blood_type": "AB-",
        })),
    )?;

    // 5. Deterministic fields can be queried by value
    if let Some(found) = secure.find_one(&people, &doc(json!({"ssn": "123-12-1234"})))? {
        println!("Bound read:   {}", Value::Object(found));
    }

    // 6. Random fields cannot
    match secure.find_one(&people, &doc(json!({"blood_type": "AB-"}))) {
        Err(FieldVaultError::NonFilterableField(field)) => {
            println!("Filter on {field} refused: Random fields are not queryable");
        }
        other => println!("Unexpected result: {other:?}"),
    }

    // 7. Without the key the same document is ciphertext
    let plain = Gateway::unbound(store.clone());
    if let Some(raw) = plain.find_one(&people, &doc(json!({"full_name": "Sophia Duleep Singh"})))? {
        println!("Unbound read: {}", Value::Object(raw));
    }

    // 8. Nothing stops an unbound writer without a server-side validator
    plain.insert_one(&people, doc(json!({"full_name": "Dora Maar", "ssn": "987-65-4321"})))?;
    let total = store.find(&people, &doc(json!({})))?.len();
    println!("Collection holds {total} document(s), one of them unencrypted");

    secure.close();
    Ok(())
}
