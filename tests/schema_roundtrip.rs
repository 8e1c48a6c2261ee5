use fieldvault::{build_schema, Algorithm, FieldSchema, FieldVaultError, KeyId, RawDirective};
use proptest::prelude::*;
use uuid::Uuid;

fn directive() -> impl Strategy<Value = RawDirective> {
    let comparable = prop_oneof![Just("string"), Just("int"), Just("long"), Just("date"), Just("binData")];
    let any_type = prop_oneof![Just("double"), Just("bool"), Just("object"), Just("array")];
    let key = any::<[u8; 16]>().prop_map(|b| KeyId::from_uuid(Uuid::from_bytes(b)));

    prop_oneof![
        (comparable, key.clone()).prop_map(|(t, k)| RawDirective::new(t, "Deterministic", k)),
        (any_type, key).prop_map(|(t, k)| RawDirective::new(t, "Random", k)),
    ]
}

proptest! {
    #[test]
    fn save_then_load_preserves_every_directive(
        fields in prop::collection::btree_map("[a-z][a-z_]{0,11}", directive(), 1..6)
    ) {
        let schema = build_schema(fields.clone()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("json_schema.json");
        schema.save(&path).unwrap();
        let loaded = FieldSchema::load(&path).unwrap();

        prop_assert_eq!(&loaded, &schema);
        for (name, raw) in &fields {
            let d = loaded.get(name).unwrap();
            prop_assert_eq!(d.key_id, raw.key_id);
            prop_assert_eq!(d.algorithm.as_str(), raw.algorithm.as_str());
            prop_assert_eq!(d.bson_type.as_str(), raw.bson_type.as_str());
        }
    }
}

#[test]
fn test_saved_file_uses_json_schema_shape() {
    let key = KeyId::new();
    let schema = build_schema([("ssn", RawDirective::new("string", "Random", key))]).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("json_schema.json");
    schema.save(&path).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["bsonType"], "object");
    let encrypt = &value["properties"]["ssn"]["encrypt"];
    assert_eq!(encrypt["algorithm"], "Random");
    assert_eq!(encrypt["keyId"][0]["$binary"]["subType"], "04");
}

#[test]
fn test_load_accepts_driver_algorithm_names() {
    let key = KeyId::new();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("json_schema.json");
    let text = serde_json::json!({
        "bsonType": "object",
        "properties": {"ssn": {"encrypt": {
            "bsonType": "string",
            "algorithm": "AEAD_AES_256_CBC_HMAC_SHA_512-Deterministic",
            "keyId": [key.to_binary().to_value()],
        }}}
    });
    std::fs::write(&path, text.to_string()).unwrap();

    let schema = FieldSchema::load(&path).unwrap();
    assert_eq!(schema.get("ssn").unwrap().algorithm, Algorithm::Deterministic);
}

#[test]
fn test_load_rejects_unknown_algorithm() {
    let key = KeyId::new();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("json_schema.json");
    let text = serde_json::json!({
        "properties": {"ssn": {"encrypt": {
            "bsonType": "string",
            "algorithm": "Searchable",
            "keyId": [key.to_binary().to_value()],
        }}}
    });
    std::fs::write(&path, text.to_string()).unwrap();

    assert!(matches!(
        FieldSchema::load(&path),
        Err(FieldVaultError::UnknownAlgorithm(a)) if a == "Searchable"
    ));
}

#[test]
fn test_load_missing_file_is_persistence_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        FieldSchema::load(dir.path().join("nope.json")),
        Err(FieldVaultError::Persistence { .. })
    ));
}
