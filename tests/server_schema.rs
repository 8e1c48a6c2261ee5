mod common;

use std::sync::Arc;

use common::{doc, people, vault_ns, Fixture};
use fieldvault::codec::is_encrypted;
use fieldvault::store::StoreError;
use fieldvault::{bind_to_collection, FieldVaultError, Gateway, GatewayOptions, GatewayState};
use serde_json::json;

#[test]
fn test_validator_rejects_plaintext_from_any_writer() {
    let fx = Fixture::new();
    let binding = bind_to_collection(fx.ssn_schema("Random"), people());
    binding.apply_validator(&fx.store).unwrap();

    let err = fx
        .unbound()
        .insert_one(&people(), doc(json!({"full_name": "Dora Thewlis", "ssn": "234-23-2345"})))
        .unwrap_err();
    assert!(matches!(err, FieldVaultError::Store(StoreError::ValidationFailed(_))));

    // Documents without the field are fine.
    fx.unbound()
        .insert_one(&people(), doc(json!({"full_name": "No SSN"})))
        .unwrap();
}

#[test]
fn test_gateway_binds_from_server_schema() {
    let fx = Fixture::new();
    bind_to_collection(fx.ssn_schema("Deterministic"), people())
        .apply_validator(&fx.store)
        .unwrap();

    let options = GatewayOptions::new(vault_ns())
        .bind_remote(&fx.store, people())
        .unwrap();
    let gw = Gateway::new(fx.store.clone(), Arc::clone(&fx.master), options);
    assert_eq!(gw.state(), GatewayState::Bound);

    gw.insert_one(&people(), doc(json!({"full_name": "Sophia Duleep Singh", "ssn": "123-12-1234"})))
        .unwrap();
    assert!(is_encrypted(&fx.raw_one(json!({})).unwrap()["ssn"]));

    let found = gw
        .find_one(&people(), &doc(json!({"ssn": "123-12-1234"})))
        .unwrap()
        .unwrap();
    assert_eq!(found["full_name"], "Sophia Duleep Singh");
    assert_eq!(found["ssn"], "123-12-1234");
}

#[test]
fn test_collection_without_validator_stays_unbound() {
    let fx = Fixture::new();
    let options = GatewayOptions::new(vault_ns())
        .bind_remote(&fx.store, people())
        .unwrap();
    let gw = Gateway::new(fx.store.clone(), Arc::clone(&fx.master), options);
    assert_eq!(gw.state(), GatewayState::Unbound);
}

#[test]
fn test_validator_rejects_wrong_algorithm_ciphertext() {
    let fx = Fixture::new();
    bind_to_collection(fx.ssn_schema("Deterministic"), people())
        .apply_validator(&fx.store)
        .unwrap();

    // A client with a stale local schema encrypts with the wrong algorithm.
    let stale = fx.gateway(fx.ssn_schema("Random"));
    let err = stale
        .insert_one(&people(), doc(json!({"ssn": "123-12-1234"})))
        .unwrap_err();
    assert!(matches!(err, FieldVaultError::Store(StoreError::ValidationFailed(_))));
}
