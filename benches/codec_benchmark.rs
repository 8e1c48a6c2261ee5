//! Gateway write/read throughput per algorithm.
//!
//! Every encrypted field costs one key-vault lookup plus a data-key unwrap,
//! so these numbers are dominated by the vault round trip, not AES-GCM.
//!
//! Run with: `cargo bench --bench codec_benchmark`

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fieldvault::{
    bind_to_collection, build_schema, generate_master_key, Document, FieldCodec, Gateway,
    GatewayOptions, MemoryStore, Namespace, RawDirective,
};
use serde_json::json;

fn doc(v: serde_json::Value) -> Document {
    v.as_object().cloned().unwrap_or_default()
}

fn bench_gateway(c: &mut Criterion) {
    let mut group = c.benchmark_group("gateway");

    let store = MemoryStore::new();
    let master = Arc::new(generate_master_key().unwrap());
    let vault_ns: Namespace = "fle_demo.__keystore".parse().unwrap();
    let codec = FieldCodec::new(store.clone(), vault_ns.clone(), Arc::clone(&master));
    let key_id = codec.create_data_key(["bench"]).unwrap();

    for algorithm in ["Deterministic", "Random"] {
        let ns = Namespace::new("bench", algorithm.to_lowercase());
        let schema = build_schema([("ssn", RawDirective::new("string", algorithm, key_id))]).unwrap();
        let options = GatewayOptions::new(vault_ns.clone())
            .bind(bind_to_collection(schema, ns.clone()))
            .unwrap();
        let gateway = Gateway::new(store.clone(), Arc::clone(&master), options);

        group.bench_function(format!("insert_one_{}", algorithm.to_lowercase()), |b| {
            b.iter(|| {
                gateway
                    .insert_one(
                        black_box(&ns),
                        doc(json!({"full_name": "Sophia Duleep Singh", "ssn": "123-12-1234"})),
                    )
                    .unwrap();
            });
        });
    }

    // Reads decrypt every document returned, so keep the collection small.
    let ns = Namespace::new("bench", "reads");
    let schema = build_schema([("ssn", RawDirective::new("string", "Deterministic", key_id))]).unwrap();
    let options = GatewayOptions::new(vault_ns)
        .bind(bind_to_collection(schema, ns.clone()))
        .unwrap();
    let gateway = Gateway::new(store, master, options);
    for i in 0..100 {
        gateway
            .insert_one(&ns, doc(json!({"n": i, "ssn": format!("000-00-{i:04}")})))
            .unwrap();
    }
    let filter = doc(json!({"ssn": "000-00-0042"}));
    group.bench_function("find_deterministic_equality", |b| {
        b.iter(|| gateway.find(black_box(&ns), black_box(&filter)).unwrap());
    });

    group.finish();
}

criterion_group!(benches, bench_gateway);
criterion_main!(benches);
