use std::sync::atomic::{AtomicU64, Ordering};

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use serde_json::json;
use tandem_sync::op::CreateOp;
use tandem_sync::protocol::{Message, OpMessage};
use tandem_sync::submit::Submission;
use tandem_sync::{Backend, OpKind};
use tokio::runtime::Runtime;

fn op_message() -> Message {
    Message::Op(OpMessage {
        c: "dogs".into(),
        d: "fido".into(),
        v: Some(42),
        src: Some("5f0c7a54-1f1e-4a52-9c52-1d4e2f3a8b7c".into()),
        seq: Some(7),
        kind: OpKind::Edit(json!([{ "p": ["owner", "name"], "od": "Ann", "oi": "Bob" }])),
        error: None,
    })
}

fn bench_wire(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire");
    let message = op_message();
    let encoded = message.encode().unwrap();
    group.throughput(Throughput::Bytes(encoded.len() as u64));

    group.bench_function("encode_op", |b| b.iter(|| black_box(black_box(&message).encode().unwrap())));
    group.bench_function("decode_op", |b| {
        b.iter(|| black_box(Message::decode(black_box(&encoded)).unwrap()))
    });
    group.finish();
}

async fn seeded(backend: &Backend, id: &str) {
    let create = Submission {
        src: "bench".into(),
        seq: 0,
        v: Some(0),
        kind: OpKind::Create(CreateOp {
            type_uri: "json0".into(),
            data: Some(json!({ "n": 0 })),
        }),
    };
    backend.submit(None, "bench", id, create).await.unwrap();
}

fn bench_authority_submit(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let backend = Backend::in_memory();
    runtime.block_on(seeded(&backend, "counter"));
    let seq = AtomicU64::new(1);

    let mut group = c.benchmark_group("authority");
    group.throughput(Throughput::Elements(1));
    group.bench_function("submit_number_add", |b| {
        b.to_async(&runtime).iter(|| async {
            let submission = Submission {
                src: "bench".into(),
                seq: seq.fetch_add(1, Ordering::Relaxed),
                v: None,
                kind: OpKind::Edit(json!([{ "p": ["n"], "na": 1 }])),
            };
            black_box(backend.submit(None, "bench", "counter", submission).await.unwrap());
        })
    });
    group.finish();
}

fn bench_client_round_trip(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let backend = Backend::in_memory();
    let (_connection, doc) = runtime.block_on(async {
        seeded(&backend, "shared").await;
        let connection = backend.connect();
        connection.wait_connected().await.unwrap();
        let doc = connection.get("bench", "shared");
        doc.subscribe().await.unwrap();
        (connection, doc)
    });

    let mut group = c.benchmark_group("client");
    group.throughput(Throughput::Elements(1));
    group.bench_function("submit_and_ack", |b| {
        b.to_async(&runtime).iter(|| async {
            doc.submit_op(json!([{ "p": ["n"], "na": 1 }])).await.unwrap();
        })
    });
    group.finish();
}

criterion_group!(benches, bench_wire, bench_authority_submit, bench_client_round_trip);
criterion_main!(benches);
