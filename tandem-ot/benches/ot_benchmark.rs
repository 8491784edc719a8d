use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use serde_json::{json, Value};
use tandem_ot::{Json0, OtType, Side, Text};

fn list_doc(len: usize) -> Value {
    Value::Array((0..len).map(|i| json!({ "id": i, "name": format!("item {i}") })).collect())
}

fn bench_json0_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("json0");
    group.throughput(Throughput::Elements(1));

    let doc = list_doc(1000);
    let op = json!([{ "p": [500, "name", 2], "si": "xyz" }]);
    group.bench_function("apply_string_insert_in_1000_list", |b| {
        b.iter(|| black_box(Json0.apply(black_box(&doc), black_box(&op)).unwrap()))
    });

    let op = json!([{ "p": [0], "li": { "id": -1 } }]);
    group.bench_function("apply_list_insert_front_1000", |b| {
        b.iter(|| black_box(Json0.apply(black_box(&doc), black_box(&op)).unwrap()))
    });

    group.finish();
}

fn bench_json0_transform(c: &mut Criterion) {
    let mut group = c.benchmark_group("json0");

    let op = json!([{ "p": [10, "name"], "od": "a", "oi": "b" }, { "p": [12], "ld": {} }]);
    let other = json!([{ "p": [3], "li": 1 }, { "p": [11], "lm": 2 }]);
    group.bench_function("transform_two_by_two", |b| {
        b.iter(|| black_box(Json0.transform(black_box(&op), black_box(&other), Side::Left).unwrap()))
    });

    // A submission that missed 100 committed list inserts.
    let history: Vec<Value> = (0..100).map(|i| json!([{ "p": [i], "li": i }])).collect();
    group.bench_function("transform_against_100_ops", |b| {
        b.iter(|| {
            let mut op = json!([{ "p": [50, "n"], "na": 1 }]);
            for other in &history {
                op = Json0.transform(&op, other, Side::Left).unwrap();
            }
            black_box(op)
        })
    });

    group.finish();
}

fn bench_text(c: &mut Criterion) {
    let mut group = c.benchmark_group("text");

    let doc = Value::String("lorem ipsum ".repeat(500));
    let op = json!([3000, "inserted", { "d": 20 }]);
    group.bench_function("apply_6kb", |b| {
        b.iter(|| black_box(Text.apply(black_box(&doc), black_box(&op)).unwrap()))
    });

    let other = json!([100, { "d": 5000 }, "x"]);
    group.bench_function("transform", |b| {
        b.iter(|| black_box(Text.transform(black_box(&op), black_box(&other), Side::Right).unwrap()))
    });

    let first = json!([10, "abc"]);
    let second = json!([12, { "d": 1 }, "zz"]);
    group.bench_function("compose", |b| {
        b.iter(|| black_box(Text.compose(black_box(&first), black_box(&second)).unwrap()))
    });

    group.finish();
}

criterion_group!(benches, bench_json0_apply, bench_json0_transform, bench_text);
criterion_main!(benches);
