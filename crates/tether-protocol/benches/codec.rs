//! Codec benchmarks for tether-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use tether_protocol::{codec, Envelope, Reply};

fn bench_decode_publish(c: &mut Criterion) {
    let envelope = Envelope::new("publish")
        .with_token("eyJhbGciOiJIUzI1NiJ9.e30.signature")
        .with_publish("test/data", "a".repeat(64));
    let text = serde_json::to_string(&envelope).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(text.len() as u64));
    group.bench_function("publish_64B", |b| b.iter(|| codec::decode(black_box(&text))));
    group.finish();
}

fn bench_encode_received(c: &mut Criterion) {
    let payload = vec![b'x'; 256];

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(256));
    group.bench_function("received_256B", |b| {
        b.iter(|| codec::encode(black_box(&Reply::received("test/data", &payload))))
    });
    group.finish();
}

criterion_group!(benches, bench_decode_publish, bench_encode_received);
criterion_main!(benches);
