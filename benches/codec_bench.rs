//! Transport codec benchmarks.
//!
//! Measures chunk sealing, stream encoding and decoding, and key derivation.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use sstunnel::crypto::{
    derive_subkey, Aead, AeadCodec, AeadKey, MasterKey, Nonce, TransportCodec, MAX_CHUNK,
};

fn bench_chunk_seal(c: &mut Criterion) {
    let key = AeadKey::from_bytes([0x42u8; 32]);
    let aead = Aead::new(&key);
    let nonce = Nonce::new(0);
    let payload = vec![0u8; MAX_CHUNK];

    let mut group = c.benchmark_group("chunk_seal");
    group.throughput(Throughput::Bytes(MAX_CHUNK as u64));

    group.bench_function("max_chunk", |b| {
        b.iter(|| black_box(aead.seal(&nonce, &payload).unwrap()))
    });

    group.finish();
}

fn bench_stream_encode(c: &mut Criterion) {
    let master = MasterKey::from_password("benchmark").unwrap();
    let payload = vec![0xabu8; 32 * 1024];

    let mut group = c.benchmark_group("stream_encode");
    group.throughput(Throughput::Bytes(payload.len() as u64));

    group.bench_function("32k", |b| {
        let mut codec = AeadCodec::new(master.clone());
        b.iter(|| black_box(codec.encode(&payload).unwrap()))
    });

    group.finish();
}

fn bench_stream_roundtrip(c: &mut Criterion) {
    let master = MasterKey::from_password("benchmark").unwrap();
    let payload = vec![0xabu8; 32 * 1024];

    let mut group = c.benchmark_group("stream_roundtrip");
    group.throughput(Throughput::Bytes(payload.len() as u64));

    group.bench_function("32k", |b| {
        let mut encoder = AeadCodec::new(master.clone());
        let mut decoder = AeadCodec::new(master.clone());
        b.iter(|| {
            let wire = encoder.encode(&payload).unwrap();
            black_box(decoder.decode(&wire).unwrap())
        })
    });

    group.finish();
}

fn bench_subkey_derive(c: &mut Criterion) {
    let master = MasterKey::from_password("benchmark").unwrap();
    let salt = [0x11u8; 32];

    c.bench_function("subkey_derive", |b| {
        b.iter(|| black_box(derive_subkey(&master, &salt).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_chunk_seal,
    bench_stream_encode,
    bench_stream_roundtrip,
    bench_subkey_derive,
);
criterion_main!(benches);
