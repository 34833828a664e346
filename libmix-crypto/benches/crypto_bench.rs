//! Benchmarks for libmix-crypto
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use libmix_crypto::*;

fn bench_hash(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash");

    for size in [20, 2048, 28672] {
        let data = vec![0u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("sha1_{}_bytes", size), |b| {
            b.iter(|| hash(black_box(&data)))
        });
    }

    group.finish();
}

fn bench_prng(c: &mut Criterion) {
    let key = [0x42u8; KEY_LEN];
    let mut group = c.benchmark_group("prng");

    for size in [256, 2048, 28672] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("keystream_{}_bytes", size), |b| {
            b.iter(|| create_prng(black_box(&key), size))
        });
    }

    group.finish();
}

fn bench_sprp(c: &mut Criterion) {
    let lioness = Lioness::new(&[0x42u8; SPRP_KEY_LEN]);
    let mut group = c.benchmark_group("sprp");

    for size in [2048, 28672] {
        let mut block = vec![0u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("lioness_{}_bytes", size), |b| {
            b.iter(|| lioness.encrypt(black_box(&mut block)))
        });
    }

    group.finish();
}

fn bench_fec(c: &mut Criterion) {
    let code = FecCode::new(16, 22).unwrap();
    let source: Vec<Vec<u8>> = (0..16u8).map(|i| vec![i; 28625]).collect();
    let refs: Vec<&[u8]> = source.iter().map(|s| s.as_slice()).collect();
    let shares = code.encode_all(&refs).unwrap();

    let mut group = c.benchmark_group("fec");
    group.throughput(Throughput::Bytes(28625));

    group.bench_function("encode_repair_share", |b| {
        b.iter(|| code.encode(black_box(&refs), 20))
    });

    let indices: Vec<usize> = (6..22).collect();
    let subset: Vec<&[u8]> = indices.iter().map(|&i| shares[i].as_slice()).collect();
    group.bench_function("decode_16_of_22", |b| {
        b.iter(|| code.decode(black_box(&subset), black_box(&indices)))
    });

    group.finish();
}

fn bench_compress(c: &mut Criterion) {
    let text = b"Type III remailer benchmark message body. ".repeat(600);
    let packed = compress(&text).unwrap();

    let mut group = c.benchmark_group("compress");
    group.throughput(Throughput::Bytes(text.len() as u64));

    group.bench_function("zlib_level9", |b| b.iter(|| compress(black_box(&text))));
    group.bench_function("inflate", |b| {
        b.iter(|| decompress(black_box(&packed), text.len()))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_hash,
    bench_prng,
    bench_sprp,
    bench_fec,
    bench_compress,
);

criterion_main!(benches);
