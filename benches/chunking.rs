//! Performance benchmarks for chunking and chunk storage

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rand::{RngCore, SeedableRng, rngs::StdRng};
use std::io::Write;
use tempfile::NamedTempFile;
use tessera_crypto::Digest;
use tessera_files::{ChunkStore, Chunker, ChunkerConfig};

fn random_data(size: usize) -> Vec<u8> {
    let mut data = vec![0u8; size];
    StdRng::seed_from_u64(7).fill_bytes(&mut data);
    data
}

/// Boundary detection over in-memory buffers
fn bench_cut_points(c: &mut Criterion) {
    let mut group = c.benchmark_group("cut_points");
    let chunker = Chunker::new(ChunkerConfig::default()).unwrap();

    for size in [1_000_000usize, 16_000_000, 64_000_000] {
        let data = random_data(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| black_box(chunker.cut_points(data)).len());
        });
    }

    group.finish();
}

/// Streaming a file through the chunker, as the indexer does
fn bench_chunk_file(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_file");
    group.sample_size(20);
    let chunker = Chunker::new(ChunkerConfig::default()).unwrap();

    for size in [10_000_000usize, 100_000_000] {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&random_data(size)).unwrap();
        file.flush().unwrap();
        let path = file.path().to_path_buf();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &path, |b, path| {
            b.iter(|| {
                let mut total = 0;
                for chunk in chunker.chunk_file(path).unwrap() {
                    total += black_box(chunk.unwrap()).len();
                }
                total
            });
        });
    }

    group.finish();
}

/// Content digests of typical chunk sizes
fn bench_digest(c: &mut Criterion) {
    let mut group = c.benchmark_group("digest");

    for size in [64 * 1024usize, 1024 * 1024, 8 * 1024 * 1024] {
        let data = random_data(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| Digest::of(black_box(data)));
        });
    }

    group.finish();
}

/// Verified writes and reads against the on-disk chunk store
fn bench_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_store");
    let dir = tempfile::tempdir().unwrap();
    let store = ChunkStore::open(dir.path()).unwrap();
    let data = random_data(1024 * 1024);
    let digest = Digest::of(&data);

    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("put_verified_1MiB", |b| {
        b.iter(|| {
            store.remove(&digest).unwrap();
            store.put_verified(&digest, black_box(&data)).unwrap();
        });
    });
    group.bench_function("get_1MiB", |b| {
        b.iter(|| black_box(store.get(&digest).unwrap()).len());
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_cut_points,
    bench_chunk_file,
    bench_digest,
    bench_store
);
criterion_main!(benches);
