use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::io::Read;

use parbz2::{CancelToken, Scanner};

fn generate_bz2(size_mb: usize) -> Vec<u8> {
    // Incompressible data produces one block per 100kB of input.
    let mut data = vec![0u8; size_mb * 1024 * 1024];
    let mut state = 0x9e3779b97f4a7c15u64;
    for byte in data.iter_mut() {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        *byte = state as u8;
    }
    let mut out = Vec::new();
    bzip2::read::BzEncoder::new(&data[..], bzip2::Compression::new(1))
        .read_to_end(&mut out)
        .expect("bzip2 encode");
    out
}

fn bench_scanner(c: &mut Criterion) {
    let mut group = c.benchmark_group("scanner");

    for size_mb in [1usize, 8] {
        let compressed = generate_bz2(size_mb);
        group.throughput(Throughput::Bytes(compressed.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}MB", size_mb)),
            &compressed,
            |b, compressed| {
                b.iter(|| {
                    let cancel = CancelToken::new();
                    let mut sc = Scanner::new(&compressed[..]);
                    let mut count = 0;
                    while sc.next(&cancel).is_some() {
                        count += 1;
                    }
                    assert!(sc.err().is_none());
                    count
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_scanner);
criterion_main!(benches);
