use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use heracles::{Flags, Heracles};

fn tree_generate(entries: u32) -> Heracles {
    let mut hera =
        Heracles::init(None, None, Flags::NO_STDINC | Flags::NO_LOAD)
            .expect("Failed to initialize engine");

    for i in 1..=entries {
        let changes = [
            (format!("/bench/host[{}]/ipaddr", i), format!("10.0.{}.{}", i / 256, i % 256)),
            (format!("/bench/host[{}]/canonical", i), format!("host{}.example.com", i)),
        ];

        for (path, value) in &changes {
            hera.set(path, Some(value)).expect("Failed to build tree");
        }
    }

    hera
}

fn criterion_benchmark(c: &mut Criterion) {
    let tree_sizes = [64, 256, 1024];

    let mut group = c.benchmark_group("Heracles.matches() / tree size");
    for size in &tree_sizes {
        let mut hera = tree_generate(*size);

        group.bench_with_input(
            BenchmarkId::from_parameter(size),
            size,
            |b, _| {
                b.iter(|| {
                    hera.matches("/bench/host/ipaddr")
                        .expect("Failed to match")
                })
            },
        );
    }
    group.finish();

    let mut group =
        c.benchmark_group("Heracles predicate scan / tree size");
    for size in &tree_sizes {
        let mut hera = tree_generate(*size);

        group.bench_with_input(
            BenchmarkId::from_parameter(size),
            size,
            |b, _| {
                b.iter(|| {
                    hera.count(
                        "/bench/host[ipaddr =~ regexp('10\\.0\\.1\\..*')]",
                    )
                    .expect("Failed to count")
                })
            },
        );
    }
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
