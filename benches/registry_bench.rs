use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use jitspace::{ModuleId, Region, Registry};

const PAGE: usize = 0x1000;

fn populated(count: usize) -> Registry {
    let registry = Registry::new();
    for i in 0..count {
        let start = 0x1000_0000 + i * 2 * PAGE;
        let owner = ModuleId::from_raw(i as u64 + 1).unwrap();
        registry.insert(Region::new(start, start + PAGE), owner).unwrap();
    }
    registry
}

fn lookup_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry lookup");
    for count in [16usize, 1024, 16384] {
        let registry = populated(count);
        let hit = 0x1000_0000 + (count / 2) * 2 * PAGE + 8;
        let miss = hit + PAGE;

        group.bench_with_input(BenchmarkId::new("hit", count), &hit, |b, &pc| {
            b.iter(|| registry.lookup(black_box(pc)))
        });
        group.bench_with_input(BenchmarkId::new("miss", count), &miss, |b, &pc| {
            b.iter(|| registry.lookup(black_box(pc)))
        });
    }
    group.finish();
}

fn churn_benchmark(c: &mut Criterion) {
    let registry = populated(1024);
    let owner = ModuleId::from_raw(u64::MAX).unwrap();
    let region = Region::new(0x0800_0000, 0x0800_0000 + PAGE);

    c.bench_function("registry insert+remove with 1024 live", |b| {
        b.iter(|| {
            let handle = registry.insert(black_box(region), owner).unwrap();
            registry.remove(handle).unwrap();
        })
    });
}

criterion_group!(benches, lookup_benchmark, churn_benchmark);
criterion_main!(benches);
