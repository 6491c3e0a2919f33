use criterion::criterion_group;
use criterion::criterion_main;
use criterion::Criterion;

use isoheap::api;

pub fn bench_main(c: &mut Criterion) {
    api::init();

    c.bench_function("small alloc+free", |b| {
        b.iter(|| {
            let p = api::alloc(64);
            api::free(p);
        })
    });

    c.bench_function("calloc 256B", |b| {
        b.iter(|| {
            let p = api::calloc(4, 64);
            api::free(p);
        })
    });

    c.bench_function("big alloc+free 1MiB", |b| {
        b.iter(|| {
            let p = api::alloc(1 << 20);
            api::free(p);
            api::flush_caches();
        })
    });
}

criterion_group!(benches, bench_main);
criterion_main!(benches);
