//! Basic benchmarks for the `unmanaged_array` crate.
#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use unmanaged_array::UnmanagedArray;

criterion_group!(benches, entrypoint);
criterion_main!(benches);

type TestItem = u64;
const TEST_VALUE: TestItem = 1024;
const LEN: usize = 1024;
const MIDDLE: usize = 512;

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("array_access");

    group.bench_function("allocate_and_release", |b| {
        b.iter(|| {
            let array = UnmanagedArray::<TestItem>::new(black_box(LEN)).unwrap();
            black_box(array.release());
        });
    });

    let mut array = UnmanagedArray::<TestItem>::new(LEN).unwrap();

    group.bench_function("set_one", |b| {
        b.iter(|| {
            array.set(black_box(MIDDLE), black_box(TEST_VALUE)).unwrap();
        });
    });

    group.bench_function("get_one", |b| {
        b.iter(|| black_box(array.get(black_box(MIDDLE)).unwrap()));
    });

    let values = vec![TEST_VALUE; LEN];

    group.bench_function("copy_from_slice", |b| {
        b.iter(|| {
            array.copy_from_slice(black_box(&values)).unwrap();
        });
    });

    group.bench_function("to_vec", |b| {
        b.iter(|| black_box(array.to_vec().unwrap()));
    });

    group.finish();

    array.release();
}
