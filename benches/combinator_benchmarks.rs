use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rust_deferred::{all, all_settled, race, Deferred, Promise};
use std::thread;

fn pending(n: usize) -> (Vec<Deferred<u64>>, Vec<Promise<u64>>) {
    (0..n).map(|_| Deferred::new()).unzip()
}

fn all_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("all");

    for &children in &[4usize, 64, 1024] {
        group.throughput(Throughput::Elements(children as u64));
        group.bench_with_input(BenchmarkId::new("pending", children), &children, |b, &n| {
            b.iter(|| {
                let (deferreds, promises) = pending(n);
                let parent = all(promises).unwrap();
                for (value, deferred) in deferreds.iter().enumerate() {
                    deferred.resolve(value as u64).unwrap();
                }
                black_box(parent.wait())
            })
        });
        group.bench_with_input(BenchmarkId::new("inline", children), &children, |b, &n| {
            b.iter(|| {
                let parent = all((0..n as u64).map(Promise::resolved)).unwrap();
                black_box(parent.wait())
            })
        });
    }

    group.finish();
}

fn all_settled_cross_thread_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("all_settled_cross_thread");

    for &children in &[64usize, 1024] {
        group.throughput(Throughput::Elements(children as u64));
        group.bench_with_input(BenchmarkId::from_parameter(children), &children, |b, &n| {
            b.iter(|| {
                let (deferreds, promises) = pending(n);
                let parent = all_settled(promises).unwrap();
                let half = deferreds.len() / 2;
                let mut deferreds = deferreds;
                let second = deferreds.split_off(half);
                let producer = thread::spawn(move || {
                    for deferred in second {
                        deferred.resolve(1).unwrap();
                    }
                });
                for deferred in deferreds {
                    deferred.resolve(0).unwrap();
                }
                producer.join().unwrap();
                black_box(parent.wait())
            })
        });
    }

    group.finish();
}

fn race_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("race");

    for &children in &[4usize, 64, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(children), &children, |b, &n| {
            b.iter(|| {
                let (deferreds, promises) = pending(n);
                let parent = race(promises).unwrap();
                for deferred in deferreds.iter().rev() {
                    deferred.resolve(7).unwrap();
                }
                black_box(parent.wait())
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    all_benchmark,
    all_settled_cross_thread_benchmark,
    race_benchmark
);
criterion_main!(benches);
