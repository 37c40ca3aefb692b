use std::{net::SocketAddr, time::Duration};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use udprobe_socket::{Probe, ProbeCache, ProbeId, ProbePath, Resolution};

const TTL: Duration = Duration::from_secs(2);

fn probe(sent_at: u64) -> Probe {
    let dst: SocketAddr = "10.0.0.1:8100".parse().unwrap();
    Probe {
        id: ProbeId::random(),
        path: ProbePath { src: [10, 0, 0, 2].into(), dst: dst.ip() },
        dst,
        tos: 0,
        sent_at,
        rcvd_at: 0,
        reflected_at: 0,
        sent_seq: 0,
        rcvd_seq: 0,
    }
}

/// The hot path of a port: every probe is inserted on send and resolved on reply, with a
/// steady population of probes in flight.
fn insert_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache/insert_resolve");
    group.throughput(Throughput::Elements(1));

    for in_flight in [100usize, 10_000] {
        let cache = ProbeCache::new(TTL);
        for _ in 0..in_flight {
            cache.insert(probe(1)).unwrap();
        }

        group.bench_with_input(BenchmarkId::from_parameter(in_flight), &cache, |b, cache| {
            b.iter(|| {
                let p = probe(1);
                cache.insert(p).unwrap();
                assert!(matches!(cache.resolve(&p.id, 2), Resolution::Matched(_)));
            })
        });
    }

    group.finish();
}

fn sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache/sweep");

    for size in [1_000usize, 100_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let cache = ProbeCache::new(TTL);
                    // Half of the probes are expired.
                    for i in 0..size {
                        let sent_at = if i % 2 == 0 { 1 } else { 10_000_000_000 };
                        cache.insert(probe(sent_at)).unwrap();
                    }
                    cache
                },
                |cache| cache.sweep(5_000_000_000),
                criterion::BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, insert_resolve, sweep);
criterion_main!(benches);
