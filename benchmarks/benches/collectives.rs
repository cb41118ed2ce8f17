//! Benchmarks for gradient all-reduce over both backends

use collective::{GroupInitializer, LocalRendezvous, ProcessGroup, ReduceOp};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use runtime_core::{BackendKind, NetworkConfig, RuntimeManager};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

const WORLD_SIZE: usize = 4;

/// Run `iters` all-reduces of `len` floats on every rank, returning rank 0's time
fn run_all_reduce(backend: BackendKind, len: usize, iters: u64) -> Duration {
    let url = match backend {
        BackendKind::Tcp => format!(
            "tcp://127.0.0.1:{}",
            portpicker::pick_unused_port().expect("no free port")
        ),
        BackendKind::Local => "local://bench".to_string(),
    };
    let rendezvous = LocalRendezvous::new(WORLD_SIZE);
    let start_line = Arc::new(Barrier::new(WORLD_SIZE));

    let handles: Vec<_> = (0..WORLD_SIZE)
        .map(|rank| {
            let url = url.clone();
            let rendezvous = Arc::clone(&rendezvous);
            let start_line = Arc::clone(&start_line);
            thread::spawn(move || {
                let runtime = RuntimeManager::shared().unwrap();
                let group = GroupInitializer::new(backend, NetworkConfig::default(), runtime)
                    .with_local_rendezvous(rendezvous)
                    .init(&url, rank, WORLD_SIZE)
                    .unwrap();

                let mut buf = vec![rank as f32; len];
                start_line.wait();
                let start = Instant::now();
                for _ in 0..iters {
                    group.all_reduce(&mut buf, ReduceOp::Mean).unwrap();
                }
                start.elapsed()
            })
        })
        .collect();

    let elapsed: Vec<Duration> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    elapsed[0]
}

fn all_reduce_benchmark(c: &mut Criterion) {
    for backend in [BackendKind::Local, BackendKind::Tcp] {
        let mut group = c.benchmark_group(format!("all_reduce_{}", backend));
        group.sample_size(10);

        for len in [1_024usize, 262_144].iter() {
            group.throughput(Throughput::Bytes((*len * std::mem::size_of::<f32>()) as u64));
            group.bench_with_input(BenchmarkId::from_parameter(len), len, |b, &len| {
                b.iter_custom(|iters| run_all_reduce(backend, len, iters))
            });
        }

        group.finish();
    }
}

criterion_group!(benches, all_reduce_benchmark);
criterion_main!(benches);
