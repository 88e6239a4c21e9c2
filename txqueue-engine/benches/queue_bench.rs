use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;
use txqueue_engine::{
    Backend, FsyncMode, PersistenceConfig, QueueConfig, TransactionalQueueManager, UuidGenerator,
};

fn manager(backend: Backend, dir: &std::path::Path) -> Arc<TransactionalQueueManager> {
    let config = PersistenceConfig {
        backend,
        path: dir.to_path_buf(),
        fsync_mode: FsyncMode::Never,
        ..PersistenceConfig::default()
    };
    let manager = Arc::new(TransactionalQueueManager::new(
        config.build_strategy(Arc::new(UuidGenerator)),
        QueueConfig::default(),
    ));
    manager.start().unwrap();
    manager
}

/// Benchmark: Non-transactional put followed by take, per backend
fn bench_put_take(c: &mut Criterion) {
    let mut group = c.benchmark_group("put_take");

    for backend in [Backend::Memory, Backend::File, Backend::Journal, Backend::Log] {
        for size in [64usize, 1024] {
            group.throughput(Throughput::Bytes(size as u64));
            group.bench_with_input(
                BenchmarkId::new(format!("{backend:?}"), size),
                &size,
                |b, &size| {
                    let dir = tempfile::tempdir().unwrap();
                    let manager = manager(backend, dir.path());
                    let session = manager.session();
                    let queue = session.queue("bench");
                    let payload = vec![0u8; size];

                    b.iter(|| {
                        queue.put(black_box(payload.clone())).unwrap();
                        black_box(queue.take().unwrap());
                    });
                },
            );
        }
    }

    group.finish();
}

/// Benchmark: Batch of puts committed as one transaction
fn bench_transactional_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("transactional_batch");

    for batch in [1usize, 16, 128] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::new("journal", batch), &batch, |b, &batch| {
            let dir = tempfile::tempdir().unwrap();
            let manager = manager(Backend::Journal, dir.path());
            let session = manager.session();
            let queue = session.queue("bench");

            b.iter(|| {
                session.begin().unwrap();
                for i in 0..batch {
                    queue.put(format!("message-{i}")).unwrap();
                }
                session.commit().unwrap();

                session.begin().unwrap();
                for _ in 0..batch {
                    black_box(queue.take().unwrap());
                }
                session.commit().unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_put_take, bench_transactional_batch);
criterion_main!(benches);
