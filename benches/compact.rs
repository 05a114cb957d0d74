use archpool::{test_util, tracer, Entity, Pool};
use criterion::*;
use rand::seq::SliceRandom;

fn compact(c: &mut Criterion) {
    let mut group = c.benchmark_group("compact");

    for log_entities in (8..=14).step_by(2) {
        let entities = 1 << log_entities;
        for percent in [10, 50, 90] {
            group.throughput(Throughput::Elements(entities));
            group.bench_with_input(
                BenchmarkId::new(format!("destroy {percent}%"), format!("{entities} entities")),
                &entities,
                |b, &entities| {
                    b.iter_batched(
                        || {
                            let pool = Pool::new();
                            let mut handles: Vec<_> = (0..entities).map(|_| Entity::new()).collect();
                            for entity in &handles {
                                pool.insert(entity, test_util::CompN::<1>(1));
                                pool.insert(entity, test_util::CompN::<2>(2));
                            }
                            pool.commit(&tracer::Noop);

                            handles.shuffle(&mut rand::thread_rng());
                            for entity in &handles[..handles.len() * percent / 100] {
                                pool.stage_destroy(entity);
                            }
                            (pool, handles)
                        },
                        |(pool, handles)| {
                            pool.commit(&tracer::Noop);
                            (pool, handles)
                        },
                        BatchSize::SmallInput,
                    );
                },
            );
        }
    }
}

criterion_group!(benches, compact);
criterion_main!(benches);
