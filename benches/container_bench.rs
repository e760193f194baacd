#![allow(clippy::uninlined_format_args)]
//! Bean 解析与事务帧进出的性能基准测试

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

use dataflow::datasource::{DataSourceSettings, MemoryDriver, PooledDataSource};
use dataflow::infrastructure::BeanRegistry;
use dataflow::transaction::{Propagation, TransactionalManager};

/// 测试用的简单服务
struct SimpleService {
    value: i32,
}

/// 基准测试：按键解析
fn bench_bean_resolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("bean_resolution");

    for bean_count in [1, 10, 100, 1000].iter() {
        let registry = BeanRegistry::new();
        for i in 0..*bean_count {
            registry.register(format!("service-{}", i), Arc::new(SimpleService { value: i }));
        }
        let key = format!("service-{}", bean_count - 1);

        group.bench_with_input(BenchmarkId::from_parameter(bean_count), &key, |b, key| {
            b.iter(|| {
                let service = registry.resolve::<SimpleService>(black_box(key)).unwrap();
                black_box(service.value)
            });
        });
    }

    group.finish();
}

/// 基准测试：按类型解析
fn bench_type_resolution(c: &mut Criterion) {
    let registry = BeanRegistry::new();
    registry.register_type(Arc::new(SimpleService { value: 42 }));

    c.bench_function("type_resolution", |b| {
        b.iter(|| black_box(registry.resolve_type::<SimpleService>().unwrap().value))
    });
}

fn manager() -> TransactionalManager {
    let settings = DataSourceSettings::new("bench", "mem://bench");
    let datasource = PooledDataSource::connect(&settings, Arc::new(MemoryDriver::new())).unwrap();
    TransactionalManager::new("bench", Arc::new(datasource))
}

/// 基准测试：事务帧进出
fn bench_transaction_frames(c: &mut Criterion) {
    let tm = manager();
    let mut group = c.benchmark_group("transaction_frames");

    for propagation in [Propagation::Required, Propagation::Supports, Propagation::RequiresNew] {
        group.bench_with_input(
            BenchmarkId::from_parameter(propagation),
            &propagation,
            |b, &propagation| {
                b.iter(|| {
                    tm.transaction_context(propagation, |tx| {
                        tx.execute(black_box("update t set a = 1"))?;
                        tx.commit()
                    })
                    .unwrap()
                });
            },
        );
    }

    group.bench_function("nested_required", |b| {
        b.iter(|| {
            tm.transaction_context(Propagation::Required, |outer| {
                tm.transaction_context(Propagation::Required, |inner| {
                    inner.execute("update t set a = 1").map(|_| ())
                })?;
                outer.commit()
            })
            .unwrap()
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_bean_resolution,
    bench_type_resolution,
    bench_transaction_frames
);
criterion_main!(benches);
