//! Scheduling + lowering benchmarks over representative fusions.

use criterion::{criterion_group, criterion_main, Criterion};

use fusor::scheduler::{schedule, schedule_pointwise};
use fusor::{lower_fusion, DataType, DeviceConfig, Fusion, SchedulerConfig, ValId};

fn pointwise_chain(depth: usize) -> Fusion {
    let mut fusion = Fusion::new();
    let a = fusion.new_contiguous_tensor(DataType::Float, &[1024, 1024]);
    let b = fusion.new_contiguous_tensor(DataType::Float, &[1024, 1024]);
    fusion.add_input(a);
    fusion.add_input(b);
    let mut running = fusion.add(a, b);
    for i in 0..depth {
        let c = fusion.new_float(i as f64 + 1.0);
        running = fusion.mul(running, c);
    }
    fusion.add_output(running);
    fusion
}

fn reduction_fusion() -> (Fusion, Vec<(ValId, i64)>) {
    let mut fusion = Fusion::new();
    let a = fusion.new_tensor(DataType::Float, 2);
    let s = fusion.sum(a, &[1]);
    fusion.tv_set_memory(s, fusor::MemoryType::Global);
    fusion.add_input(a);
    fusion.add_output(s);
    let root = fusion.tv_root(a);
    let extents = vec![
        (fusion.iter_domain(root[0]).extent, 65000),
        (fusion.iter_domain(root[1]).extent, 1025),
    ];
    (fusion, extents)
}

fn bench_pointwise_pipeline(c: &mut Criterion) {
    c.bench_function("schedule_and_lower_pointwise_chain8", |bencher| {
        bencher.iter(|| {
            let mut fusion = pointwise_chain(8);
            schedule_pointwise(&mut fusion, &SchedulerConfig::default()).expect("schedule");
            let kernel = lower_fusion(&mut fusion).expect("lower");
            fusor::codegen::generate_kernel_source(&fusion, &kernel)
        });
    });
}

fn bench_reduction_pipeline(c: &mut Criterion) {
    c.bench_function("schedule_and_lower_reduction", |bencher| {
        bencher.iter(|| {
            let (mut fusion, extents) = reduction_fusion();
            schedule(&mut fusion, &extents, &DeviceConfig::default(), &SchedulerConfig::default())
                .expect("schedule");
            let kernel = lower_fusion(&mut fusion).expect("lower");
            fusor::codegen::generate_kernel_source(&fusion, &kernel)
        });
    });
}

fn bench_deep_copy(c: &mut Criterion) {
    c.bench_function("fusion_deep_copy", |bencher| {
        let fusion = pointwise_chain(32);
        bencher.iter(|| fusion.deep_copy());
    });
}

criterion_group!(
    benches,
    bench_pointwise_pipeline,
    bench_reduction_pipeline,
    bench_deep_copy
);
criterion_main!(benches);
