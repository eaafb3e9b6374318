//! Benchmarks for graph compilation and bytecode replay

use accelvm::device::{DeviceClass, DeviceLimits};
use accelvm::prelude::*;
use accelvm::scheduler::{compute_launch_geometry, GeometryTuning};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

const N: usize = 16 * 1024;

fn vector_add_schedule(runtime: &Runtime) -> TaskSchedule {
    let device = runtime.host_device().unwrap();
    device.register_kernel("vector_add", VectorAddKernel::<f32>::new());

    let a = runtime.array(&vec![1.0f32; N]);
    let b = runtime.array(&vec![2.0f32; N]);
    let c = runtime.zeroed::<f32>(N);

    let mut schedule = runtime.schedule("bench", device);
    schedule
        .stream_in(&a)
        .stream_in(&b)
        .task(Task::new("add", "vector_add").read(&a).read(&b).write(&c).domain(&[N as u64]))
        .stream_out(&c);
    schedule
}

fn bench_compile(c: &mut Criterion) {
    let runtime = Runtime::default();
    let mut schedule = vector_add_schedule(&runtime);

    c.bench_function("compile_unbatched", |b| {
        b.iter(|| black_box(schedule.compile(None).unwrap().size()));
    });

    c.bench_function("compile_batched_16_passes", |b| {
        b.iter(|| black_box(schedule.compile(Some(4096)).unwrap().size()));
    });
}

fn bench_decode(c: &mut Criterion) {
    let runtime = Runtime::default();
    let mut schedule = vector_add_schedule(&runtime);
    let program = schedule.compile(Some(1024)).unwrap().clone();

    c.bench_function("decode_64_passes", |b| {
        b.iter(|| black_box(program.decode().unwrap().len()));
    });
}

fn bench_replay(c: &mut Criterion) {
    let runtime = Runtime::default();
    let mut schedule = vector_add_schedule(&runtime);
    schedule.compile(None).unwrap();

    c.bench_function("replay_vector_add", |b| {
        b.iter(|| {
            schedule.execute().unwrap().wait().unwrap();
        });
    });
}

fn bench_geometry(c: &mut Criterion) {
    let tuning = GeometryTuning::default();
    let gpu = DeviceLimits::default();
    let fpga = DeviceLimits {
        class: DeviceClass::Constrained,
        ..DeviceLimits::default()
    };

    c.bench_function("geometry_gpu_3d", |b| {
        b.iter(|| compute_launch_geometry(DeviceClass::Gpu, black_box(&[1000u64, 768, 96][..]), 0, &gpu, &tuning).unwrap());
    });

    c.bench_function("geometry_constrained", |b| {
        b.iter(|| {
            compute_launch_geometry(DeviceClass::Constrained, black_box(&[4096u64, 4096][..]), 0, &fpga, &tuning).unwrap()
        });
    });
}

criterion_group!(benches, bench_compile, bench_decode, bench_replay, bench_geometry);
criterion_main!(benches);
