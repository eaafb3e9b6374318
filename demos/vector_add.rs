//! Vector addition example - compile a task graph once and replay it

use accelvm::prelude::*;
use std::time::Instant;

const N: usize = 1 << 20;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("=== Vector Add Example ===\n");

    let runtime = Runtime::new(Config::default()).expect("Failed to initialize runtime");
    let device = runtime.host_device().expect("Failed to create host device");
    device.register_kernel("vector_add", VectorAddKernel::<f32>::new());

    let a = runtime.array(&(0..N).map(|i| i as f32).collect::<Vec<_>>());
    let b = runtime.array(&(0..N).map(|i| (N - i) as f32).collect::<Vec<_>>());
    let c = runtime.zeroed::<f32>(N);

    let mut schedule = runtime.schedule("vector-add", device);
    schedule
        .stream_in(&a)
        .stream_in(&b)
        .task(Task::new("add", "vector_add").read(&a).read(&b).write(&c).domain(&[N as u64]))
        .stream_out(&c);

    let program = schedule.compile(None).expect("Failed to compile");
    println!("Bytecode ({} bytes):\n{}", program.size(), program);

    let start = Instant::now();
    for _ in 0..10 {
        schedule.execute().expect("Failed to execute").wait().expect("Execution failed");
    }
    println!("10 replays in {:?}", start.elapsed());

    let result = c.to_vec::<f32>().expect("Failed to read result");
    assert!(result.iter().all(|x| *x == N as f32));
    println!("c[0] = {}, c[{}] = {}", result[0], N - 1, result[N - 1]);

    // Split transfers into 1 MiB passes
    let program = schedule.compile(Some(1 << 20)).expect("Failed to compile batched");
    println!("\nBatched program: {} bytes", program.size());
    schedule.execute().expect("Failed to execute").wait().expect("Execution failed");

    #[cfg(feature = "telemetry")]
    {
        let snapshot = runtime.metrics().snapshot();
        println!("\n--- Runtime Metrics ---");
        println!("Executions: {}", snapshot.executions);
        println!("Kernels launched: {}", snapshot.kernels_launched);
        println!("Bytes in/out: {} / {}", snapshot.bytes_in, snapshot.bytes_out);
        println!("Instructions per execution: {:.1}", snapshot.instructions_per_execution());
        println!("p99 latency: {}ns", snapshot.p99_latency_ns);
    }
}
