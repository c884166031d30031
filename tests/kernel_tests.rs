//! Kernel launches and standalone timestamp recording.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use streamforge::native::cpu::CpuBackend;
use streamforge::{Context, Kernel, QueueFlags, RuntimeConfig};

use common::cpu_context;

#[test]
fn kernel_launch_runs_the_registered_body() {
    let backend = CpuBackend::new(1);
    let context = Context::new(backend.clone(), RuntimeConfig::default());
    let queue = context.create_queue(0, QueueFlags::new()).unwrap();

    let invocations = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&invocations);
    let id = backend.register_kernel(move |geometry| {
        assert_eq!(geometry.grid, [4, 1, 1]);
        assert_eq!(geometry.block, [16, 1, 1]);
        seen.fetch_add(1, Ordering::SeqCst);
    });
    let kernel = Kernel::new(id, "bump");
    assert_eq!(kernel.name(), "bump");

    let launch = queue
        .enqueue_kernel(&kernel, 1, [64, 1, 1], Some([16, 1, 1]), &[])
        .unwrap();
    launch.wait().unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[test]
fn kernel_launch_rejects_bad_geometry() {
    let backend = CpuBackend::new(1);
    let context = Context::new(backend.clone(), RuntimeConfig::default());
    let queue = context.create_queue(0, QueueFlags::new()).unwrap();
    let id = backend.register_kernel(|_| {});
    let kernel = Kernel::new(id, "noop");

    // Local size must divide global, work dim must be 1..=3.
    assert!(queue
        .enqueue_kernel(&kernel, 1, [10, 1, 1], Some([3, 1, 1]), &[])
        .is_err());
    assert!(queue
        .enqueue_kernel(&kernel, 0, [1, 1, 1], None, &[])
        .is_err());
    assert!(queue
        .enqueue_kernel(&kernel, 2, [8, 0, 1], None, &[])
        .is_err());
}

#[test]
fn kernel_waits_on_its_dependencies() {
    let backend = CpuBackend::new(1);
    let context = Context::new(backend.clone(), RuntimeConfig::default());
    let queue = context.create_queue(0, QueueFlags::new()).unwrap();
    let buffer = context.create_buffer(16).unwrap();

    let write = queue
        .enqueue_write(&buffer, false, 0, &[1u8; 16], &[])
        .unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&ran);
    let id = backend.register_kernel(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    let kernel = Kernel::new(id, "after-write");

    let launch = queue
        .enqueue_kernel(&kernel, 1, [1, 1, 1], None, &[write])
        .unwrap();
    launch.wait().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn timestamp_event_profiles_without_a_profiling_queue() {
    let context = cpu_context(1, RuntimeConfig::default());
    let queue = context.create_queue(0, QueueFlags::new()).unwrap();

    let stamp = queue.enqueue_timestamp(&[]).unwrap();
    stamp.wait().unwrap();
    let info = stamp.profiling_info().unwrap();
    assert!(info.end_ns >= info.start_ns);
    assert!(info.queued_ns > 0);
}
