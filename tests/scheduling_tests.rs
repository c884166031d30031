//! Batching and barrier scheduling behavior, observed through the counting
//! mock back-end.

mod common;

use streamforge::{Kernel, QueueFlags, RuntimeConfig};

use common::{mock_context, single_stream_config};

#[test]
fn batchable_commands_submit_at_most_ceil_m_over_limit() {
    let config = single_stream_config().with_batch_limit(4);
    let (context, backend) = mock_context(1, config);
    let queue = context.create_queue(0, QueueFlags::new()).unwrap();
    let usm = context.usm_device_alloc(0, 256).unwrap();

    for _ in 0..8 {
        queue
            .enqueue_usm_fill(&usm, &[0u8; 4], 0, 256, &[])
            .unwrap();
    }
    // 8 batchable commands with a batch limit of 4: two submissions.
    assert_eq!(backend.submission_count(), 2);

    // A ninth opens a new batch; flushing submits it.
    queue
        .enqueue_usm_fill(&usm, &[0u8; 4], 0, 256, &[])
        .unwrap();
    assert_eq!(backend.submission_count(), 2);
    queue.flush().unwrap();
    assert_eq!(backend.submission_count(), 3);
}

#[test]
fn blocking_commands_submit_one_to_one() {
    let config = single_stream_config().with_batch_limit(4);
    let (context, backend) = mock_context(1, config);
    let queue = context.create_queue(0, QueueFlags::new()).unwrap();
    let src = context.usm_device_alloc(0, 128).unwrap();
    let dst = context.usm_device_alloc(0, 128).unwrap();

    for _ in 0..5 {
        queue
            .enqueue_usm_memcpy(true, &dst, 0, &src, 0, 128, &[])
            .unwrap();
    }
    assert_eq!(backend.submission_count(), 5);
}

#[test]
fn barrier_wait_is_applied_once_per_stream() {
    let config = RuntimeConfig::new()
        .with_compute_streams(2)
        .with_transfer_streams(0)
        .with_batch_limit(64);
    let (context, backend) = mock_context(1, config);
    let queue = context.create_queue(0, QueueFlags::new()).unwrap();
    let usm = context.usm_device_alloc(0, 64).unwrap();

    queue.enqueue_barrier(&[]).unwrap();
    for _ in 0..6 {
        queue
            .enqueue_usm_fill(&usm, &[0u8; 4], 0, 64, &[])
            .unwrap();
    }
    queue.flush().unwrap();

    // One cross-stream marker wait on the barrier's own stream, plus at
    // most one wait-on-barrier per other stream, independent of the six
    // commands issued afterwards.
    assert!(backend.total_wait_instruction_count() <= 2);
}

#[test]
fn dependencies_past_the_wait_cap_resolve_on_the_host() {
    let config = single_stream_config().with_max_wait_events(1);
    let (context, backend) = mock_context(1, config);

    // Three producer queues, one stream each, so dedup keeps three events.
    let producers: Vec<_> = (0..3)
        .map(|_| context.create_queue(0, QueueFlags::new()).unwrap())
        .collect();
    let usm = context.usm_device_alloc(0, 64).unwrap();
    let events: Vec<_> = producers
        .iter()
        .map(|q| q.enqueue_usm_fill(&usm, &[0u8; 4], 0, 64, &[]).unwrap())
        .collect();

    let consumer = context.create_queue(0, QueueFlags::new()).unwrap();
    consumer
        .enqueue_usm_fill(&usm, &[0u8; 4], 0, 64, &events)
        .unwrap();

    // Only one dependency became a native wait instruction; the other two
    // were waited on by the host.
    assert_eq!(backend.total_wait_instruction_count(), 1);
}

#[test]
fn indirect_access_tracking_submits_kernel_launches_eagerly() {
    // Tracking on: the launch must not linger in an open batch, since the
    // kernel may read allocations touched by earlier batched commands.
    let config = single_stream_config()
        .with_batch_limit(64)
        .with_track_indirect_access(true);
    let (context, backend) = mock_context(1, config);
    let queue = context.create_queue(0, QueueFlags::new()).unwrap();
    let kernel = Kernel::new(backend.register_kernel(), "scatter");
    queue
        .enqueue_kernel(&kernel, 1, [8, 1, 1], None, &[])
        .unwrap();
    assert_eq!(backend.submission_count(), 1);

    // Tracking off: launches batch like any other command.
    let (context, backend) = mock_context(1, single_stream_config().with_batch_limit(64));
    let queue = context.create_queue(0, QueueFlags::new()).unwrap();
    let kernel = Kernel::new(backend.register_kernel(), "gather");
    queue
        .enqueue_kernel(&kernel, 1, [8, 1, 1], None, &[])
        .unwrap();
    assert_eq!(backend.submission_count(), 0);
    queue.flush().unwrap();
    assert_eq!(backend.submission_count(), 1);
}

#[test]
fn cross_queue_dependency_flushes_the_producer() {
    let (context, backend) = mock_context(1, single_stream_config());
    let producer = context.create_queue(0, QueueFlags::new()).unwrap();
    let consumer = context.create_queue(0, QueueFlags::new()).unwrap();
    let usm = context.usm_device_alloc(0, 64).unwrap();

    let event = producer
        .enqueue_usm_fill(&usm, &[0u8; 4], 0, 64, &[])
        .unwrap();
    // The producer's batch is still open.
    assert_eq!(backend.submission_count(), 0);

    consumer
        .enqueue_usm_fill(&usm, &[0u8; 4], 0, 64, &[event])
        .unwrap();
    // Waiting on the producer's event forced its open batch out.
    assert!(backend.submission_count() >= 1);
}
