//! Wait-list deduplication properties
//!
//! Same-stream events collapse to the single newest one for any input
//! permutation; events spanning K streams keep exactly one entry per
//! stream; interop events are never elided.

mod common;

use rand::seq::SliceRandom;
use rand::thread_rng;
use streamforge::runtime::latest_events;
use streamforge::{Event, QueueFlags};

use common::{mock_context, single_stream_config};

fn fill_events(
    context: &std::sync::Arc<streamforge::Context>,
    queue: &streamforge::Queue,
    count: usize,
) -> Vec<Event> {
    let usm = context.usm_device_alloc(0, 64).unwrap();
    (0..count)
        .map(|_| {
            queue
                .enqueue_usm_fill(&usm, &[0u8; 4], 0, 64, &[])
                .unwrap()
        })
        .collect()
}

#[test]
fn same_stream_events_collapse_to_newest_under_permutation() {
    let (context, _backend) = mock_context(1, single_stream_config());
    let queue = context.create_queue(0, QueueFlags::new()).unwrap();
    let events = fill_events(&context, &queue, 8);
    let newest = events.last().unwrap().clone();

    let mut rng = thread_rng();
    for _ in 0..20 {
        let mut shuffled = events.clone();
        shuffled.shuffle(&mut rng);
        let retained = latest_events(&shuffled).unwrap();
        assert_eq!(retained.len(), 1);
        assert_eq!(retained[0], newest);
    }
}

#[test]
fn cross_stream_lists_keep_one_entry_per_stream() {
    let (context, _backend) = mock_context(1, single_stream_config());
    let queues: Vec<_> = (0..4)
        .map(|_| context.create_queue(0, QueueFlags::new()).unwrap())
        .collect();

    // Three events per queue; each queue has exactly one stream.
    let mut events = Vec::new();
    let mut newest_per_queue = Vec::new();
    for queue in &queues {
        let batch = fill_events(&context, queue, 3);
        newest_per_queue.push(batch.last().unwrap().clone());
        events.extend(batch);
    }

    let mut rng = thread_rng();
    events.shuffle(&mut rng);
    let retained = latest_events(&events).unwrap();
    assert_eq!(retained.len(), queues.len());
    for newest in &newest_per_queue {
        assert!(retained.contains(newest));
    }
}

#[test]
fn interop_events_are_never_elided() {
    let (context, backend) = mock_context(1, single_stream_config());
    let queue = context.create_queue(0, QueueFlags::new()).unwrap();
    let mut events = fill_events(&context, &queue, 3);

    use streamforge::NativeBackend;
    let foreign_a = context.import_native_event(backend.create_event(false).unwrap());
    let foreign_b = context.import_native_event(backend.create_event(false).unwrap());
    events.push(foreign_a.clone());
    events.push(foreign_b.clone());

    let retained = latest_events(&events).unwrap();
    // One per native stream plus every interop event.
    assert_eq!(retained.len(), 3);
    assert!(retained.contains(&foreign_a));
    assert!(retained.contains(&foreign_b));
}

#[test]
fn empty_wait_list_yields_no_dependencies() {
    assert_eq!(latest_events(&[]).unwrap(), Vec::new());
}

#[test]
fn single_event_passes_through() {
    let (context, _backend) = mock_context(1, single_stream_config());
    let queue = context.create_queue(0, QueueFlags::new()).unwrap();
    let events = fill_events(&context, &queue, 1);
    let retained = latest_events(&events).unwrap();
    assert_eq!(retained, events);
}
