//! Data-movement correctness on the executing CPU back-end: cross-device
//! coherence over both migration paths, map/unmap, fill emulation, and
//! rectangular transfers.

mod common;

use streamforge::{MemoryHint, QueueFlags, RectLayout, RuntimeConfig};

use common::{cpu_context, cpu_context_with_topology};

fn cross_device_round_trip(peer_access: bool) {
    let context = cpu_context_with_topology(8, peer_access, RuntimeConfig::default());
    let writer = context.create_queue(0, QueueFlags::new()).unwrap();
    let reader = context.create_queue(3, QueueFlags::new()).unwrap();
    let buffer = context.create_buffer(4096).unwrap();

    let fill = writer
        .enqueue_fill(&buffer, &[0xABu8], 0, 4096, &[])
        .unwrap();

    let mut out = vec![0u8; 4096];
    reader
        .enqueue_read(&buffer, true, 0, &mut out, &[fill])
        .unwrap();
    assert!(out.iter().all(|&b| b == 0xAB));
}

#[test]
fn coherence_round_trip_with_peer_access() {
    cross_device_round_trip(true);
}

#[test]
fn coherence_round_trip_via_host_staging() {
    cross_device_round_trip(false);
}

#[test]
fn write_on_one_device_invalidates_the_other() {
    let context = cpu_context_with_topology(2, true, RuntimeConfig::default());
    let q0 = context.create_queue(0, QueueFlags::new()).unwrap();
    let q1 = context.create_queue(1, QueueFlags::new()).unwrap();
    let buffer = context.create_buffer(128).unwrap();

    let first = q0.enqueue_fill(&buffer, &[0x01u8], 0, 128, &[]).unwrap();
    let mut out = vec![0u8; 128];
    let read = q1
        .enqueue_read(&buffer, true, 0, &mut out, &[first])
        .unwrap();
    assert!(out.iter().all(|&b| b == 0x01));

    // Overwrite on device 1, then read back on device 0.
    let second = q1.enqueue_fill(&buffer, &[0x02u8], 0, 128, &[read]).unwrap();
    q0.enqueue_read(&buffer, true, 0, &mut out, &[second])
        .unwrap();
    assert!(out.iter().all(|&b| b == 0x02));
}

#[test]
fn map_write_unmap_round_trip() {
    let context = cpu_context(1, RuntimeConfig::default());
    let queue = context.create_queue(0, QueueFlags::new()).unwrap();
    let buffer = context.create_buffer(64).unwrap();
    let init = queue.enqueue_fill(&buffer, &[0u8], 0, 64, &[]).unwrap();

    let (map_event, ptr) = queue.enqueue_map(&buffer, true, 16, 32, &[init]).unwrap();
    let expected: Vec<u8> = (1..=32).collect();
    unsafe {
        std::ptr::copy_nonoverlapping(expected.as_ptr(), ptr, 32);
    }
    let unmap = queue.enqueue_unmap(&buffer, ptr, &[map_event]).unwrap();

    let mut out = vec![0u8; 32];
    queue
        .enqueue_read(&buffer, true, 16, &mut out, &[unmap])
        .unwrap();
    assert_eq!(out, expected);
}

#[test]
fn double_mapping_the_same_region_is_rejected() {
    let context = cpu_context(1, RuntimeConfig::default());
    let queue = context.create_queue(0, QueueFlags::new()).unwrap();
    let buffer = context.create_buffer(64).unwrap();

    let (_event, ptr) = queue.enqueue_map(&buffer, false, 0, 32, &[]).unwrap();
    assert!(queue.enqueue_map(&buffer, false, 16, 32, &[]).is_err());
    // A disjoint region still maps.
    let (_event2, ptr2) = queue.enqueue_map(&buffer, false, 32, 16, &[]).unwrap();
    queue.enqueue_unmap(&buffer, ptr, &[]).unwrap();
    queue.enqueue_unmap(&buffer, ptr2, &[]).unwrap();
    queue.finish().unwrap();
}

#[test]
fn racing_maps_of_overlapping_regions_admit_exactly_one() {
    use std::sync::Barrier;

    let context = cpu_context(1, RuntimeConfig::default());
    let buffer = context.create_buffer(64).unwrap();
    let start = std::sync::Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let context = std::sync::Arc::clone(&context);
            let buffer = buffer.clone();
            let start = std::sync::Arc::clone(&start);
            std::thread::spawn(move || {
                let queue = context.create_queue(0, QueueFlags::new()).unwrap();
                start.wait();
                queue.enqueue_map(&buffer, false, 0, 32, &[]).is_ok()
            })
        })
        .collect();

    let successes = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|mapped| *mapped)
        .count();
    assert_eq!(successes, 1);
}

#[test]
fn unmapping_an_unknown_pointer_is_rejected() {
    let context = cpu_context(1, RuntimeConfig::default());
    let queue = context.create_queue(0, QueueFlags::new()).unwrap();
    let buffer = context.create_buffer(64).unwrap();
    let mut bogus = 0u8;
    assert!(queue
        .enqueue_unmap(&buffer, &mut bogus as *mut u8, &[])
        .is_err());
}

#[test]
fn non_power_of_two_fill_matches_repeated_pattern() {
    let context = cpu_context(1, RuntimeConfig::default());
    let queue = context.create_queue(0, QueueFlags::new()).unwrap();
    let buffer = context.create_buffer(30).unwrap();

    let fill = queue
        .enqueue_fill(&buffer, &[0x01, 0x02, 0x03], 0, 30, &[])
        .unwrap();
    let mut out = vec![0u8; 30];
    queue
        .enqueue_read(&buffer, true, 0, &mut out, &[fill])
        .unwrap();

    let expected: Vec<u8> = [0x01, 0x02, 0x03].iter().copied().cycle().take(30).collect();
    assert_eq!(out, expected);
}

#[test]
fn power_of_two_fill_uses_the_native_path() {
    let context = cpu_context(1, RuntimeConfig::default());
    let queue = context.create_queue(0, QueueFlags::new()).unwrap();
    let buffer = context.create_buffer(32).unwrap();

    let fill = queue
        .enqueue_fill(&buffer, &[0xDE, 0xAD, 0xBE, 0xEF], 0, 32, &[])
        .unwrap();
    let mut out = vec![0u8; 32];
    queue
        .enqueue_read(&buffer, true, 0, &mut out, &[fill])
        .unwrap();
    let expected: Vec<u8> = [0xDE, 0xAD, 0xBE, 0xEF]
        .iter()
        .copied()
        .cycle()
        .take(32)
        .collect();
    assert_eq!(out, expected);
}

#[test]
fn fill_pattern_must_divide_size() {
    let context = cpu_context(1, RuntimeConfig::default());
    let queue = context.create_queue(0, QueueFlags::new()).unwrap();
    let buffer = context.create_buffer(32).unwrap();
    assert!(queue.enqueue_fill(&buffer, &[1, 2, 3], 0, 32, &[]).is_err());
    assert!(queue.enqueue_fill(&buffer, &[], 0, 32, &[]).is_err());
}

#[test]
fn buffer_copy_moves_bytes_between_buffers() {
    let context = cpu_context(1, RuntimeConfig::default());
    let queue = context.create_queue(0, QueueFlags::new()).unwrap();
    let src = context.create_buffer(64).unwrap();
    let dst = context.create_buffer(64).unwrap();

    let payload: Vec<u8> = (0..64).collect();
    let write = queue.enqueue_write(&src, false, 0, &payload, &[]).unwrap();
    let copy = queue.enqueue_copy(&src, &dst, 0, 0, 64, &[write]).unwrap();

    let mut out = vec![0u8; 64];
    queue
        .enqueue_read(&dst, true, 0, &mut out, &[copy])
        .unwrap();
    assert_eq!(out, payload);
}

#[test]
fn rect_write_and_read_address_rows_independently() {
    let context = cpu_context(1, RuntimeConfig::default());
    let queue = context.create_queue(0, QueueFlags::new()).unwrap();
    // 8x4 buffer, row pitch 8.
    let buffer = context.create_buffer(32).unwrap();
    let init = queue.enqueue_fill(&buffer, &[0u8], 0, 32, &[]).unwrap();

    // Write a 4x2 region at buffer origin (2, 1) from a tightly packed host
    // slice.
    let host: Vec<u8> = (1..=8).collect();
    let region = [4, 2, 1];
    let buffer_layout = RectLayout {
        origin: [2, 1, 0],
        row_pitch: 8,
        slice_pitch: 0,
    };
    let write = queue
        .enqueue_write_rect(
            &buffer,
            true,
            region,
            buffer_layout,
            RectLayout::default(),
            &host,
            &[init],
        )
        .unwrap();

    let mut flat = vec![0u8; 32];
    queue
        .enqueue_read(&buffer, true, 0, &mut flat, &[write])
        .unwrap();
    let mut expected = vec![0u8; 32];
    expected[10..14].copy_from_slice(&[1, 2, 3, 4]);
    expected[18..22].copy_from_slice(&[5, 6, 7, 8]);
    assert_eq!(flat, expected);

    // Read the same region back through the rectangular path.
    let mut out = vec![0u8; 8];
    queue
        .enqueue_read_rect(
            &buffer,
            region,
            buffer_layout,
            RectLayout::default(),
            &mut out,
            &[],
        )
        .unwrap();
    assert_eq!(out, host);
}

#[test]
fn degenerate_rect_region_is_rejected() {
    let context = cpu_context(1, RuntimeConfig::default());
    let queue = context.create_queue(0, QueueFlags::new()).unwrap();
    let buffer = context.create_buffer(32).unwrap();
    let mut out = vec![0u8; 8];
    assert!(queue
        .enqueue_read_rect(
            &buffer,
            [4, 0, 1],
            RectLayout::default(),
            RectLayout::default(),
            &mut out,
            &[],
        )
        .is_err());
}

#[test]
fn usm_operations_complete_and_validate_ranges() {
    let context = cpu_context(1, RuntimeConfig::default());
    let queue = context.create_queue(0, QueueFlags::new()).unwrap();
    let a = context.usm_device_alloc(0, 64).unwrap();
    let b = context.usm_device_alloc(0, 64).unwrap();

    let fill = queue.enqueue_usm_fill(&a, &[0x42], 0, 64, &[]).unwrap();
    let copy = queue
        .enqueue_usm_memcpy(false, &b, 0, &a, 0, 64, &[fill])
        .unwrap();
    let hint = queue
        .enqueue_usm_prefetch(&b, 0, 64, Some(0), &[copy.clone()])
        .unwrap();
    let advise = queue
        .enqueue_usm_advise(&b, 0, 64, MemoryHint::AdviseReadMostly, &[hint])
        .unwrap();
    advise.wait().unwrap();
    assert_eq!(copy.status().unwrap(), streamforge::ExecutionStatus::Complete);

    // Out-of-range accesses are rejected up front.
    assert!(queue
        .enqueue_usm_memcpy(false, &b, 32, &a, 0, 64, &[])
        .is_err());
    assert!(queue.enqueue_usm_fill(&a, &[0x42], 60, 8, &[]).is_err());
    queue.finish().unwrap();
}
