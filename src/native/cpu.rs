//! Native CPU back-end
//!
//! Always-available adapter that models each execution stream as a worker
//! thread draining a FIFO of submitted command batches. Submission is
//! asynchronous relative to the host exactly like a vendor stream: commands
//! appended to a stream form an open batch that runs only after `submit`,
//! batches on one stream run in order, and batches on different streams run
//! concurrently.
//!
//! Device "allocations" are host byte vectors, one table entry per handle,
//! so multi-device coherence paths (peer copies vs. host-staged copies) are
//! exercised with real memory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use crate::error::{HalError, HalResult};
use crate::native::{
    BackendCaps, Command, DeviceAlloc, HostPtr, KernelId, LaunchGeometry, NativeBackend,
    NativeEvent, StreamId,
};

/// Host kernel body registered with [`CpuBackend::register_kernel`]
pub type HostKernel = Arc<dyn Fn(LaunchGeometry) + Send + Sync>;

struct EventState {
    signalled: bool,
    timestamp_ns: u64,
}

struct EventSlot {
    state: Mutex<EventState>,
    cv: Condvar,
}

impl EventSlot {
    fn new() -> Self {
        EventSlot {
            state: Mutex::new(EventState {
                signalled: false,
                timestamp_ns: 0,
            }),
            cv: Condvar::new(),
        }
    }

    fn signal(&self, timestamp_ns: u64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        // Completion is monotonic; re-recording an already signalled event
        // keeps the first timestamp.
        if !state.signalled {
            state.signalled = true;
            state.timestamp_ns = timestamp_ns;
        }
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while !state.signalled {
            state = self.cv.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    fn query(&self) -> (bool, u64) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        (state.signalled, state.timestamp_ns)
    }
}

struct AllocSlot {
    bytes: Mutex<Vec<u8>>,
}

/// State shared between the backend handle and its stream workers
struct CpuShared {
    epoch: Instant,
    events: Mutex<HashMap<u64, Arc<EventSlot>>>,
    allocs: Mutex<HashMap<u64, Arc<AllocSlot>>>,
    kernels: Mutex<HashMap<u64, HostKernel>>,
}

impl CpuShared {
    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

struct Inflight {
    count: Mutex<usize>,
    cv: Condvar,
}

struct StreamEntry {
    pending: Vec<Command>,
    sender: Option<Sender<Vec<Command>>>,
    inflight: Arc<Inflight>,
    worker: Option<JoinHandle<()>>,
}

/// CPU back-end with a configurable device count
pub struct CpuBackend {
    shared: Arc<CpuShared>,
    streams: Mutex<HashMap<u64, StreamEntry>>,
    next_id: AtomicU64,
    num_devices: u32,
    peer_access: bool,
    unified_memory: bool,
}

impl CpuBackend {
    /// Create a backend exposing `num_devices` logical devices
    pub fn new(num_devices: u32) -> Arc<Self> {
        Self::with_topology(num_devices, true, false)
    }

    /// Constructor controlling peer access and unified memory, so tests can
    /// exercise both coherence paths and the staging-free map path.
    pub fn with_topology(num_devices: u32, peer_access: bool, unified_memory: bool) -> Arc<Self> {
        Arc::new(CpuBackend {
            shared: Arc::new(CpuShared {
                epoch: Instant::now(),
                events: Mutex::new(HashMap::new()),
                allocs: Mutex::new(HashMap::new()),
                kernels: Mutex::new(HashMap::new()),
            }),
            streams: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            num_devices: num_devices.max(1),
            peer_access,
            unified_memory,
        })
    }

    /// Register a host kernel body; the returned handle can be launched on
    /// any stream of this backend.
    pub fn register_kernel<F>(&self, body: F) -> KernelId
    where
        F: Fn(LaunchGeometry) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .kernels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::new(body));
        KernelId(id)
    }

    fn event_slot(&self, event: NativeEvent) -> HalResult<Arc<EventSlot>> {
        self.shared
            .events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&event.0)
            .cloned()
            .ok_or_else(|| HalError::AdapterSpecific(format!("unknown event handle {}", event.0)))
    }

    fn alloc_slot(&self, alloc: DeviceAlloc) -> HalResult<Arc<AllocSlot>> {
        self.shared
            .allocs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&alloc.0)
            .cloned()
            .ok_or_else(|| {
                HalError::AdapterSpecific(format!("unknown allocation handle {}", alloc.0))
            })
    }

    /// Validate a command against the allocation table before it enters a
    /// batch, so handle and bounds errors surface at the call that appended
    /// them rather than inside a worker.
    fn validate(&self, command: &Command) -> HalResult<()> {
        let check = |alloc: DeviceAlloc, offset: usize, size: usize| -> HalResult<()> {
            let slot = self.alloc_slot(alloc)?;
            let len = slot.bytes.lock().unwrap_or_else(|e| e.into_inner()).len();
            if offset.checked_add(size).map_or(true, |end| end > len) {
                return Err(HalError::AdapterSpecific(format!(
                    "access out of range: offset={} size={} alloc_size={}",
                    offset, size, len
                )));
            }
            Ok(())
        };
        match command {
            Command::CopyHostToDevice {
                dst,
                dst_offset,
                size,
                ..
            } => check(*dst, *dst_offset, *size),
            Command::CopyDeviceToHost {
                src,
                src_offset,
                size,
                ..
            } => check(*src, *src_offset, *size),
            Command::CopyDeviceToDevice {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            } => {
                check(*src, *src_offset, *size)?;
                check(*dst, *dst_offset, *size)
            }
            Command::Fill {
                dst, offset, size, ..
            } => check(*dst, *offset, *size),
            Command::MemoryHint {
                alloc,
                offset,
                size,
                ..
            } => check(*alloc, *offset, *size),
            Command::KernelLaunch { kernel, .. } => {
                let known = self
                    .shared
                    .kernels
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .contains_key(&kernel.0);
                if known {
                    Ok(())
                } else {
                    Err(HalError::AdapterSpecific(format!(
                        "unknown kernel handle {}",
                        kernel.0
                    )))
                }
            }
            Command::WaitEvent { event } | Command::RecordEvent { event } => {
                self.event_slot(*event).map(|_| ())
            }
        }
    }
}

fn run_worker(shared: Arc<CpuShared>, rx: Receiver<Vec<Command>>, inflight: Arc<Inflight>) {
    for batch in rx {
        for command in batch {
            execute(&shared, command);
        }
        let mut count = inflight.count.lock().unwrap_or_else(|e| e.into_inner());
        *count = count.saturating_sub(1);
        inflight.cv.notify_all();
    }
}

fn execute(shared: &CpuShared, command: Command) {
    let lookup_alloc = |alloc: DeviceAlloc| {
        shared
            .allocs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&alloc.0)
            .cloned()
    };
    let lookup_event = |event: NativeEvent| {
        shared
            .events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&event.0)
            .cloned()
    };
    match command {
        Command::CopyHostToDevice {
            dst,
            dst_offset,
            src,
            size,
        } => {
            if let Some(slot) = lookup_alloc(dst) {
                let mut bytes = slot.bytes.lock().unwrap_or_else(|e| e.into_inner());
                // Bounds were validated at append time.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        src.as_ptr() as *const u8,
                        bytes.as_mut_ptr().add(dst_offset),
                        size,
                    );
                }
            } else {
                tracing::warn!("copy to released allocation skipped");
            }
        }
        Command::CopyDeviceToHost {
            dst,
            src,
            src_offset,
            size,
        } => {
            if let Some(slot) = lookup_alloc(src) {
                let bytes = slot.bytes.lock().unwrap_or_else(|e| e.into_inner());
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        bytes.as_ptr().add(src_offset),
                        dst.as_ptr(),
                        size,
                    );
                }
            } else {
                tracing::warn!("copy from released allocation skipped");
            }
        }
        Command::CopyDeviceToDevice {
            dst,
            dst_offset,
            src,
            src_offset,
            size,
        } => {
            let (src_slot, dst_slot) = (lookup_alloc(src), lookup_alloc(dst));
            if let (Some(src_slot), Some(dst_slot)) = (src_slot, dst_slot) {
                if src == dst {
                    let mut bytes = src_slot.bytes.lock().unwrap_or_else(|e| e.into_inner());
                    bytes.copy_within(src_offset..src_offset + size, dst_offset);
                } else {
                    // Stage through a temporary so two allocation locks are
                    // never held at once.
                    let staged = {
                        let bytes = src_slot.bytes.lock().unwrap_or_else(|e| e.into_inner());
                        bytes[src_offset..src_offset + size].to_vec()
                    };
                    let mut bytes = dst_slot.bytes.lock().unwrap_or_else(|e| e.into_inner());
                    bytes[dst_offset..dst_offset + size].copy_from_slice(&staged);
                }
            } else {
                tracing::warn!("device copy on released allocation skipped");
            }
        }
        Command::Fill {
            dst,
            offset,
            pattern,
            size,
        } => {
            if let Some(slot) = lookup_alloc(dst) {
                let mut bytes = slot.bytes.lock().unwrap_or_else(|e| e.into_inner());
                for (i, byte) in bytes[offset..offset + size].iter_mut().enumerate() {
                    *byte = pattern[i % pattern.len()];
                }
            }
        }
        Command::KernelLaunch { kernel, geometry } => {
            let body = shared
                .kernels
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&kernel.0)
                .cloned();
            match body {
                Some(body) => body(geometry),
                None => tracing::warn!("launch of unregistered kernel skipped"),
            }
        }
        Command::WaitEvent { event } => {
            if let Some(slot) = lookup_event(event) {
                slot.wait();
            }
        }
        Command::RecordEvent { event } => {
            if let Some(slot) = lookup_event(event) {
                slot.signal(shared.now_ns());
            }
        }
        Command::MemoryHint { hint, .. } => {
            // Residency hints are ordered no-ops on the CPU.
            tracing::trace!(?hint, "memory hint ignored");
        }
    }
}

impl NativeBackend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn device_count(&self) -> u32 {
        self.num_devices
    }

    fn can_access_peer(&self, src_device: u32, dst_device: u32) -> bool {
        src_device == dst_device || self.peer_access
    }

    fn capabilities(&self) -> BackendCaps {
        BackendCaps {
            max_wait_events: usize::MAX,
            has_transfer_engine: true,
            integrated_memory: self.unified_memory,
        }
    }

    fn create_stream(&self, device: u32, priority: i32) -> HalResult<StreamId> {
        if device >= self.num_devices {
            return Err(HalError::InvalidValue(format!(
                "device {} out of range ({} devices)",
                device, self.num_devices
            )));
        }
        // Worker threads all run at the same host priority.
        let _ = priority;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        let inflight = Arc::new(Inflight {
            count: Mutex::new(0),
            cv: Condvar::new(),
        });
        let shared = Arc::clone(&self.shared);
        let worker_inflight = Arc::clone(&inflight);
        let worker = std::thread::Builder::new()
            .name(format!("sf-stream-{}", id))
            .spawn(move || run_worker(shared, rx, worker_inflight))
            .map_err(|e| HalError::OutOfResources(format!("failed to spawn stream worker: {}", e)))?;
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                id,
                StreamEntry {
                    pending: Vec::new(),
                    sender: Some(tx),
                    inflight,
                    worker: Some(worker),
                },
            );
        tracing::debug!(stream = id, device, "cpu stream created");
        Ok(StreamId(id))
    }

    fn destroy_stream(&self, stream: StreamId) -> HalResult<()> {
        let entry = self
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&stream.0);
        let mut entry = entry.ok_or_else(|| {
            HalError::AdapterSpecific(format!("unknown stream handle {}", stream.0))
        })?;
        // Closing the channel lets the worker drain remaining batches and
        // exit.
        entry.sender.take();
        if let Some(worker) = entry.worker.take() {
            let _ = worker.join();
        }
        tracing::debug!(stream = stream.0, "cpu stream destroyed");
        Ok(())
    }

    fn synchronize_stream(&self, stream: StreamId) -> HalResult<()> {
        let inflight = {
            let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
            let entry = streams.get(&stream.0).ok_or_else(|| {
                HalError::AdapterSpecific(format!("unknown stream handle {}", stream.0))
            })?;
            Arc::clone(&entry.inflight)
        };
        let mut count = inflight.count.lock().unwrap_or_else(|e| e.into_inner());
        while *count > 0 {
            count = inflight.cv.wait(count).unwrap_or_else(|e| e.into_inner());
        }
        Ok(())
    }

    fn stream_idle(&self, stream: StreamId) -> HalResult<bool> {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let entry = streams.get(&stream.0).ok_or_else(|| {
            HalError::AdapterSpecific(format!("unknown stream handle {}", stream.0))
        })?;
        let count = entry
            .inflight
            .count
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        Ok(*count == 0)
    }

    fn create_event(&self, _timing: bool) -> HalResult<NativeEvent> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::new(EventSlot::new()));
        Ok(NativeEvent(id))
    }

    fn destroy_event(&self, event: NativeEvent) -> HalResult<()> {
        self.shared
            .events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&event.0)
            .map(|_| ())
            .ok_or_else(|| HalError::AdapterSpecific(format!("unknown event handle {}", event.0)))
    }

    fn query_event(&self, event: NativeEvent) -> HalResult<bool> {
        Ok(self.event_slot(event)?.query().0)
    }

    fn wait_event(&self, event: NativeEvent) -> HalResult<()> {
        self.event_slot(event)?.wait();
        Ok(())
    }

    fn event_timestamp(&self, event: NativeEvent) -> HalResult<u64> {
        let (signalled, timestamp) = self.event_slot(event)?.query();
        if !signalled {
            return Err(HalError::InvalidOperation(
                "timestamp queried before event completion".into(),
            ));
        }
        Ok(timestamp)
    }

    fn alloc(&self, device: u32, size: usize) -> HalResult<DeviceAlloc> {
        if device >= self.num_devices {
            return Err(HalError::InvalidValue(format!(
                "device {} out of range ({} devices)",
                device, self.num_devices
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .allocs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                id,
                Arc::new(AllocSlot {
                    bytes: Mutex::new(vec![0u8; size]),
                }),
            );
        Ok(DeviceAlloc(id))
    }

    fn free(&self, alloc: DeviceAlloc) -> HalResult<()> {
        self.shared
            .allocs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&alloc.0)
            .map(|_| ())
            .ok_or_else(|| {
                HalError::AdapterSpecific(format!("unknown allocation handle {}", alloc.0))
            })
    }

    fn host_view(&self, alloc: DeviceAlloc) -> Option<HostPtr> {
        if !self.unified_memory {
            return None;
        }
        let slot = self.alloc_slot(alloc).ok()?;
        // The vector is never resized after allocation, so the heap buffer
        // is stable for the allocation's lifetime.
        let ptr = slot
            .bytes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_mut_ptr();
        Some(HostPtr(ptr))
    }

    fn append(&self, stream: StreamId, command: Command) -> HalResult<()> {
        self.validate(&command)?;
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let entry = streams.get_mut(&stream.0).ok_or_else(|| {
            HalError::AdapterSpecific(format!("unknown stream handle {}", stream.0))
        })?;
        entry.pending.push(command);
        Ok(())
    }

    fn submit(&self, stream: StreamId) -> HalResult<()> {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let entry = streams.get_mut(&stream.0).ok_or_else(|| {
            HalError::AdapterSpecific(format!("unknown stream handle {}", stream.0))
        })?;
        if entry.pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut entry.pending);
        {
            let mut count = entry
                .inflight
                .count
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            *count += 1;
        }
        let sender = entry
            .sender
            .as_ref()
            .ok_or_else(|| HalError::AdapterSpecific("stream already shut down".into()))?;
        sender.send(batch).map_err(|_| {
            // Roll the counter back so synchronize cannot hang on a dead
            // worker.
            let mut count = entry
                .inflight
                .count
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            *count = count.saturating_sub(1);
            HalError::AdapterSpecific("stream worker terminated".into())
        })?;
        Ok(())
    }
}

impl Drop for CpuBackend {
    fn drop(&mut self) {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        for (_, mut entry) in streams.drain() {
            entry.sender.take();
            if let Some(worker) = entry.worker.take() {
                let _ = worker.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submitted_batches_execute_in_order() {
        let backend = CpuBackend::new(1);
        let stream = backend.create_stream(0, 0).unwrap();
        let alloc = backend.alloc(0, 8).unwrap();

        backend
            .append(
                stream,
                Command::Fill {
                    dst: alloc,
                    offset: 0,
                    pattern: vec![0xAA],
                    size: 8,
                },
            )
            .unwrap();
        backend
            .append(
                stream,
                Command::Fill {
                    dst: alloc,
                    offset: 0,
                    pattern: vec![0x55],
                    size: 4,
                },
            )
            .unwrap();
        backend.submit(stream).unwrap();
        backend.synchronize_stream(stream).unwrap();

        let mut out = vec![0u8; 8];
        backend
            .append(
                stream,
                Command::CopyDeviceToHost {
                    dst: HostPtr::new(out.as_mut_ptr()),
                    src: alloc,
                    src_offset: 0,
                    size: 8,
                },
            )
            .unwrap();
        backend.submit(stream).unwrap();
        backend.synchronize_stream(stream).unwrap();
        assert_eq!(out, vec![0x55, 0x55, 0x55, 0x55, 0xAA, 0xAA, 0xAA, 0xAA]);

        backend.free(alloc).unwrap();
        backend.destroy_stream(stream).unwrap();
    }

    #[test]
    fn record_then_wait_across_streams() {
        let backend = CpuBackend::new(1);
        let producer = backend.create_stream(0, 0).unwrap();
        let consumer = backend.create_stream(0, 0).unwrap();
        let alloc = backend.alloc(0, 4).unwrap();
        let event = backend.create_event(false).unwrap();

        backend
            .append(
                producer,
                Command::Fill {
                    dst: alloc,
                    offset: 0,
                    pattern: vec![7],
                    size: 4,
                },
            )
            .unwrap();
        backend
            .append(producer, Command::RecordEvent { event })
            .unwrap();

        let mut out = vec![0u8; 4];
        backend
            .append(consumer, Command::WaitEvent { event })
            .unwrap();
        backend
            .append(
                consumer,
                Command::CopyDeviceToHost {
                    dst: HostPtr::new(out.as_mut_ptr()),
                    src: alloc,
                    src_offset: 0,
                    size: 4,
                },
            )
            .unwrap();
        // Submit the consumer first; it must block on the event until the
        // producer's batch runs.
        backend.submit(consumer).unwrap();
        backend.submit(producer).unwrap();
        backend.synchronize_stream(consumer).unwrap();
        assert_eq!(out, vec![7, 7, 7, 7]);
        assert!(backend.query_event(event).unwrap());

        backend.destroy_event(event).unwrap();
        backend.free(alloc).unwrap();
        backend.destroy_stream(producer).unwrap();
        backend.destroy_stream(consumer).unwrap();
    }

    #[test]
    fn append_validates_bounds() {
        let backend = CpuBackend::new(1);
        let stream = backend.create_stream(0, 0).unwrap();
        let alloc = backend.alloc(0, 4).unwrap();
        let result = backend.append(
            stream,
            Command::Fill {
                dst: alloc,
                offset: 2,
                pattern: vec![1],
                size: 4,
            },
        );
        assert!(matches!(result, Err(HalError::AdapterSpecific(_))));
        backend.destroy_stream(stream).unwrap();
    }

    #[test]
    fn timestamp_requires_completion() {
        let backend = CpuBackend::new(1);
        let event = backend.create_event(true).unwrap();
        assert!(matches!(
            backend.event_timestamp(event),
            Err(HalError::InvalidOperation(_))
        ));
    }
}
