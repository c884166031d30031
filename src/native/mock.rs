//! Counting test double for the native layer
//!
//! [`MockBackend`] executes nothing; it records every append, submission,
//! synchronize and destroy so tests can assert on scheduling behavior:
//! how many native submissions a batch of enqueues produced, how many
//! wait-on-event instructions landed on a stream, and that each native
//! primitive is destroyed exactly once. `submit` marks every recorded event
//! in the batch complete, so event lifecycles still progress.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{HalError, HalResult};
use crate::native::{
    BackendCaps, Command, DeviceAlloc, KernelId, NativeBackend, NativeEvent, StreamId,
};

#[derive(Default)]
struct MockEvent {
    completed: bool,
    destroyed: bool,
}

#[derive(Default)]
struct MockStream {
    pending: Vec<Command>,
    submitted: Vec<Vec<Command>>,
    destroyed: bool,
    synchronize_calls: u64,
    priority: i32,
}

#[derive(Default)]
struct MockState {
    events: HashMap<u64, MockEvent>,
    streams: HashMap<u64, MockStream>,
    allocs: HashMap<u64, usize>,
}

/// In-memory fake native driver with observable counters
pub struct MockBackend {
    state: Mutex<MockState>,
    next_id: AtomicU64,
    num_devices: u32,
    event_creates: AtomicU64,
    event_destroys: AtomicU64,
    stream_destroys: AtomicU64,
    submissions: AtomicU64,
    caps: BackendCaps,
}

impl MockBackend {
    pub fn new(num_devices: u32) -> Arc<Self> {
        Arc::new(MockBackend {
            state: Mutex::new(MockState::default()),
            next_id: AtomicU64::new(1),
            num_devices: num_devices.max(1),
            event_creates: AtomicU64::new(0),
            event_destroys: AtomicU64::new(0),
            stream_destroys: AtomicU64::new(0),
            submissions: AtomicU64::new(0),
            caps: BackendCaps::default(),
        })
    }

    /// Same as [`new`](Self::new) with an artificial wait-list length cap
    pub fn with_wait_list_limit(num_devices: u32, limit: usize) -> Arc<Self> {
        let mut backend = MockBackend {
            state: Mutex::new(MockState::default()),
            next_id: AtomicU64::new(1),
            num_devices: num_devices.max(1),
            event_creates: AtomicU64::new(0),
            event_destroys: AtomicU64::new(0),
            stream_destroys: AtomicU64::new(0),
            submissions: AtomicU64::new(0),
            caps: BackendCaps::default(),
        };
        backend.caps.max_wait_events = limit;
        Arc::new(backend)
    }

    /// Total number of native submissions observed
    pub fn submission_count(&self) -> u64 {
        self.submissions.load(Ordering::Relaxed)
    }

    /// Total native events created
    pub fn event_create_count(&self) -> u64 {
        self.event_creates.load(Ordering::Relaxed)
    }

    /// Total native events destroyed
    pub fn event_destroy_count(&self) -> u64 {
        self.event_destroys.load(Ordering::Relaxed)
    }

    /// Total native streams destroyed
    pub fn stream_destroy_count(&self) -> u64 {
        self.stream_destroys.load(Ordering::Relaxed)
    }

    /// Synchronize calls made against one stream
    pub fn synchronize_count(&self, stream: StreamId) -> u64 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .streams
            .get(&stream.0)
            .map(|s| s.synchronize_calls)
            .unwrap_or(0)
    }

    /// Every command submitted on a stream, flattened across batches
    pub fn submitted_commands(&self, stream: StreamId) -> Vec<Command> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .streams
            .get(&stream.0)
            .map(|s| s.submitted.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Commands sitting in a stream's open (unsubmitted) batch
    pub fn open_commands(&self, stream: StreamId) -> Vec<Command> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .streams
            .get(&stream.0)
            .map(|s| s.pending.clone())
            .unwrap_or_default()
    }

    /// Wait-on-event instructions across every stream, submitted or pending
    pub fn total_wait_instruction_count(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .streams
            .values()
            .map(|s| {
                s.submitted
                    .iter()
                    .flatten()
                    .chain(s.pending.iter())
                    .filter(|c| matches!(c, Command::WaitEvent { .. }))
                    .count()
            })
            .sum()
    }

    /// The priority a stream was created with
    pub fn stream_priority(&self, stream: StreamId) -> Option<i32> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.streams.get(&stream.0).map(|s| s.priority)
    }

    /// Priorities of every live (non-destroyed) stream, in creation order
    pub fn live_stream_priorities(&self) -> Vec<i32> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut streams: Vec<(&u64, &MockStream)> =
            state.streams.iter().filter(|(_, s)| !s.destroyed).collect();
        streams.sort_by_key(|(id, _)| **id);
        streams.into_iter().map(|(_, s)| s.priority).collect()
    }

    /// Hand out a kernel handle; the mock records launches without running
    /// anything.
    pub fn register_kernel(&self) -> KernelId {
        KernelId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Count of wait-on-event instructions submitted or pending on a stream
    pub fn wait_instruction_count(&self, stream: StreamId) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .streams
            .get(&stream.0)
            .map(|s| {
                s.submitted
                    .iter()
                    .flatten()
                    .chain(s.pending.iter())
                    .filter(|c| matches!(c, Command::WaitEvent { .. }))
                    .count()
            })
            .unwrap_or(0)
    }
}

impl NativeBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn device_count(&self) -> u32 {
        self.num_devices
    }

    fn can_access_peer(&self, _src_device: u32, _dst_device: u32) -> bool {
        true
    }

    fn capabilities(&self) -> BackendCaps {
        self.caps
    }

    fn create_stream(&self, device: u32, priority: i32) -> HalResult<StreamId> {
        if device >= self.num_devices {
            return Err(HalError::InvalidValue(format!(
                "device {} out of range",
                device
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .streams
            .insert(
                id,
                MockStream {
                    priority,
                    ..MockStream::default()
                },
            );
        Ok(StreamId(id))
    }

    fn destroy_stream(&self, stream: StreamId) -> HalResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entry = state.streams.get_mut(&stream.0).ok_or_else(|| {
            HalError::AdapterSpecific(format!("unknown stream handle {}", stream.0))
        })?;
        if entry.destroyed {
            return Err(HalError::AdapterSpecific("double stream destroy".into()));
        }
        entry.destroyed = true;
        self.stream_destroys.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn synchronize_stream(&self, stream: StreamId) -> HalResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entry = state.streams.get_mut(&stream.0).ok_or_else(|| {
            HalError::AdapterSpecific(format!("unknown stream handle {}", stream.0))
        })?;
        entry.synchronize_calls += 1;
        Ok(())
    }

    fn stream_idle(&self, stream: StreamId) -> HalResult<bool> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .streams
            .get(&stream.0)
            .map(|s| s.pending.is_empty())
            .ok_or_else(|| HalError::AdapterSpecific(format!("unknown stream handle {}", stream.0)))
    }

    fn create_event(&self, _timing: bool) -> HalResult<NativeEvent> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .events
            .insert(id, MockEvent::default());
        self.event_creates.fetch_add(1, Ordering::Relaxed);
        Ok(NativeEvent(id))
    }

    fn destroy_event(&self, event: NativeEvent) -> HalResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entry = state.events.get_mut(&event.0).ok_or_else(|| {
            HalError::AdapterSpecific(format!("unknown event handle {}", event.0))
        })?;
        if entry.destroyed {
            return Err(HalError::AdapterSpecific("double event destroy".into()));
        }
        entry.destroyed = true;
        self.event_destroys.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn query_event(&self, event: NativeEvent) -> HalResult<bool> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .events
            .get(&event.0)
            .map(|e| e.completed)
            .ok_or_else(|| HalError::AdapterSpecific(format!("unknown event handle {}", event.0)))
    }

    fn wait_event(&self, event: NativeEvent) -> HalResult<()> {
        // The mock completes work at submission; a host wait on an event
        // whose record was never submitted is a scheduling bug surfaced to
        // the test rather than a hang.
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entry = state.events.get(&event.0).ok_or_else(|| {
            HalError::AdapterSpecific(format!("unknown event handle {}", event.0))
        })?;
        if !entry.completed {
            return Err(HalError::InvalidOperation(
                "wait on event whose record was never submitted".into(),
            ));
        }
        Ok(())
    }

    fn event_timestamp(&self, event: NativeEvent) -> HalResult<u64> {
        if self.query_event(event)? {
            Ok(event.0)
        } else {
            Err(HalError::InvalidOperation(
                "timestamp queried before event completion".into(),
            ))
        }
    }

    fn alloc(&self, device: u32, size: usize) -> HalResult<DeviceAlloc> {
        if device >= self.num_devices {
            return Err(HalError::InvalidValue(format!(
                "device {} out of range",
                device
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .allocs
            .insert(id, size);
        Ok(DeviceAlloc(id))
    }

    fn free(&self, alloc: DeviceAlloc) -> HalResult<()> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .allocs
            .remove(&alloc.0)
            .map(|_| ())
            .ok_or_else(|| {
                HalError::AdapterSpecific(format!("unknown allocation handle {}", alloc.0))
            })
    }

    fn append(&self, stream: StreamId, command: Command) -> HalResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entry = state.streams.get_mut(&stream.0).ok_or_else(|| {
            HalError::AdapterSpecific(format!("unknown stream handle {}", stream.0))
        })?;
        entry.pending.push(command);
        Ok(())
    }

    fn submit(&self, stream: StreamId) -> HalResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entry = state.streams.get_mut(&stream.0).ok_or_else(|| {
            HalError::AdapterSpecific(format!("unknown stream handle {}", stream.0))
        })?;
        if entry.pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut entry.pending);
        let recorded: Vec<u64> = batch
            .iter()
            .filter_map(|c| match c {
                Command::RecordEvent { event } => Some(event.0),
                _ => None,
            })
            .collect();
        state
            .streams
            .get_mut(&stream.0)
            .map(|s| s.submitted.push(batch));
        for id in recorded {
            if let Some(event) = state.events.get_mut(&id) {
                event.completed = true;
            }
        }
        self.submissions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_completes_recorded_events() {
        let backend = MockBackend::new(1);
        let stream = backend.create_stream(0, 0).unwrap();
        let event = backend.create_event(false).unwrap();
        backend
            .append(stream, Command::RecordEvent { event })
            .unwrap();
        assert!(!backend.query_event(event).unwrap());
        backend.submit(stream).unwrap();
        assert!(backend.query_event(event).unwrap());
        assert_eq!(backend.submission_count(), 1);
    }

    #[test]
    fn destroy_is_observed_exactly_once() {
        let backend = MockBackend::new(1);
        let event = backend.create_event(false).unwrap();
        backend.destroy_event(event).unwrap();
        assert_eq!(backend.event_destroy_count(), 1);
        assert!(backend.destroy_event(event).is_err());
        assert_eq!(backend.event_destroy_count(), 1);
    }

    #[test]
    fn command_accounting_tracks_pending_and_submitted() {
        let backend = MockBackend::new(1);
        let stream = backend.create_stream(0, 0).unwrap();
        let event = backend.create_event(false).unwrap();
        let alloc = backend.alloc(0, 16).unwrap();

        backend
            .append(stream, Command::WaitEvent { event })
            .unwrap();
        backend
            .append(
                stream,
                Command::Fill {
                    dst: alloc,
                    offset: 0,
                    pattern: vec![0],
                    size: 16,
                },
            )
            .unwrap();
        assert_eq!(backend.open_commands(stream).len(), 2);
        assert!(backend.submitted_commands(stream).is_empty());
        assert_eq!(backend.wait_instruction_count(stream), 1);

        backend.submit(stream).unwrap();
        assert!(backend.open_commands(stream).is_empty());
        assert_eq!(backend.submitted_commands(stream).len(), 2);
        // Submission moves the batch; the wait instruction is still counted.
        assert_eq!(backend.wait_instruction_count(stream), 1);
    }

    #[test]
    fn empty_submit_is_free() {
        let backend = MockBackend::new(1);
        let stream = backend.create_stream(0, 0).unwrap();
        backend.submit(stream).unwrap();
        assert_eq!(backend.submission_count(), 0);
    }
}
