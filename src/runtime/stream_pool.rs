//! Bounded native stream pool with batching state
//!
//! One pool per engine group per queue. The stream set is fixed at queue
//! creation; acquisition rotates round-robin, and each stream tracks an open
//! (appended but unsubmitted) batch, a used-this-round marker reset by
//! `finish`, and a barrier-applied flag so a device-wide barrier costs one
//! wait per stream, not one per command.

use crate::error::{HalError, HalResult};
use crate::native::{Command, NativeBackend, NativeEvent, StreamId};

pub(crate) struct StreamSlot {
    id: StreamId,
    open_commands: usize,
    used: bool,
    barrier_applied: bool,
}

pub(crate) struct StreamPool {
    slots: Vec<StreamSlot>,
    /// Most recently handed-out slot; batchable work coalesces here
    current: usize,
}

impl StreamPool {
    pub fn create(
        backend: &dyn NativeBackend,
        device: u32,
        count: usize,
        priority: i32,
    ) -> HalResult<StreamPool> {
        let mut slots = Vec::with_capacity(count.max(1));
        for _ in 0..count.max(1) {
            let id = backend.create_stream(device, priority)?;
            slots.push(StreamSlot {
                id,
                open_commands: 0,
                used: false,
                barrier_applied: false,
            });
        }
        Ok(StreamPool { slots, current: 0 })
    }

    /// Wrap one externally owned stream (interop queues)
    pub fn from_native(stream: StreamId) -> StreamPool {
        StreamPool {
            slots: vec![StreamSlot {
                id: stream,
                open_commands: 0,
                used: false,
                barrier_applied: false,
            }],
            current: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn stream(&self, index: usize) -> StreamId {
        self.slots[index].id
    }

    pub fn contains(&self, stream: StreamId) -> bool {
        self.slots.iter().any(|s| s.id == stream)
    }

    pub fn streams(&self) -> Vec<StreamId> {
        self.slots.iter().map(|s| s.id).collect()
    }

    /// Select a stream for one enqueue call.
    ///
    /// Batchable work reuses the current slot while it has an open batch
    /// (coalescing). Otherwise selection advances round-robin; work that
    /// cannot batch prefers a slot with no open batch, flushing the victim
    /// only when every slot is mid-batch.
    pub fn acquire(
        &mut self,
        allow_batching: bool,
        backend: &dyn NativeBackend,
    ) -> HalResult<usize> {
        if allow_batching && self.slots[self.current].open_commands > 0 {
            self.slots[self.current].used = true;
            return Ok(self.current);
        }

        let len = self.slots.len();
        let mut index = (self.current + 1) % len;
        if !allow_batching && self.slots[index].open_commands > 0 {
            for probe in 0..len {
                let candidate = (self.current + 1 + probe) % len;
                if self.slots[candidate].open_commands == 0 {
                    index = candidate;
                    break;
                }
            }
        }

        if self.slots[index].open_commands > 0 {
            backend.submit(self.slots[index].id)?;
            self.slots[index].open_commands = 0;
        }
        self.slots[index].used = true;
        self.current = index;
        Ok(index)
    }

    /// Account for client commands added to the slot's open batch. The
    /// batching threshold counts client commands, not native instructions,
    /// so dependency waits and markers do not eat into the limit.
    pub fn note_appended(&mut self, index: usize, count: usize) {
        self.slots[index].open_commands += count;
    }

    /// Submit or keep batching, per the batching policy. A blocking call
    /// always submits and then synchronizes the stream.
    pub fn execute(
        &mut self,
        index: usize,
        blocking: bool,
        ok_to_batch: bool,
        batch_limit: usize,
        backend: &dyn NativeBackend,
    ) -> HalResult<()> {
        let slot = &mut self.slots[index];
        if blocking || !ok_to_batch || slot.open_commands >= batch_limit {
            backend.submit(slot.id)?;
            slot.open_commands = 0;
        }
        if blocking {
            backend.synchronize_stream(slot.id)?;
        }
        Ok(())
    }

    /// Submit every open batch without blocking
    pub fn flush_all(&mut self, backend: &dyn NativeBackend) -> HalResult<()> {
        for slot in &mut self.slots {
            if slot.open_commands > 0 {
                backend.submit(slot.id)?;
                slot.open_commands = 0;
            }
        }
        Ok(())
    }

    /// Submit the open batch of one specific stream, if any
    pub fn flush_stream(&mut self, stream: StreamId, backend: &dyn NativeBackend) -> HalResult<()> {
        for slot in &mut self.slots {
            if slot.id == stream && slot.open_commands > 0 {
                backend.submit(slot.id)?;
                slot.open_commands = 0;
            }
        }
        Ok(())
    }

    /// Synchronize every stream; `reset_used` restores fair round-robin
    /// reuse after a full drain.
    pub fn synchronize_all(
        &mut self,
        backend: &dyn NativeBackend,
        reset_used: bool,
    ) -> HalResult<()> {
        self.flush_all(backend)?;
        for slot in &mut self.slots {
            backend.synchronize_stream(slot.id)?;
            if reset_used {
                slot.used = false;
            }
        }
        Ok(())
    }

    /// Non-blocking: true when no slot has open or in-flight work
    pub fn all_idle(&self, backend: &dyn NativeBackend) -> HalResult<bool> {
        for slot in &self.slots {
            if slot.open_commands > 0 || !backend.stream_idle(slot.id)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// A new barrier generation starts: every stream must wait again,
    /// except the stream the barrier itself was recorded on (already
    /// ordered after it by FIFO).
    pub fn reset_barrier_flags(&mut self, recorded_on: Option<StreamId>) {
        for slot in &mut self.slots {
            slot.barrier_applied = Some(slot.id) == recorded_on;
        }
    }

    /// Insert the wait-on-barrier instruction at most once per stream per
    /// barrier generation.
    pub fn apply_barrier_if_needed(
        &mut self,
        index: usize,
        barrier: NativeEvent,
        backend: &dyn NativeBackend,
    ) -> HalResult<()> {
        let slot = &mut self.slots[index];
        if !slot.barrier_applied {
            backend.append(slot.id, Command::WaitEvent { event: barrier })?;
            slot.barrier_applied = true;
        }
        Ok(())
    }

    /// Tear down owned streams; errors during teardown are reported but do
    /// not stop the remaining destroys.
    pub fn destroy_all(&mut self, backend: &dyn NativeBackend, synchronize: bool) {
        for slot in &mut self.slots {
            if slot.open_commands > 0 {
                if let Err(e) = backend.submit(slot.id) {
                    tracing::warn!("submit during stream teardown failed: {}", e);
                }
                slot.open_commands = 0;
            }
            if synchronize {
                if let Err(e) = backend.synchronize_stream(slot.id) {
                    tracing::warn!("synchronize during stream teardown failed: {}", e);
                }
            }
            if let Err(e) = backend.destroy_stream(slot.id) {
                tracing::warn!("native stream destroy failed: {}", e);
            }
        }
        self.slots.clear();
    }

    /// Drop bookkeeping without touching the native streams (interop)
    pub fn release_without_destroy(&mut self, backend: &dyn NativeBackend) {
        for slot in &mut self.slots {
            if slot.open_commands > 0 {
                if let Err(e) = backend.submit(slot.id) {
                    tracing::warn!("submit during interop queue release failed: {}", e);
                }
                slot.open_commands = 0;
            }
        }
        self.slots.clear();
    }

    pub fn open_commands(&self, index: usize) -> usize {
        self.slots[index].open_commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::mock::MockBackend;

    #[test]
    fn round_robin_rotates_when_not_batching() {
        let backend = MockBackend::new(1);
        let mut pool = StreamPool::create(&*backend, 0, 3, 0).unwrap();
        let a = pool.acquire(false, &*backend).unwrap();
        let b = pool.acquire(false, &*backend).unwrap();
        let c = pool.acquire(false, &*backend).unwrap();
        let d = pool.acquire(false, &*backend).unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(a, d);
    }

    #[test]
    fn batchable_work_coalesces_on_open_batch() {
        let backend = MockBackend::new(1);
        let mut pool = StreamPool::create(&*backend, 0, 3, 0).unwrap();
        let first = pool.acquire(true, &*backend).unwrap();
        pool.note_appended(first, 1);
        let second = pool.acquire(true, &*backend).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn non_batchable_prefers_idle_stream() {
        let backend = MockBackend::new(1);
        let mut pool = StreamPool::create(&*backend, 0, 2, 0).unwrap();
        let busy = pool.acquire(true, &*backend).unwrap();
        pool.note_appended(busy, 1);
        let other = pool.acquire(false, &*backend).unwrap();
        assert_ne!(busy, other);
        // The busy stream's batch is still open; nothing was submitted.
        assert_eq!(backend.submission_count(), 0);
    }

    #[test]
    fn execute_honors_batch_limit() {
        let backend = MockBackend::new(1);
        let mut pool = StreamPool::create(&*backend, 0, 1, 0).unwrap();
        let index = pool.acquire(true, &*backend).unwrap();
        pool.note_appended(index, 1);
        pool.execute(index, false, true, 4, &*backend).unwrap();
        assert_eq!(backend.submission_count(), 0);
        assert_eq!(pool.open_commands(index), 1);
        pool.note_appended(index, 3);
        pool.execute(index, false, true, 4, &*backend).unwrap();
        assert_eq!(backend.submission_count(), 1);
        assert_eq!(pool.open_commands(index), 0);
    }
}
