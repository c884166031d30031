//! Uniform-API queue
//!
//! A queue owns one stream pool per engine group (compute always, transfer
//! when the device exposes copy engines), a barrier-event slot with
//! per-stream applied flags, and the per-queue event sequence counter the
//! wait-list dedup relies on. Queue state is guarded by a reader/writer
//! lock; in single-thread mode acquisition is non-blocking and contention
//! is reported as a contract violation rather than waited out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};

use crate::config::{EngineKind, RuntimeConfig};
use crate::error::{HalError, HalResult};
use crate::native::{NativeBackend, NativeEvent, StreamId};
use crate::runtime::context::Context;
use crate::runtime::event::Event;
use crate::runtime::stream_pool::StreamPool;

/// Queue scheduling priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePriority {
    Low,
    #[default]
    Normal,
    High,
}

impl QueuePriority {
    /// Native stream priority, HIP/CUDA convention: lower values are more
    /// urgent, 0 is the default.
    pub(crate) fn native(self) -> i32 {
        match self {
            QueuePriority::High => -1,
            QueuePriority::Normal => 0,
            QueuePriority::Low => 1,
        }
    }
}

/// Queue creation flags
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueFlags {
    /// Commands may execute out of submission order across the pool's
    /// streams (the default pool already provides this; in-order queues
    /// restrict the pool to one stream).
    pub in_order: bool,
    /// Allocate timing markers for every event
    pub profiling: bool,
    pub priority: QueuePriority,
}

impl QueueFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_in_order(mut self, v: bool) -> Self {
        self.in_order = v;
        self
    }

    pub fn with_profiling(mut self, v: bool) -> Self {
        self.profiling = v;
        self
    }

    pub fn with_priority(mut self, priority: QueuePriority) -> Self {
        self.priority = priority;
        self
    }
}

pub(crate) struct QueueState {
    pub compute: StreamPool,
    pub transfer: Option<StreamPool>,
    pub barrier: Option<Event>,
}

impl QueueState {
    pub fn pool_mut(&mut self, engine: EngineKind) -> &mut StreamPool {
        match engine {
            EngineKind::Transfer => self.transfer.as_mut().unwrap_or(&mut self.compute),
            EngineKind::Compute => &mut self.compute,
        }
    }

    /// Submit the open batch holding `stream`'s pending commands, whichever
    /// engine group it belongs to.
    pub fn flush_stream(
        &mut self,
        stream: StreamId,
        backend: &dyn NativeBackend,
    ) -> HalResult<()> {
        if self.compute.contains(stream) {
            self.compute.flush_stream(stream, backend)?;
        }
        if let Some(transfer) = self.transfer.as_mut() {
            if transfer.contains(stream) {
                transfer.flush_stream(stream, backend)?;
            }
        }
        Ok(())
    }
}

/// Native primitives and host staging released while their work was still in
/// flight. Destroying or freeing them must wait for the device; the queue
/// reclaims the lot after its next full synchronization.
#[derive(Default)]
pub(crate) struct DeferredReclaim {
    events: Vec<NativeEvent>,
    staging: Vec<Box<[u8]>>,
}

pub(crate) struct QueueInner {
    context: Arc<Context>,
    device: u32,
    flags: QueueFlags,
    state: RwLock<QueueState>,
    sequence: AtomicU64,
    /// Created lazily the first time a profiled event needs a queued-time
    /// marker
    host_time_stream: Mutex<Option<StreamId>>,
    deferred: Mutex<DeferredReclaim>,
    owns_streams: bool,
}

impl QueueInner {
    pub fn backend(&self) -> &Arc<dyn NativeBackend> {
        self.context.backend()
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.context.config()
    }

    pub fn device(&self) -> u32 {
        self.device
    }

    pub fn flags(&self) -> QueueFlags {
        self.flags
    }

    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn state_read(&self) -> HalResult<RwLockReadGuard<'_, QueueState>> {
        if self.config().single_thread_mode {
            match self.state.try_read() {
                Ok(guard) => Ok(guard),
                Err(TryLockError::Poisoned(e)) => Err(HalError::from(e)),
                Err(TryLockError::WouldBlock) => Err(HalError::InvalidOperation(
                    "queue accessed concurrently while single-thread mode is declared".into(),
                )),
            }
        } else {
            self.state.read().map_err(HalError::from)
        }
    }

    pub fn state_write(&self) -> HalResult<RwLockWriteGuard<'_, QueueState>> {
        if self.config().single_thread_mode {
            match self.state.try_write() {
                Ok(guard) => Ok(guard),
                Err(TryLockError::Poisoned(e)) => Err(HalError::from(e)),
                Err(TryLockError::WouldBlock) => Err(HalError::InvalidOperation(
                    "queue accessed concurrently while single-thread mode is declared".into(),
                )),
            }
        } else {
            self.state.write().map_err(HalError::from)
        }
    }

    /// Submit every open batch in every engine group without blocking
    pub fn flush_all(&self) -> HalResult<()> {
        let backend = Arc::clone(self.backend());
        let mut state = self.state_write()?;
        state.compute.flush_all(&*backend)?;
        if let Some(transfer) = state.transfer.as_mut() {
            transfer.flush_all(&*backend)?;
        }
        Ok(())
    }

    /// Take custody of primitives released mid-flight; see
    /// [`DeferredReclaim`].
    pub fn defer_release(&self, events: Vec<NativeEvent>, staging: Vec<Box<[u8]>>) {
        let mut deferred = self.deferred.lock().unwrap_or_else(|e| e.into_inner());
        deferred.events.extend(events);
        deferred.staging.extend(staging);
    }

    /// Destroy deferred primitives and free deferred staging. Callers must
    /// have synchronized every stream of the queue first.
    pub fn reclaim_deferred(&self) {
        let reclaim = std::mem::take(
            &mut *self.deferred.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for event in reclaim.events {
            if let Err(e) = self.backend().destroy_event(event) {
                tracing::trace!("deferred event destroy failed: {}", e);
            }
        }
        drop(reclaim.staging);
    }

    /// Lazily created stream used to timestamp command enqueue times
    pub fn host_time_stream(&self) -> HalResult<StreamId> {
        let mut slot = self
            .host_time_stream
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(stream) = *slot {
            return Ok(stream);
        }
        let stream = self.backend().create_stream(self.device, 0)?;
        *slot = Some(stream);
        Ok(stream)
    }
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        let backend = Arc::clone(self.context.backend());
        let state = self.state.get_mut();
        let state = match state {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.barrier = None;
        if self.owns_streams {
            // Drain before destroy: no in-flight native command is
            // abandoned.
            state.compute.destroy_all(&*backend, true);
            if let Some(transfer) = state.transfer.as_mut() {
                transfer.destroy_all(&*backend, true);
            }
        } else {
            // Foreign streams are flushed but never synchronized or
            // destroyed.
            state.compute.release_without_destroy(&*backend);
            if let Some(transfer) = state.transfer.as_mut() {
                transfer.release_without_destroy(&*backend);
            }
        }
        let host_stream = self
            .host_time_stream
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(stream) = host_stream {
            if let Err(e) = backend.synchronize_stream(stream) {
                tracing::warn!("host timestamp stream drain failed: {}", e);
            }
            if let Err(e) = backend.destroy_stream(stream) {
                tracing::warn!("host timestamp stream destroy failed: {}", e);
            }
        }
        // Streams are drained; deferred primitives are safe to destroy.
        self.reclaim_deferred();
    }
}

/// Client-visible work-submission target
#[derive(Clone)]
pub struct Queue {
    pub(crate) inner: Arc<QueueInner>,
}

impl Queue {
    pub(crate) fn create(
        context: Arc<Context>,
        device: u32,
        flags: QueueFlags,
    ) -> HalResult<Queue> {
        let config = context.config();
        let backend = Arc::clone(context.backend());
        let compute_count = if flags.in_order {
            1
        } else {
            config.compute_streams
        };
        let priority = flags.priority.native();
        let compute = StreamPool::create(&*backend, device, compute_count, priority)?;
        let transfer = if !flags.in_order
            && config.transfer_streams > 0
            && backend.capabilities().has_transfer_engine
        {
            Some(StreamPool::create(
                &*backend,
                device,
                config.transfer_streams,
                priority,
            )?)
        } else {
            None
        };
        tracing::debug!(
            device,
            compute = compute.len(),
            transfer = transfer.as_ref().map(|p| p.len()).unwrap_or(0),
            "queue created"
        );
        Ok(Queue {
            inner: Arc::new(QueueInner {
                context,
                device,
                flags,
                state: RwLock::new(QueueState {
                    compute,
                    transfer,
                    barrier: None,
                }),
                sequence: AtomicU64::new(0),
                host_time_stream: Mutex::new(None),
                deferred: Mutex::new(DeferredReclaim::default()),
                owns_streams: true,
            }),
        })
    }

    /// Wrap a foreign native stream. The queue never synchronizes or
    /// destroys it at release.
    pub(crate) fn from_native_stream(
        context: Arc<Context>,
        device: u32,
        stream: StreamId,
        flags: QueueFlags,
    ) -> Queue {
        Queue {
            inner: Arc::new(QueueInner {
                context,
                device,
                flags,
                state: RwLock::new(QueueState {
                    compute: StreamPool::from_native(stream),
                    transfer: None,
                    barrier: None,
                }),
                sequence: AtomicU64::new(0),
                host_time_stream: Mutex::new(None),
                deferred: Mutex::new(DeferredReclaim::default()),
                owns_streams: false,
            }),
        }
    }

    pub fn device(&self) -> u32 {
        self.inner.device
    }

    pub fn flags(&self) -> QueueFlags {
        self.inner.flags
    }

    /// Block until all previously enqueued work on this queue is complete,
    /// across every engine group. Resets round-robin usage markers for fair
    /// reuse.
    pub fn finish(&self) -> HalResult<()> {
        let backend = Arc::clone(self.inner.backend());
        let mut state = self.inner.state_write()?;
        state.compute.synchronize_all(&*backend, true)?;
        if let Some(transfer) = state.transfer.as_mut() {
            transfer.synchronize_all(&*backend, true)?;
        }
        // A completed barrier has been waited on by definition.
        if let Some(barrier) = state.barrier.take() {
            barrier.mark_complete();
        }
        drop(state);
        self.inner.reclaim_deferred();
        Ok(())
    }

    /// Submit open batches without blocking for completion
    pub fn flush(&self) -> HalResult<()> {
        self.inner.flush_all()
    }

    /// Non-blocking: true only if every stream in every engine group is
    /// idle and no batch is open.
    pub fn is_empty(&self) -> HalResult<bool> {
        let backend = Arc::clone(self.inner.backend());
        let state = self.inner.state_read()?;
        if !state.compute.all_idle(&*backend)? {
            return Ok(false);
        }
        if let Some(transfer) = state.transfer.as_ref() {
            if !transfer.all_idle(&*backend)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
