//! Uniform-API event wrapper
//!
//! An [`Event`] is a cheap clonable handle over one native completion
//! primitive plus bookkeeping: command type, owning queue (weak), the stream
//! and per-queue sequence token it was recorded with, and the monotonic
//! `recorded -> running -> complete` state. Retain is `clone`, release is
//! drop; the native primitive is destroyed exactly once, when the last
//! handle drops, unless the event borrows a foreign (interop) primitive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::{HalError, HalResult};
use crate::native::{Command, NativeBackend, NativeEvent, StreamId};
use crate::runtime::queue::QueueInner;

/// The kind of command an event tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    KernelLaunch,
    BufferRead,
    BufferWrite,
    BufferCopy,
    BufferFill,
    BufferMap,
    BufferUnmap,
    UsmMemcpy,
    UsmFill,
    UsmPrefetch,
    UsmAdvise,
    Barrier,
    User,
    TimestampRecord,
}

/// Who is allowed to destroy the native primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeOwnership {
    Owned,
    BorrowedNoDestroy,
}

/// Derived execution state, monotonically increasing over an event's life
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExecutionStatus {
    Submitted,
    Running,
    Complete,
}

/// Profiling timestamps in backend nanoseconds
#[derive(Debug, Clone, Copy)]
pub struct ProfilingInfo {
    pub queued_ns: u64,
    pub start_ns: u64,
    pub end_ns: u64,
}

pub(crate) struct EventInner {
    command: CommandType,
    backend: Arc<dyn NativeBackend>,
    queue: Option<Weak<QueueInner>>,
    end: NativeEvent,
    queued: Option<NativeEvent>,
    start: Option<NativeEvent>,
    stream: Option<StreamId>,
    sequence: u64,
    ownership: NativeOwnership,
    interop: bool,
    recorded: AtomicBool,
    started: AtomicBool,
    completed: AtomicBool,
    /// Host memory the tracked command reads from asynchronously (staged
    /// writes, unmap staging, coherence bounce buffers). Freed only after
    /// completion.
    staging: Mutex<Vec<Box<[u8]>>>,
    /// Helper native events (barrier cross-stream markers) destroyed with
    /// this event, after completion.
    aux_events: Mutex<Vec<NativeEvent>>,
}

/// Uniform-API event handle
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Event {}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("command", &self.inner.command)
            .field("stream", &self.inner.stream)
            .field("sequence", &self.inner.sequence)
            .field("interop", &self.inner.interop)
            .finish()
    }
}

impl Event {
    /// Create an event bound to a queue stream position.
    ///
    /// The native end marker is always allocated; queued/start markers only
    /// when the queue profiles or the command is a timestamp recording. The
    /// queued marker is recorded immediately on the queue's host-submit
    /// timestamp stream.
    pub(crate) fn new_native(
        queue: &Arc<QueueInner>,
        command: CommandType,
        stream: StreamId,
    ) -> HalResult<Event> {
        let backend = Arc::clone(queue.backend());
        let requires_timing =
            queue.flags().profiling || command == CommandType::TimestampRecord;
        let end = backend
            .create_event(requires_timing)
            .map_err(|e| HalError::OutOfResources(format!("event creation failed: {}", e)))?;
        let (queued, start) = if requires_timing {
            let queued = backend
                .create_event(true)
                .map_err(|e| HalError::OutOfResources(format!("event creation failed: {}", e)))?;
            let start = backend
                .create_event(true)
                .map_err(|e| HalError::OutOfResources(format!("event creation failed: {}", e)))?;
            let host_stream = queue.host_time_stream()?;
            backend.append(host_stream, Command::RecordEvent { event: queued })?;
            backend.submit(host_stream)?;
            (Some(queued), Some(start))
        } else {
            (None, None)
        };
        Ok(Event {
            inner: Arc::new(EventInner {
                command,
                backend,
                queue: Some(Arc::downgrade(queue)),
                end,
                queued,
                start,
                stream: Some(stream),
                sequence: queue.next_sequence(),
                ownership: NativeOwnership::Owned,
                interop: false,
                recorded: AtomicBool::new(false),
                started: AtomicBool::new(false),
                completed: AtomicBool::new(false),
                staging: Mutex::new(Vec::new()),
                aux_events: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Wrap a foreign native primitive. The handle never destroys it and
    /// the event is never assumed to belong to a specific stream for
    /// wait-list deduplication.
    pub(crate) fn from_native(backend: Arc<dyn NativeBackend>, handle: NativeEvent) -> Event {
        Event {
            inner: Arc::new(EventInner {
                command: CommandType::User,
                backend,
                queue: None,
                end: handle,
                queued: None,
                start: None,
                stream: None,
                sequence: 0,
                ownership: NativeOwnership::BorrowedNoDestroy,
                interop: true,
                recorded: AtomicBool::new(true),
                started: AtomicBool::new(true),
                completed: AtomicBool::new(false),
                staging: Mutex::new(Vec::new()),
                aux_events: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn command_type(&self) -> CommandType {
        self.inner.command
    }

    pub fn is_interop(&self) -> bool {
        self.inner.interop
    }

    pub(crate) fn native_end(&self) -> NativeEvent {
        self.inner.end
    }

    pub(crate) fn stream_id(&self) -> Option<StreamId> {
        self.inner.stream
    }

    /// Ordering key used by the wait-list dedup; interop events get a key
    /// that never groups with real streams.
    pub(crate) fn stream_key(&self) -> u64 {
        self.inner.stream.map(|s| s.raw()).unwrap_or(u64::MAX)
    }

    pub(crate) fn sequence(&self) -> u64 {
        self.inner.sequence
    }

    pub(crate) fn owner(&self) -> Option<Arc<QueueInner>> {
        self.inner.queue.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn owner_is(&self, queue: &Arc<QueueInner>) -> bool {
        self.owner()
            .map(|owner| Arc::ptr_eq(&owner, queue))
            .unwrap_or(false)
    }

    pub(crate) fn backend_is(&self, backend: &Arc<dyn NativeBackend>) -> bool {
        Arc::ptr_eq(&self.inner.backend, backend)
    }

    pub(crate) fn is_recorded(&self) -> bool {
        self.inner.recorded.load(Ordering::Acquire)
    }

    /// Append the start marker ahead of the tracked command. Only
    /// meaningful when timing was requested at creation.
    pub(crate) fn start(&self) -> HalResult<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let (Some(start), Some(stream)) = (self.inner.start, self.inner.stream) {
            self.inner
                .backend
                .append(stream, Command::RecordEvent { event: start })?;
        }
        Ok(())
    }

    /// Append the end-marker record instruction after the tracked command
    pub(crate) fn record(&self) -> HalResult<()> {
        let stream = self.inner.stream.ok_or_else(|| {
            HalError::InvalidOperation("record on an event with no stream".into())
        })?;
        self.inner
            .backend
            .append(stream, Command::RecordEvent { event: self.inner.end })?;
        self.inner.started.store(true, Ordering::Release);
        self.inner.recorded.store(true, Ordering::Release);
        Ok(())
    }

    /// Keep host memory alive until the event completes
    pub(crate) fn attach_staging(&self, staging: Box<[u8]>) {
        self.inner
            .staging
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(staging);
    }

    /// Tie a helper native event's lifetime to this event
    pub(crate) fn attach_aux_event(&self, event: NativeEvent) {
        self.inner
            .aux_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }

    pub(crate) fn mark_complete(&self) {
        self.inner.completed.store(true, Ordering::Release);
    }

    /// Block the calling host thread until the native primitive signals.
    ///
    /// Idempotent; also flushes the owning queue's open batches first, so a
    /// wait on a batched-but-unsubmitted command cannot hang.
    pub fn wait(&self) -> HalResult<()> {
        if self.inner.completed.load(Ordering::Acquire) {
            return Ok(());
        }
        if let Some(owner) = self.owner() {
            owner.flush_all()?;
        }
        self.wait_recorded()
    }

    /// Host wait that assumes any batch holding the record instruction was
    /// already submitted.
    pub(crate) fn wait_recorded(&self) -> HalResult<()> {
        if self.inner.completed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.inner.backend.wait_event(self.inner.end)?;
        self.inner.completed.store(true, Ordering::Release);
        // Completion releases any retained host staging early.
        self.inner
            .staging
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }

    /// Derived execution status. Re-queries the native primitive except
    /// that an observed completion is cached, since completion is
    /// monotonic.
    pub fn status(&self) -> HalResult<ExecutionStatus> {
        if !self.is_recorded() {
            return Ok(ExecutionStatus::Submitted);
        }
        if self.inner.completed.load(Ordering::Acquire) {
            return Ok(ExecutionStatus::Complete);
        }
        if self.inner.backend.query_event(self.inner.end)? {
            self.inner.completed.store(true, Ordering::Release);
            Ok(ExecutionStatus::Complete)
        } else {
            Ok(ExecutionStatus::Running)
        }
    }

    /// Queued/start/end timestamps. Only available once the event completed
    /// on a queue with profiling enabled.
    pub fn profiling_info(&self) -> HalResult<ProfilingInfo> {
        let (queued, start) = match (self.inner.queued, self.inner.start) {
            (Some(q), Some(s)) => (q, s),
            _ => {
                return Err(HalError::InvalidOperation(
                    "profiling info not available: queue was not created with profiling".into(),
                ))
            }
        };
        if self.status()? != ExecutionStatus::Complete {
            return Err(HalError::InvalidOperation(
                "profiling info not available before completion".into(),
            ));
        }
        Ok(ProfilingInfo {
            queued_ns: self.inner.backend.event_timestamp(queued)?,
            start_ns: self.inner.backend.event_timestamp(start)?,
            end_ns: self.inner.backend.event_timestamp(self.inner.end)?,
        })
    }
}

impl Drop for EventInner {
    fn drop(&mut self) {
        let aux = std::mem::take(
            &mut *self
                .aux_events
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        let staging = std::mem::take(
            &mut *self
                .staging
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        if self.ownership != NativeOwnership::Owned && staging.is_empty() {
            // Borrowed primitive, nothing retained: release is a no-op.
            return;
        }
        // A recorded-but-incomplete primitive may still be referenced: by
        // pending wait-on-event instructions in another queue's open batch,
        // by the device reading retained host staging, or by barrier markers
        // on sibling streams. It must not be destroyed under the device.
        let in_flight = self.recorded.load(Ordering::Acquire)
            && !self.completed.load(Ordering::Acquire)
            && !self.backend.query_event(self.end).unwrap_or(false);
        if in_flight {
            if let Some(owner) = self.queue.as_ref().and_then(Weak::upgrade) {
                // Hand everything to the owning queue; it destroys the
                // primitives after its next full synchronization.
                let mut events = Vec::new();
                if self.ownership == NativeOwnership::Owned {
                    events.extend(
                        [Some(self.end), self.queued, self.start]
                            .into_iter()
                            .flatten()
                            .chain(aux),
                    );
                }
                owner.defer_release(events, staging);
                return;
            }
            // No queue left to track completion; resolve on the host.
            if let Err(e) = self.backend.wait_event(self.end) {
                tracing::trace!("wait during event teardown failed: {}", e);
            }
        }
        if self.ownership == NativeOwnership::Owned {
            for event in [Some(self.end), self.queued, self.start]
                .into_iter()
                .flatten()
                .chain(aux)
            {
                if let Err(e) = self.backend.destroy_event(event) {
                    tracing::trace!("native event destroy failed: {}", e);
                }
            }
        }
    }
}
