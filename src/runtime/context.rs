//! Runtime context: one back-end, one configuration, shared handles
//!
//! The context is the root object clients create first. It owns the chosen
//! native back-end and the immutable process-wide configuration, and it is
//! the factory for queues, buffers, device allocations, and imported interop
//! handles.

use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::error::{HalError, HalResult};
use crate::native::{DeviceAlloc, NativeBackend, NativeEvent, StreamId};
use crate::runtime::buffer::Buffer;
use crate::runtime::event::Event;
use crate::runtime::queue::{Queue, QueueFlags};

pub struct Context {
    backend: Arc<dyn NativeBackend>,
    config: RuntimeConfig,
}

impl Context {
    pub fn new(backend: Arc<dyn NativeBackend>, config: RuntimeConfig) -> Arc<Context> {
        tracing::debug!(adapter = backend.name(), devices = backend.device_count(), "context created");
        Arc::new(Context { backend, config })
    }

    pub(crate) fn backend(&self) -> &Arc<dyn NativeBackend> {
        &self.backend
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn device_count(&self) -> u32 {
        self.backend.device_count()
    }

    pub fn adapter_name(&self) -> &str {
        self.backend.name()
    }

    pub fn create_queue(self: &Arc<Self>, device: u32, flags: QueueFlags) -> HalResult<Queue> {
        if device >= self.backend.device_count() {
            return Err(HalError::InvalidValue(format!(
                "device ordinal {} out of range",
                device
            )));
        }
        Queue::create(Arc::clone(self), device, flags)
    }

    /// Wrap an externally created native stream in a queue. The runtime
    /// flushes work it appends there but never synchronizes or destroys the
    /// stream itself.
    pub fn create_queue_with_native_stream(
        self: &Arc<Self>,
        device: u32,
        stream: StreamId,
        flags: QueueFlags,
    ) -> HalResult<Queue> {
        if device >= self.backend.device_count() {
            return Err(HalError::InvalidValue(format!(
                "device ordinal {} out of range",
                device
            )));
        }
        Ok(Queue::from_native_stream(
            Arc::clone(self),
            device,
            stream,
            flags,
        ))
    }

    /// Create a logical buffer visible from every device in the context
    pub fn create_buffer(&self, size: usize) -> HalResult<Buffer> {
        Buffer::create(Arc::clone(&self.backend), size)
    }

    /// Wrap a foreign native synchronization primitive as an event. The
    /// handle is never destroyed by the runtime.
    pub fn import_native_event(&self, handle: NativeEvent) -> Event {
        Event::from_native(Arc::clone(&self.backend), handle)
    }

    /// Plain device allocation with alloc/free semantics. Pooling is a
    /// separate allocator concern layered above this.
    pub fn usm_device_alloc(&self, device: u32, size: usize) -> HalResult<UsmAlloc> {
        if size == 0 {
            return Err(HalError::InvalidValue(
                "allocation size must be non-zero".into(),
            ));
        }
        let alloc = self
            .backend
            .alloc(device, size)
            .map_err(|e| HalError::OutOfResources(format!("device allocation failed: {}", e)))?;
        Ok(UsmAlloc {
            inner: Arc::new(UsmInner {
                alloc,
                size,
                device,
                backend: Arc::clone(&self.backend),
            }),
        })
    }
}

struct UsmInner {
    alloc: DeviceAlloc,
    size: usize,
    device: u32,
    backend: Arc<dyn NativeBackend>,
}

impl Drop for UsmInner {
    fn drop(&mut self) {
        if let Err(e) = self.backend.free(self.alloc) {
            tracing::warn!("device allocation free failed: {}", e);
        }
    }
}

/// Shared handle to one device allocation, freed when the last clone drops
#[derive(Clone)]
pub struct UsmAlloc {
    inner: Arc<UsmInner>,
}

impl UsmAlloc {
    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn device(&self) -> u32 {
        self.inner.device
    }

    pub(crate) fn handle(&self) -> DeviceAlloc {
        self.inner.alloc
    }

    pub(crate) fn check_range(&self, offset: usize, size: usize) -> HalResult<()> {
        let end = offset
            .checked_add(size)
            .ok_or_else(|| HalError::InvalidValue("offset + size overflows".into()))?;
        if size == 0 {
            return Err(HalError::InvalidValue("zero-size access".into()));
        }
        if end > self.inner.size {
            return Err(HalError::InvalidValue(format!(
                "access [{}, {}) exceeds allocation size {}",
                offset, end, self.inner.size
            )));
        }
        Ok(())
    }
}
