//! Multi-device buffer with lazy allocation and migration
//!
//! A buffer is one logical byte range with at most one device copy marked
//! valid for writing at a time. Device allocations are created lazily on
//! first use per device. When an access needs the bytes on a device that
//! holds no valid copy, migration commands are appended to the caller's
//! stream: a direct peer copy when the devices can reach each other,
//! otherwise a bounce through pinned host staging. Both paths ride the same
//! stream as the access that triggered them, so FIFO ordering makes the
//! migration safe without an extra synchronization point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{HalError, HalResult};
use crate::native::{Command, DeviceAlloc, HostPtr, NativeBackend, StreamId};

/// How an enqueue operation touches the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    fn reads(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    fn writes(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

pub(crate) struct MapRegion {
    pub offset: usize,
    pub size: usize,
    pub write: bool,
    /// Host staging backing the mapped pointer; `None` when the mapping
    /// aliases integrated memory directly.
    pub staging: Option<Box<[u8]>>,
}

struct BufferState {
    /// Per-device allocation, indexed by device ordinal
    allocs: Vec<Option<DeviceAlloc>>,
    /// Which device copies currently hold the bytes
    valid: Vec<bool>,
    /// Device whose copy a migration should source from
    last_valid: Option<u32>,
    /// Active mapped regions keyed by the host pointer handed out
    maps: HashMap<usize, MapRegion>,
}

pub(crate) struct BufferInner {
    size: usize,
    backend: Arc<dyn NativeBackend>,
    state: Mutex<BufferState>,
}

/// Context-scoped memory object usable from any device in the context
#[derive(Clone)]
pub struct Buffer {
    pub(crate) inner: Arc<BufferInner>,
}

impl Buffer {
    pub(crate) fn create(backend: Arc<dyn NativeBackend>, size: usize) -> HalResult<Buffer> {
        if size == 0 {
            return Err(HalError::InvalidValue("buffer size must be non-zero".into()));
        }
        let devices = backend.device_count() as usize;
        Ok(Buffer {
            inner: Arc::new(BufferInner {
                size,
                backend,
                state: Mutex::new(BufferState {
                    allocs: vec![None; devices],
                    valid: vec![false; devices],
                    last_valid: None,
                    maps: HashMap::new(),
                }),
            }),
        })
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Reject buffers created by a different adapter
    pub(crate) fn check_backend(&self, backend: &Arc<dyn NativeBackend>) -> HalResult<()> {
        if !Arc::ptr_eq(&self.inner.backend, backend) {
            return Err(HalError::InvalidMemObject(
                "buffer belongs to a different adapter".into(),
            ));
        }
        Ok(())
    }

    /// Bounds-check a sub-range of the buffer
    pub(crate) fn check_range(&self, offset: usize, size: usize) -> HalResult<()> {
        let end = offset
            .checked_add(size)
            .ok_or_else(|| HalError::InvalidValue("offset + size overflows".into()))?;
        if size == 0 {
            return Err(HalError::InvalidValue("zero-size buffer access".into()));
        }
        if end > self.inner.size {
            return Err(HalError::InvalidValue(format!(
                "access [{}, {}) exceeds buffer size {}",
                offset, end, self.inner.size
            )));
        }
        Ok(())
    }

    /// Make the buffer's bytes resident and valid on `device`, appending any
    /// migration commands to `stream`.
    ///
    /// Returns the device allocation, the number of commands appended, and
    /// host staging the caller must keep alive until those commands
    /// complete.
    pub(crate) fn resolve(
        &self,
        device: u32,
        access: Access,
        stream: StreamId,
    ) -> HalResult<(DeviceAlloc, usize, Vec<Box<[u8]>>)> {
        let backend = &self.inner.backend;
        let mut state = self.inner.state.lock()?;
        let index = device as usize;
        if index >= state.allocs.len() {
            return Err(HalError::InvalidValue(format!(
                "device ordinal {} out of range",
                device
            )));
        }

        let alloc = match state.allocs[index] {
            Some(alloc) => alloc,
            None => {
                let alloc = backend.alloc(device, self.inner.size).map_err(|e| {
                    HalError::OutOfResources(format!("buffer allocation failed: {}", e))
                })?;
                state.allocs[index] = Some(alloc);
                alloc
            }
        };

        let mut appended = 0usize;
        let mut staging: Vec<Box<[u8]>> = Vec::new();

        if access.reads() && !state.valid[index] {
            if let Some(src_device) = state.last_valid {
                let src = state.allocs[src_device as usize].ok_or_else(|| {
                    HalError::InvalidMemObject("valid device copy has no allocation".into())
                })?;
                if backend.can_access_peer(src_device, device) {
                    backend.append(
                        stream,
                        Command::CopyDeviceToDevice {
                            dst: alloc,
                            dst_offset: 0,
                            src,
                            src_offset: 0,
                            size: self.inner.size,
                        },
                    )?;
                    appended += 1;
                    tracing::trace!(
                        from = src_device,
                        to = device,
                        size = self.inner.size,
                        "peer migration"
                    );
                } else {
                    let mut bounce = vec![0u8; self.inner.size].into_boxed_slice();
                    let ptr = HostPtr::new(bounce.as_mut_ptr());
                    backend.append(
                        stream,
                        Command::CopyDeviceToHost {
                            dst: ptr,
                            src,
                            src_offset: 0,
                            size: self.inner.size,
                        },
                    )?;
                    backend.append(
                        stream,
                        Command::CopyHostToDevice {
                            dst: alloc,
                            dst_offset: 0,
                            src: ptr,
                            size: self.inner.size,
                        },
                    )?;
                    appended += 2;
                    staging.push(bounce);
                    tracing::trace!(
                        from = src_device,
                        to = device,
                        size = self.inner.size,
                        "host-staged migration"
                    );
                }
            }
        }

        state.valid[index] = true;
        if access.writes() {
            for (i, valid) in state.valid.iter_mut().enumerate() {
                *valid = i == index;
            }
        }
        state.last_valid = Some(device);
        Ok((alloc, appended, staging))
    }

    /// Reject a double-mapping of bytes already covered by an active region
    pub(crate) fn ensure_unmapped(&self, offset: usize, size: usize) -> HalResult<()> {
        let state = self.inner.state.lock()?;
        for existing in state.maps.values() {
            let disjoint =
                offset + size <= existing.offset || existing.offset + existing.size <= offset;
            if !disjoint {
                return Err(HalError::InvalidOperation(
                    "map region overlaps an existing mapping".into(),
                ));
            }
        }
        Ok(())
    }

    /// Register a mapped region; rejects overlap with any active mapping.
    /// The overlap check and the insert run under one lock acquisition so
    /// two racing maps of the same bytes cannot both pass.
    pub(crate) fn register_map(&self, key: usize, region: MapRegion) -> HalResult<()> {
        let mut state = self.inner.state.lock()?;
        for existing in state.maps.values() {
            let disjoint = region.offset + region.size <= existing.offset
                || existing.offset + existing.size <= region.offset;
            if !disjoint {
                return Err(HalError::InvalidOperation(
                    "map region overlaps an existing mapping".into(),
                ));
            }
        }
        state.maps.insert(key, region);
        Ok(())
    }

    /// Remove a mapping by the pointer it handed out
    pub(crate) fn take_map(&self, key: usize) -> HalResult<MapRegion> {
        let mut state = self.inner.state.lock()?;
        state.maps.remove(&key).ok_or_else(|| {
            HalError::InvalidValue("unmap pointer does not match an active mapping".into())
        })
    }
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let state = match state {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        for alloc in state.allocs.iter().flatten() {
            if let Err(e) = self.backend.free(*alloc) {
                tracing::warn!("device allocation free failed: {}", e);
            }
        }
    }
}
