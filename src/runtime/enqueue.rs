//! Client-facing enqueue operations
//!
//! Every operation follows the same shape: validate arguments, resolve the
//! event wait list into the minimal set of native waits, acquire a stream
//! from the right engine group, append the operation's commands to the
//! stream's open batch, record a completion event, and decide whether the
//! batch is submitted now or kept open. The shared path lives in
//! `submit_command`; each public method contributes only its own command
//! construction.

use std::sync::Arc;

use crate::config::TransferDirection;
use crate::error::{HalError, HalResult};
use crate::native::{Command, HostPtr, MemoryHint, NativeEvent, StreamId};
use crate::runtime::buffer::{Access, Buffer, MapRegion};
use crate::runtime::context::UsmAlloc;
use crate::runtime::event::{CommandType, Event};
use crate::runtime::kernel::{launch_geometry, Kernel};
use crate::runtime::queue::{Queue, QueueInner};
use crate::runtime::wait_list::latest_events;

/// 3D sub-region addressing for rectangular buffer operations.
///
/// A pitch of zero means tightly packed: `row_pitch = region[0]`,
/// `slice_pitch = row_pitch * region[1]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RectLayout {
    pub origin: [usize; 3],
    pub row_pitch: usize,
    pub slice_pitch: usize,
}

fn rect_pitches(region: [usize; 3], layout: RectLayout) -> HalResult<(usize, usize)> {
    if region.iter().any(|&r| r == 0) {
        return Err(HalError::InvalidImageSize(format!(
            "degenerate region {:?}",
            region
        )));
    }
    let row = if layout.row_pitch == 0 {
        region[0]
    } else {
        layout.row_pitch
    };
    if row < region[0] {
        return Err(HalError::InvalidImageSize(format!(
            "row pitch {} smaller than row width {}",
            row, region[0]
        )));
    }
    let slice = if layout.slice_pitch == 0 {
        row * region[1]
    } else {
        layout.slice_pitch
    };
    if slice < row * region[1] {
        return Err(HalError::InvalidImageSize(format!(
            "slice pitch {} smaller than slice extent {}",
            slice,
            row * region[1]
        )));
    }
    Ok((row, slice))
}

fn rect_base(layout: RectLayout, row: usize, slice: usize) -> usize {
    layout.origin[0] + layout.origin[1] * row + layout.origin[2] * slice
}

fn rect_span(region: [usize; 3], row: usize, slice: usize) -> usize {
    (region[2] - 1) * slice + (region[1] - 1) * row + region[0]
}

impl Queue {
    /// Shared enqueue path.
    ///
    /// `body` appends the operation's own commands to the chosen stream and
    /// returns any host staging memory the commands read asynchronously.
    fn submit_command<F>(
        &self,
        command: CommandType,
        direction: TransferDirection,
        blocking: bool,
        allow_batching: bool,
        wait_list: &[Event],
        body: F,
    ) -> HalResult<Event>
    where
        F: FnOnce(StreamId) -> HalResult<Vec<Box<[u8]>>>,
    {
        let backend = Arc::clone(self.inner.backend());
        for event in wait_list {
            if !event.backend_is(&backend) {
                return Err(HalError::InvalidEventWaitList(
                    "wait-list event belongs to a different adapter".into(),
                ));
            }
        }

        // Dependencies recorded on other queues must reach their device
        // before we insert device-side waits on them. This happens before
        // our own queue lock is taken, so two queues waiting on each other's
        // events cannot deadlock on lock order.
        let mut flushed: Vec<Arc<QueueInner>> = Vec::new();
        for event in wait_list {
            if let Some(owner) = event.owner() {
                if !event.owner_is(&self.inner)
                    && !flushed.iter().any(|q| Arc::ptr_eq(q, &owner))
                {
                    owner.flush_all()?;
                    flushed.push(owner);
                }
            }
        }

        let config = self.inner.config();
        let batch_limit = config.batch_limit;
        let wait_cap = config
            .max_wait_events
            .min(backend.capabilities().max_wait_events);
        let engine = config.select_engine(direction);
        let allow_batching = allow_batching && !blocking;

        let mut state = self.inner.state_write()?;
        let barrier = state.barrier.clone();

        let (index, stream) = {
            let pool = state.pool_mut(engine);
            let index = pool.acquire(allow_batching, &*backend)?;
            (index, pool.stream(index))
        };

        if !wait_list.is_empty() {
            let mut native_waits: Vec<NativeEvent> = Vec::new();
            for event in latest_events(wait_list)? {
                // FIFO already orders us after anything on our own stream.
                if event.owner_is(&self.inner) && event.stream_id() == Some(stream) {
                    continue;
                }
                if !event.is_recorded() {
                    return Err(HalError::InvalidEventWaitList(
                        "dependency event was never recorded".into(),
                    ));
                }
                // A sibling stream's record instruction may still sit in an
                // open batch; submit it so the device-side wait can resolve.
                if event.owner_is(&self.inner) {
                    if let Some(dep_stream) = event.stream_id() {
                        state.flush_stream(dep_stream, &*backend)?;
                    }
                }
                if native_waits.len() < wait_cap {
                    native_waits.push(event.native_end());
                } else {
                    // Past the vendor cap the dependency is resolved on the
                    // host instead of silently dropped.
                    event.wait_recorded()?;
                }
            }
            for native in native_waits {
                backend.append(stream, Command::WaitEvent { event: native })?;
            }
        }

        if let Some(barrier) = barrier {
            state
                .pool_mut(engine)
                .apply_barrier_if_needed(index, barrier.native_end(), &*backend)?;
        }

        let event = Event::new_native(&self.inner, command, stream)?;
        event.start()?;

        let staging = body(stream)?;
        event.record()?;
        for buf in staging {
            event.attach_staging(buf);
        }

        {
            let pool = state.pool_mut(engine);
            pool.note_appended(index, 1);
            pool.execute(index, blocking, allow_batching, batch_limit, &*backend)?;
        }
        drop(state);

        if blocking {
            event.wait_recorded()?;
        }
        tracing::trace!(command = ?command, blocking, "command enqueued");
        Ok(event)
    }

    /// Read `dst.len()` bytes from the buffer at `offset`.
    ///
    /// The destination borrow ends when this call returns, so reads always
    /// run to completion regardless of `blocking`.
    pub fn enqueue_read(
        &self,
        buffer: &Buffer,
        blocking: bool,
        offset: usize,
        dst: &mut [u8],
        wait_list: &[Event],
    ) -> HalResult<Event> {
        let _ = blocking;
        buffer.check_backend(self.inner.backend())?;
        buffer.check_range(offset, dst.len())?;
        let size = dst.len();
        let ptr = HostPtr::new(dst.as_mut_ptr());
        let device = self.device();
        let backend = Arc::clone(self.inner.backend());
        self.submit_command(
            CommandType::BufferRead,
            TransferDirection::DeviceToHost,
            true,
            false,
            wait_list,
            |stream| {
                let (alloc, _, staging) = buffer.resolve(device, Access::Read, stream)?;
                backend.append(
                    stream,
                    Command::CopyDeviceToHost {
                        dst: ptr,
                        src: alloc,
                        src_offset: offset,
                        size,
                    },
                )?;
                Ok(staging)
            },
        )
    }

    /// Write `src` into the buffer at `offset`. A non-blocking write copies
    /// `src` into staging retained until the command completes.
    pub fn enqueue_write(
        &self,
        buffer: &Buffer,
        blocking: bool,
        offset: usize,
        src: &[u8],
        wait_list: &[Event],
    ) -> HalResult<Event> {
        buffer.check_backend(self.inner.backend())?;
        buffer.check_range(offset, src.len())?;
        let size = src.len();
        let device = self.device();
        let backend = Arc::clone(self.inner.backend());
        let access = if offset == 0 && size == buffer.size() {
            Access::Write
        } else {
            // A partial write needs the surrounding bytes valid first.
            Access::ReadWrite
        };
        let mut stage: Option<Box<[u8]>> = if blocking {
            None
        } else {
            Some(src.to_vec().into_boxed_slice())
        };
        let ptr = match stage.as_mut() {
            Some(boxed) => HostPtr::new(boxed.as_mut_ptr()),
            None => HostPtr::new(src.as_ptr() as *mut u8),
        };
        self.submit_command(
            CommandType::BufferWrite,
            TransferDirection::HostToDevice,
            blocking,
            !blocking,
            wait_list,
            |stream| {
                let (alloc, _, mut staging) = buffer.resolve(device, access, stream)?;
                backend.append(
                    stream,
                    Command::CopyHostToDevice {
                        dst: alloc,
                        dst_offset: offset,
                        src: ptr,
                        size,
                    },
                )?;
                if let Some(boxed) = stage.take() {
                    staging.push(boxed);
                }
                Ok(staging)
            },
        )
    }

    /// Rectangular read of `region` bytes rows-by-row. Always runs to
    /// completion (the destination borrow ends at return).
    pub fn enqueue_read_rect(
        &self,
        buffer: &Buffer,
        region: [usize; 3],
        buffer_layout: RectLayout,
        host_layout: RectLayout,
        dst: &mut [u8],
        wait_list: &[Event],
    ) -> HalResult<Event> {
        let (buf_row, buf_slice) = rect_pitches(region, buffer_layout)?;
        let (host_row, host_slice) = rect_pitches(region, host_layout)?;
        let buf_base = rect_base(buffer_layout, buf_row, buf_slice);
        let host_base = rect_base(host_layout, host_row, host_slice);
        buffer.check_backend(self.inner.backend())?;
        buffer.check_range(buf_base, rect_span(region, buf_row, buf_slice))?;
        if host_base + rect_span(region, host_row, host_slice) > dst.len() {
            return Err(HalError::InvalidValue(
                "host region exceeds destination slice".into(),
            ));
        }
        let device = self.device();
        let backend = Arc::clone(self.inner.backend());
        let host_ptr = dst.as_mut_ptr();
        self.submit_command(
            CommandType::BufferRead,
            TransferDirection::DeviceToHost,
            true,
            false,
            wait_list,
            |stream| {
                let (alloc, _, staging) = buffer.resolve(device, Access::Read, stream)?;
                for z in 0..region[2] {
                    for y in 0..region[1] {
                        let src_offset = buf_base + y * buf_row + z * buf_slice;
                        let dst_offset = host_base + y * host_row + z * host_slice;
                        backend.append(
                            stream,
                            Command::CopyDeviceToHost {
                                // SAFETY: dst_offset + region[0] was bounds
                                // checked against dst.len() above.
                                dst: HostPtr::new(unsafe { host_ptr.add(dst_offset) }),
                                src: alloc,
                                src_offset,
                                size: region[0],
                            },
                        )?;
                    }
                }
                Ok(staging)
            },
        )
    }

    /// Rectangular write of `region` bytes row-by-row
    pub fn enqueue_write_rect(
        &self,
        buffer: &Buffer,
        blocking: bool,
        region: [usize; 3],
        buffer_layout: RectLayout,
        host_layout: RectLayout,
        src: &[u8],
        wait_list: &[Event],
    ) -> HalResult<Event> {
        let (buf_row, buf_slice) = rect_pitches(region, buffer_layout)?;
        let (host_row, host_slice) = rect_pitches(region, host_layout)?;
        let buf_base = rect_base(buffer_layout, buf_row, buf_slice);
        let host_base = rect_base(host_layout, host_row, host_slice);
        buffer.check_backend(self.inner.backend())?;
        buffer.check_range(buf_base, rect_span(region, buf_row, buf_slice))?;
        if host_base + rect_span(region, host_row, host_slice) > src.len() {
            return Err(HalError::InvalidValue(
                "host region exceeds source slice".into(),
            ));
        }
        let device = self.device();
        let backend = Arc::clone(self.inner.backend());
        let mut stage: Option<Box<[u8]>> = if blocking {
            None
        } else {
            Some(src.to_vec().into_boxed_slice())
        };
        let host_ptr = match stage.as_mut() {
            Some(boxed) => boxed.as_mut_ptr(),
            None => src.as_ptr() as *mut u8,
        };
        self.submit_command(
            CommandType::BufferWrite,
            TransferDirection::HostToDevice,
            blocking,
            false,
            wait_list,
            |stream| {
                let (alloc, _, mut staging) =
                    buffer.resolve(device, Access::ReadWrite, stream)?;
                for z in 0..region[2] {
                    for y in 0..region[1] {
                        let dst_offset = buf_base + y * buf_row + z * buf_slice;
                        let src_offset = host_base + y * host_row + z * host_slice;
                        backend.append(
                            stream,
                            Command::CopyHostToDevice {
                                dst: alloc,
                                dst_offset,
                                // SAFETY: src_offset + region[0] was bounds
                                // checked against src.len() above.
                                src: HostPtr::new(unsafe { host_ptr.add(src_offset) }),
                                size: region[0],
                            },
                        )?;
                    }
                }
                if let Some(boxed) = stage.take() {
                    staging.push(boxed);
                }
                Ok(staging)
            },
        )
    }

    /// Device-side copy between two buffers (or two ranges of one buffer)
    pub fn enqueue_copy(
        &self,
        src: &Buffer,
        dst: &Buffer,
        src_offset: usize,
        dst_offset: usize,
        size: usize,
        wait_list: &[Event],
    ) -> HalResult<Event> {
        src.check_backend(self.inner.backend())?;
        dst.check_backend(self.inner.backend())?;
        src.check_range(src_offset, size)?;
        dst.check_range(dst_offset, size)?;
        if Arc::ptr_eq(&src.inner, &dst.inner) {
            let disjoint = src_offset + size <= dst_offset || dst_offset + size <= src_offset;
            if !disjoint {
                return Err(HalError::InvalidValue(
                    "overlapping copy within one buffer".into(),
                ));
            }
        }
        let device = self.device();
        let backend = Arc::clone(self.inner.backend());
        let dst_access = if dst_offset == 0 && size == dst.size() {
            Access::Write
        } else {
            Access::ReadWrite
        };
        self.submit_command(
            CommandType::BufferCopy,
            TransferDirection::DeviceToDevice,
            false,
            true,
            wait_list,
            |stream| {
                let (src_alloc, _, mut staging) = src.resolve(device, Access::Read, stream)?;
                let (dst_alloc, _, more) = dst.resolve(device, dst_access, stream)?;
                staging.extend(more);
                backend.append(
                    stream,
                    Command::CopyDeviceToDevice {
                        dst: dst_alloc,
                        dst_offset,
                        src: src_alloc,
                        src_offset,
                        size,
                    },
                )?;
                Ok(staging)
            },
        )
    }

    /// Rectangular device-side copy, row-by-row
    pub fn enqueue_copy_rect(
        &self,
        src: &Buffer,
        dst: &Buffer,
        region: [usize; 3],
        src_layout: RectLayout,
        dst_layout: RectLayout,
        wait_list: &[Event],
    ) -> HalResult<Event> {
        let (src_row, src_slice) = rect_pitches(region, src_layout)?;
        let (dst_row, dst_slice) = rect_pitches(region, dst_layout)?;
        let src_base = rect_base(src_layout, src_row, src_slice);
        let dst_base = rect_base(dst_layout, dst_row, dst_slice);
        src.check_backend(self.inner.backend())?;
        dst.check_backend(self.inner.backend())?;
        src.check_range(src_base, rect_span(region, src_row, src_slice))?;
        dst.check_range(dst_base, rect_span(region, dst_row, dst_slice))?;
        if Arc::ptr_eq(&src.inner, &dst.inner) {
            return Err(HalError::InvalidValue(
                "rectangular copy within one buffer is not supported".into(),
            ));
        }
        let device = self.device();
        let backend = Arc::clone(self.inner.backend());
        self.submit_command(
            CommandType::BufferCopy,
            TransferDirection::DeviceToDevice,
            false,
            true,
            wait_list,
            |stream| {
                let (src_alloc, _, mut staging) = src.resolve(device, Access::Read, stream)?;
                let (dst_alloc, _, more) = dst.resolve(device, Access::ReadWrite, stream)?;
                staging.extend(more);
                for z in 0..region[2] {
                    for y in 0..region[1] {
                        backend.append(
                            stream,
                            Command::CopyDeviceToDevice {
                                dst: dst_alloc,
                                dst_offset: dst_base + y * dst_row + z * dst_slice,
                                src: src_alloc,
                                src_offset: src_base + y * src_row + z * src_slice,
                                size: region[0],
                            },
                        )?;
                    }
                }
                Ok(staging)
            },
        )
    }

    /// Fill `size` bytes at `offset` with a repeating pattern.
    ///
    /// The pattern length must divide `size`. Native fill instructions take
    /// power-of-two pattern widths only; other widths are emulated with
    /// repeated copies of the pattern, which produces an identical byte
    /// sequence.
    pub fn enqueue_fill(
        &self,
        buffer: &Buffer,
        pattern: &[u8],
        offset: usize,
        size: usize,
        wait_list: &[Event],
    ) -> HalResult<Event> {
        validate_fill(pattern, size)?;
        buffer.check_backend(self.inner.backend())?;
        buffer.check_range(offset, size)?;
        let device = self.device();
        let backend = Arc::clone(self.inner.backend());
        let access = if offset == 0 && size == buffer.size() {
            Access::Write
        } else {
            Access::ReadWrite
        };
        let pattern_vec = pattern.to_vec();
        self.submit_command(
            CommandType::BufferFill,
            TransferDirection::None,
            false,
            true,
            wait_list,
            |stream| {
                let (alloc, _, mut staging) = buffer.resolve(device, access, stream)?;
                staging.extend(append_fill(
                    &*backend,
                    stream,
                    alloc,
                    offset,
                    pattern_vec,
                    size,
                )?);
                Ok(staging)
            },
        )
    }

    /// Map a byte range for host access.
    ///
    /// Integrated-memory devices return a pointer aliasing device memory
    /// directly; discrete devices return a host staging region filled with
    /// the current contents. Double-mapping bytes already covered by an
    /// active mapping is rejected.
    pub fn enqueue_map(
        &self,
        buffer: &Buffer,
        write: bool,
        offset: usize,
        size: usize,
        wait_list: &[Event],
    ) -> HalResult<(Event, *mut u8)> {
        buffer.check_backend(self.inner.backend())?;
        buffer.check_range(offset, size)?;
        buffer.ensure_unmapped(offset, size)?;
        let device = self.device();
        let backend = Arc::clone(self.inner.backend());
        let integrated = backend.capabilities().integrated_memory;
        let access = if write { Access::ReadWrite } else { Access::Read };

        let mut direct: Option<*mut u8> = None;
        let mut stage: Option<Box<[u8]>> = None;
        let event = self.submit_command(
            CommandType::BufferMap,
            TransferDirection::DeviceToHost,
            true,
            false,
            wait_list,
            |stream| {
                let (alloc, _, staging) = buffer.resolve(device, access, stream)?;
                if integrated {
                    if let Some(view) = backend.host_view(alloc) {
                        // SAFETY: offset < buffer size was checked above and
                        // the view covers the whole allocation.
                        direct = Some(unsafe { view.as_ptr().add(offset) });
                        return Ok(staging);
                    }
                }
                let mut boxed = vec![0u8; size].into_boxed_slice();
                backend.append(
                    stream,
                    Command::CopyDeviceToHost {
                        dst: HostPtr::new(boxed.as_mut_ptr()),
                        src: alloc,
                        src_offset: offset,
                        size,
                    },
                )?;
                stage = Some(boxed);
                Ok(staging)
            },
        )?;

        let ptr = match (direct, stage) {
            (Some(ptr), _) => {
                buffer.register_map(
                    ptr as usize,
                    MapRegion {
                        offset,
                        size,
                        write,
                        staging: None,
                    },
                )?;
                ptr
            }
            (None, Some(mut boxed)) => {
                let ptr = boxed.as_mut_ptr();
                buffer.register_map(
                    ptr as usize,
                    MapRegion {
                        offset,
                        size,
                        write,
                        staging: Some(boxed),
                    },
                )?;
                ptr
            }
            (None, None) => {
                return Err(HalError::Unknown);
            }
        };
        Ok((event, ptr))
    }

    /// Release a mapping created by [`enqueue_map`](Self::enqueue_map).
    ///
    /// A writable staged mapping copies its contents back to the device; the
    /// staging memory stays alive until the copy completes.
    pub fn enqueue_unmap(
        &self,
        buffer: &Buffer,
        ptr: *mut u8,
        wait_list: &[Event],
    ) -> HalResult<Event> {
        buffer.check_backend(self.inner.backend())?;
        let region = buffer.take_map(ptr as usize)?;
        let device = self.device();
        let backend = Arc::clone(self.inner.backend());
        self.submit_command(
            CommandType::BufferUnmap,
            TransferDirection::HostToDevice,
            false,
            false,
            wait_list,
            move |stream| match region.staging {
                Some(mut boxed) if region.write => {
                    let (alloc, _, mut staging) =
                        buffer.resolve(device, Access::ReadWrite, stream)?;
                    backend.append(
                        stream,
                        Command::CopyHostToDevice {
                            dst: alloc,
                            dst_offset: region.offset,
                            src: HostPtr::new(boxed.as_mut_ptr()),
                            size: region.size,
                        },
                    )?;
                    staging.push(boxed);
                    Ok(staging)
                }
                // Read-only staged mapping, or integrated memory where the
                // bytes were written in place.
                _ => Ok(Vec::new()),
            },
        )
    }

    /// Copy between two device allocations
    pub fn enqueue_usm_memcpy(
        &self,
        blocking: bool,
        dst: &UsmAlloc,
        dst_offset: usize,
        src: &UsmAlloc,
        src_offset: usize,
        size: usize,
        wait_list: &[Event],
    ) -> HalResult<Event> {
        dst.check_range(dst_offset, size)?;
        src.check_range(src_offset, size)?;
        let backend = Arc::clone(self.inner.backend());
        let dst_handle = dst.handle();
        let src_handle = src.handle();
        self.submit_command(
            CommandType::UsmMemcpy,
            TransferDirection::DeviceToDevice,
            blocking,
            !blocking,
            wait_list,
            |stream| {
                backend.append(
                    stream,
                    Command::CopyDeviceToDevice {
                        dst: dst_handle,
                        dst_offset,
                        src: src_handle,
                        src_offset,
                        size,
                    },
                )?;
                Ok(Vec::new())
            },
        )
    }

    /// Pattern fill of a device allocation; same pattern rules as
    /// [`enqueue_fill`](Self::enqueue_fill).
    pub fn enqueue_usm_fill(
        &self,
        dst: &UsmAlloc,
        pattern: &[u8],
        offset: usize,
        size: usize,
        wait_list: &[Event],
    ) -> HalResult<Event> {
        validate_fill(pattern, size)?;
        dst.check_range(offset, size)?;
        let backend = Arc::clone(self.inner.backend());
        let handle = dst.handle();
        let pattern_vec = pattern.to_vec();
        self.submit_command(
            CommandType::UsmFill,
            TransferDirection::None,
            false,
            true,
            wait_list,
            |stream| append_fill(&*backend, stream, handle, offset, pattern_vec, size),
        )
    }

    /// Hint that a range will be used on a device (or back on the host)
    pub fn enqueue_usm_prefetch(
        &self,
        alloc: &UsmAlloc,
        offset: usize,
        size: usize,
        to_device: Option<u32>,
        wait_list: &[Event],
    ) -> HalResult<Event> {
        alloc.check_range(offset, size)?;
        let backend = Arc::clone(self.inner.backend());
        let handle = alloc.handle();
        let hint = match to_device {
            Some(device) => MemoryHint::PrefetchToDevice { device },
            None => MemoryHint::PrefetchToHost,
        };
        self.submit_command(
            CommandType::UsmPrefetch,
            TransferDirection::None,
            false,
            true,
            wait_list,
            |stream| {
                backend.append(
                    stream,
                    Command::MemoryHint {
                        alloc: handle,
                        offset,
                        size,
                        hint,
                    },
                )?;
                Ok(Vec::new())
            },
        )
    }

    /// Advise the driver about a range's access pattern
    pub fn enqueue_usm_advise(
        &self,
        alloc: &UsmAlloc,
        offset: usize,
        size: usize,
        hint: MemoryHint,
        wait_list: &[Event],
    ) -> HalResult<Event> {
        alloc.check_range(offset, size)?;
        let backend = Arc::clone(self.inner.backend());
        let handle = alloc.handle();
        self.submit_command(
            CommandType::UsmAdvise,
            TransferDirection::None,
            false,
            true,
            wait_list,
            |stream| {
                backend.append(
                    stream,
                    Command::MemoryHint {
                        alloc: handle,
                        offset,
                        size,
                        hint,
                    },
                )?;
                Ok(Vec::new())
            },
        )
    }

    /// Launch a kernel over an ND-range.
    ///
    /// When indirect access tracking is on, launches submit eagerly instead
    /// of batching: a kernel reaching allocations not passed as arguments
    /// must see every previously appended memory command on the device.
    pub fn enqueue_kernel(
        &self,
        kernel: &Kernel,
        work_dim: u32,
        global: [usize; 3],
        local: Option<[usize; 3]>,
        wait_list: &[Event],
    ) -> HalResult<Event> {
        let geometry = launch_geometry(work_dim, global, local)?;
        let backend = Arc::clone(self.inner.backend());
        let id = kernel.id;
        let batchable = !self.inner.config().track_indirect_access;
        self.submit_command(
            CommandType::KernelLaunch,
            TransferDirection::None,
            false,
            batchable,
            wait_list,
            |stream| {
                backend.append(
                    stream,
                    Command::KernelLaunch {
                        kernel: id,
                        geometry,
                    },
                )?;
                Ok(Vec::new())
            },
        )
    }

    /// Record an event whose profiling timestamps are valid even on a queue
    /// created without profiling.
    pub fn enqueue_timestamp(&self, wait_list: &[Event]) -> HalResult<Event> {
        self.submit_command(
            CommandType::TimestampRecord,
            TransferDirection::None,
            false,
            false,
            wait_list,
            |_stream| Ok(Vec::new()),
        )
    }

    /// Insert an execution barrier.
    ///
    /// With a wait list, later commands on any of this queue's streams
    /// execute only after every listed event. With an empty wait list, they
    /// execute only after everything previously enqueued on this queue. The
    /// wait-on-barrier instruction is appended lazily, at most once per
    /// stream, by subsequent enqueues.
    pub fn enqueue_barrier(&self, wait_list: &[Event]) -> HalResult<Event> {
        let backend = Arc::clone(self.inner.backend());
        for event in wait_list {
            if !event.backend_is(&backend) {
                return Err(HalError::InvalidEventWaitList(
                    "wait-list event belongs to a different adapter".into(),
                ));
            }
        }
        let mut flushed: Vec<Arc<QueueInner>> = Vec::new();
        for event in wait_list {
            if let Some(owner) = event.owner() {
                if !event.owner_is(&self.inner)
                    && !flushed.iter().any(|q| Arc::ptr_eq(q, &owner))
                {
                    owner.flush_all()?;
                    flushed.push(owner);
                }
            }
        }

        let config = self.inner.config();
        let batch_limit = config.batch_limit;
        let wait_cap = config
            .max_wait_events
            .min(backend.capabilities().max_wait_events);

        let mut state = self.inner.state_write()?;
        let (index, stream) = {
            let pool = &mut state.compute;
            let index = pool.acquire(false, &*backend)?;
            (index, pool.stream(index))
        };

        let mut aux: Vec<NativeEvent> = Vec::new();
        if wait_list.is_empty() {
            // Order after all prior work: a marker is recorded on every
            // other stream and the barrier stream waits on each.
            let mut others: Vec<StreamId> = state.compute.streams();
            if let Some(transfer) = state.transfer.as_ref() {
                others.extend(transfer.streams());
            }
            others.retain(|&s| s != stream);
            for other in others {
                state.flush_stream(other, &*backend)?;
                let marker = backend.create_event(false)?;
                backend.append(other, Command::RecordEvent { event: marker })?;
                backend.submit(other)?;
                backend.append(stream, Command::WaitEvent { event: marker })?;
                aux.push(marker);
            }
        } else {
            let mut native_waits: Vec<NativeEvent> = Vec::new();
            for event in latest_events(wait_list)? {
                if event.owner_is(&self.inner) && event.stream_id() == Some(stream) {
                    continue;
                }
                if !event.is_recorded() {
                    return Err(HalError::InvalidEventWaitList(
                        "dependency event was never recorded".into(),
                    ));
                }
                if event.owner_is(&self.inner) {
                    if let Some(dep_stream) = event.stream_id() {
                        state.flush_stream(dep_stream, &*backend)?;
                    }
                }
                if native_waits.len() < wait_cap {
                    native_waits.push(event.native_end());
                } else {
                    event.wait_recorded()?;
                }
            }
            for native in native_waits {
                backend.append(stream, Command::WaitEvent { event: native })?;
            }
        }

        let event = Event::new_native(&self.inner, CommandType::Barrier, stream)?;
        event.record()?;
        for marker in aux {
            event.attach_aux_event(marker);
        }
        state.compute.note_appended(index, 1);
        // The barrier's record instruction must be visible before any other
        // stream waits on it.
        state
            .compute
            .execute(index, false, false, batch_limit, &*backend)?;
        state.compute.reset_barrier_flags(Some(stream));
        if let Some(transfer) = state.transfer.as_mut() {
            transfer.reset_barrier_flags(None);
        }
        state.barrier = Some(event.clone());
        tracing::debug!(waits = wait_list.len(), "barrier enqueued");
        Ok(event)
    }
}

fn validate_fill(pattern: &[u8], size: usize) -> HalResult<()> {
    if pattern.is_empty() {
        return Err(HalError::InvalidValue("empty fill pattern".into()));
    }
    if pattern.len() > size || size % pattern.len() != 0 {
        return Err(HalError::InvalidValue(format!(
            "pattern size {} must divide fill size {}",
            pattern.len(),
            size
        )));
    }
    Ok(())
}

/// Append the commands realizing a pattern fill, returning staging for the
/// emulated path.
fn append_fill(
    backend: &dyn crate::native::NativeBackend,
    stream: StreamId,
    dst: crate::native::DeviceAlloc,
    offset: usize,
    pattern: Vec<u8>,
    size: usize,
) -> HalResult<Vec<Box<[u8]>>> {
    if pattern.len().is_power_of_two() {
        backend.append(
            stream,
            Command::Fill {
                dst,
                offset,
                pattern,
                size,
            },
        )?;
        return Ok(Vec::new());
    }
    let mut boxed = pattern.into_boxed_slice();
    let len = boxed.len();
    let ptr = HostPtr::new(boxed.as_mut_ptr());
    for i in 0..size / len {
        backend.append(
            stream,
            Command::CopyHostToDevice {
                dst,
                dst_offset: offset + i * len,
                src: ptr,
                size: len,
            },
        )?;
    }
    Ok(vec![boxed])
}
