//! Native back-end capability seam
//!
//! The core scheduling logic (queues, event lifecycle, wait-list
//! construction, batching) is written once against [`NativeBackend`] and
//! never branches on back-end identity. A back-end exposes ordered execution
//! streams, point-in-time completion events, device allocations, and an
//! append/submit command model: commands appended to a stream form an open
//! batch that becomes visible to the device only on [`NativeBackend::submit`].
//!
//! Handles are opaque integers, not raw pointers, so the dedup and pool
//! algorithms stay independent of the native representation.

pub mod cpu;
#[cfg(feature = "rocm")]
pub mod hip;
pub mod mock;

use crate::error::HalResult;

/// Opaque identity of one native execution stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub(crate) u64);

impl StreamId {
    /// Raw identity value, used as an ordering key
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Opaque handle to one native synchronization primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeEvent(pub(crate) u64);

/// Opaque handle to one device memory allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAlloc(pub(crate) u64);

/// Opaque handle to a loaded kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelId(pub(crate) u64);

/// Raw host pointer carried inside commands.
///
/// SAFETY: HostPtr is Send+Sync because command execution is serialized per
/// stream and the enqueue layer guarantees the pointed-to memory outlives
/// the command (blocking calls synchronize before the borrow ends; deferred
/// writes go through staging memory retained by the completion event).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPtr(pub(crate) *mut u8);

unsafe impl Send for HostPtr {}
unsafe impl Sync for HostPtr {}

impl HostPtr {
    pub fn new(ptr: *mut u8) -> Self {
        HostPtr(ptr)
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0
    }
}

/// Kernel launch geometry (grid and block dimensions)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchGeometry {
    pub grid: [u32; 3],
    pub block: [u32; 3],
}

/// Memory residency hint appended as an ordered stream command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryHint {
    PrefetchToDevice { device: u32 },
    PrefetchToHost,
    AdviseReadMostly,
    AdvisePreferredLocation { device: u32 },
}

/// One unit of device work appended to a stream's open batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    CopyHostToDevice {
        dst: DeviceAlloc,
        dst_offset: usize,
        src: HostPtr,
        size: usize,
    },
    CopyDeviceToHost {
        dst: HostPtr,
        src: DeviceAlloc,
        src_offset: usize,
        size: usize,
    },
    CopyDeviceToDevice {
        dst: DeviceAlloc,
        dst_offset: usize,
        src: DeviceAlloc,
        src_offset: usize,
        size: usize,
    },
    /// Native fill; the pattern width must be a power of two. Wider or odd
    /// patterns are emulated by the enqueue layer with repeated copies.
    Fill {
        dst: DeviceAlloc,
        offset: usize,
        pattern: Vec<u8>,
        size: usize,
    },
    KernelLaunch {
        kernel: KernelId,
        geometry: LaunchGeometry,
    },
    /// Stream execution pauses until the event signals
    WaitEvent { event: NativeEvent },
    /// The event signals once every prior command in the stream completed
    RecordEvent { event: NativeEvent },
    MemoryHint {
        alloc: DeviceAlloc,
        offset: usize,
        size: usize,
        hint: MemoryHint,
    },
}

/// Static capabilities reported by a back-end.
#[derive(Debug, Clone, Copy)]
pub struct BackendCaps {
    /// Vendor wait-list length limit; dependencies beyond it must be
    /// resolved another way by the caller.
    pub max_wait_events: usize,
    /// The device exposes dedicated copy/transfer engines
    pub has_transfer_engine: bool,
    /// Host and device share physical memory (map can skip staging)
    pub integrated_memory: bool,
}

impl Default for BackendCaps {
    fn default() -> Self {
        BackendCaps {
            max_wait_events: usize::MAX,
            has_transfer_engine: true,
            integrated_memory: false,
        }
    }
}

/// Uniform interface over one vendor's native driver.
///
/// Streams are ordered FIFOs executing asynchronously relative to the host;
/// events are point-in-time completion markers bound to a stream position by
/// [`Command::RecordEvent`]. `append` extends a stream's open batch; the
/// batch reaches the device on `submit`. Back-ends with no explicit batching
/// cost may make `submit` a cheap no-op after eager dispatch.
pub trait NativeBackend: Send + Sync {
    /// Human-readable adapter name for diagnostics
    fn name(&self) -> &str;

    fn device_count(&self) -> u32;

    /// Whether `src_device` memory is directly readable from `dst_device`
    fn can_access_peer(&self, src_device: u32, dst_device: u32) -> bool;

    fn capabilities(&self) -> BackendCaps;

    /// `priority` follows the HIP/CUDA convention: lower values are more
    /// urgent, 0 is the default. Back-ends without priority scheduling may
    /// ignore it.
    fn create_stream(&self, device: u32, priority: i32) -> HalResult<StreamId>;

    fn destroy_stream(&self, stream: StreamId) -> HalResult<()>;

    /// Block the host until every submitted batch on the stream completed
    fn synchronize_stream(&self, stream: StreamId) -> HalResult<()>;

    /// Non-blocking: true if the stream has no submitted work in flight
    fn stream_idle(&self, stream: StreamId) -> HalResult<bool>;

    /// `timing` requests a timestamp capture on signal
    fn create_event(&self, timing: bool) -> HalResult<NativeEvent>;

    fn destroy_event(&self, event: NativeEvent) -> HalResult<()>;

    /// Non-blocking completion query
    fn query_event(&self, event: NativeEvent) -> HalResult<bool>;

    /// Block the host until the event signals
    fn wait_event(&self, event: NativeEvent) -> HalResult<()>;

    /// Nanosecond timestamp captured when the event signalled. Only valid
    /// for timing events that have completed.
    fn event_timestamp(&self, event: NativeEvent) -> HalResult<u64>;

    fn alloc(&self, device: u32, size: usize) -> HalResult<DeviceAlloc>;

    fn free(&self, alloc: DeviceAlloc) -> HalResult<()>;

    /// Stable host pointer aliasing a device allocation, when
    /// `capabilities().integrated_memory` holds. `None` otherwise.
    fn host_view(&self, alloc: DeviceAlloc) -> Option<HostPtr> {
        let _ = alloc;
        None
    }

    /// Extend the stream's open batch with one command
    fn append(&self, stream: StreamId, command: Command) -> HalResult<()>;

    /// Hand the open batch to the device. All-or-nothing: a failed submit
    /// leaves no partial batch behind.
    fn submit(&self, stream: StreamId) -> HalResult<()>;
}
