//! HIP FFI bindings
//!
//! FFI declarations below are bound to ROCm HIP API.
//! The dead_code allowance is needed because FFI symbols appear unused
//! to the compiler (they're only called through unsafe blocks).

use std::ffi::c_void;

#[link(name = "amdhip64")]
#[allow(dead_code)]
extern "C" {
    pub fn hipInit(flags: u32) -> i32;
    pub fn hipGetDeviceCount(count: *mut i32) -> i32;
    pub fn hipSetDevice(deviceId: i32) -> i32;
    pub fn hipDeviceCanAccessPeer(canAccess: *mut i32, device: i32, peerDevice: i32) -> i32;
    pub fn hipMalloc(ptr: *mut *mut c_void, size: usize) -> i32;
    pub fn hipFree(ptr: *mut c_void) -> i32;
    pub fn hipMemcpyAsync(
        dst: *mut c_void,
        src: *const c_void,
        count: usize,
        kind: i32,
        stream: *mut c_void,
    ) -> i32;
    pub fn hipMemsetD8Async(dst: *mut c_void, value: u8, count: usize, stream: *mut c_void) -> i32;
    pub fn hipStreamCreate(stream: *mut *mut c_void) -> i32;
    pub fn hipStreamCreateWithPriority(
        stream: *mut *mut c_void,
        flags: u32,
        priority: i32,
    ) -> i32;
    pub fn hipStreamDestroy(stream: *mut c_void) -> i32;
    pub fn hipStreamSynchronize(stream: *mut c_void) -> i32;
    pub fn hipStreamQuery(stream: *mut c_void) -> i32;
    pub fn hipStreamWaitEvent(stream: *mut c_void, event: *mut c_void, flags: u32) -> i32;
    pub fn hipEventCreateWithFlags(event: *mut *mut c_void, flags: u32) -> i32;
    pub fn hipEventDestroy(event: *mut c_void) -> i32;
    pub fn hipEventRecord(event: *mut c_void, stream: *mut c_void) -> i32;
    pub fn hipEventSynchronize(event: *mut c_void) -> i32;
    pub fn hipEventQuery(event: *mut c_void) -> i32;
    pub fn hipEventElapsedTime(ms: *mut f32, start: *mut c_void, end: *mut c_void) -> i32;
    pub fn hipModuleGetFunction(func: *mut *mut c_void, module: *mut c_void, name: *const i8) -> i32;
    pub fn hipModuleLaunchKernel(
        func: *mut c_void,
        gridDimX: u32,
        gridDimY: u32,
        gridDimZ: u32,
        blockDimX: u32,
        blockDimY: u32,
        blockDimZ: u32,
        sharedMemBytes: u32,
        stream: *mut c_void,
        kernelParams: *mut *mut c_void,
        extra: *mut *mut c_void,
    ) -> i32;
    pub fn hipGetErrorString(error: i32) -> *const i8;
    pub fn hipMemPrefetchAsync(
        ptr: *const c_void,
        count: usize,
        device: i32,
        stream: *mut c_void,
    ) -> i32;
}

/// HIP memory copy kinds
pub const HIP_MEMCPY_HOST_TO_DEVICE: i32 = 1;
pub const HIP_MEMCPY_DEVICE_TO_HOST: i32 = 2;
pub const HIP_MEMCPY_DEVICE_TO_DEVICE: i32 = 3;

/// HIP success code
pub const HIP_SUCCESS: i32 = 0;

/// hipStreamQuery / hipEventQuery "still running" code
pub const HIP_ERROR_NOT_READY: i32 = 600;

/// Default stream creation flag
pub const HIP_STREAM_DEFAULT: u32 = 0x0;

/// Default event creation flag (timing enabled)
pub const HIP_EVENT_DEFAULT: u32 = 0x0;

/// Event flag to disable timing data collection
pub const HIP_EVENT_DISABLE_TIMING: u32 = 0x1;
