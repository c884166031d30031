//! StreamForge - uniform device-compute runtime
//!
//! One client API for queues, memory, events and kernel launches over
//! pluggable native back-ends (HIP/ROCm, native CPU, a counting test
//! double). The backend-independent core maps unbounded event dependencies
//! onto bounded native wait lists, rotates bounded stream pools, batches
//! commands into open native submissions, and keeps one ownership story for
//! native synchronization primitives shared by many client handles.

#![allow(clippy::too_many_arguments)] // Enqueue entry points mirror wide native signatures
#![allow(clippy::type_complexity)]

pub mod config;
pub mod error;
pub mod logging;
pub mod native;
pub mod runtime;

pub use config::{
    default_engine_policy, EngineKind, EnginePolicy, RuntimeConfig, TransferDirection,
};
pub use error::{HalError, HalResult};
pub use logging::init_logging;
pub use native::{BackendCaps, MemoryHint, NativeBackend};
pub use runtime::{
    Buffer, CommandType, Context, Event, ExecutionStatus, Kernel, ProfilingInfo, Queue,
    QueueFlags, QueuePriority, RectLayout, UsmAlloc,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::cpu::CpuBackend;

    #[test]
    fn round_trip_through_public_api() {
        let context = Context::new(CpuBackend::new(1), RuntimeConfig::default());
        assert_eq!(context.adapter_name(), "cpu");
        assert_eq!(context.device_count(), 1);
        let queue = context.create_queue(0, QueueFlags::new()).unwrap();
        let buffer = context.create_buffer(64).unwrap();
        let payload = vec![0x5Au8; 64];
        queue
            .enqueue_write(&buffer, true, 0, &payload, &[])
            .unwrap();
        let mut out = vec![0u8; 64];
        queue.enqueue_read(&buffer, true, 0, &mut out, &[]).unwrap();
        assert_eq!(out, payload);
        queue.finish().unwrap();
    }
}
