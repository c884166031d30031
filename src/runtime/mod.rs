//! Core scheduling runtime: contexts, queues, events, buffers, kernels
//!
//! Everything here is written once against the [`crate::native::NativeBackend`]
//! seam and never branches on back-end identity.

pub mod buffer;
pub mod context;
pub mod enqueue;
pub mod event;
pub mod kernel;
pub mod queue;
pub mod stream_pool;
pub mod wait_list;

pub use buffer::Buffer;
pub use context::{Context, UsmAlloc};
pub use enqueue::RectLayout;
pub use event::{CommandType, Event, ExecutionStatus, NativeOwnership, ProfilingInfo};
pub use kernel::Kernel;
pub use queue::{Queue, QueueFlags, QueuePriority};
pub use wait_list::latest_events;
