//! ROCm/HIP native back-end
//!
//! Stream-based adapter: HIP streams execute eagerly, so `append` issues the
//! asynchronous HIP call immediately and `submit` is a no-op (there is no
//! explicit batching cost on this back-end).

pub mod backend;
pub mod ffi;

pub use backend::HipBackend;
