//! Shared fixtures for runtime integration tests
//!
//! Tests that assert on scheduling behavior (submission counts, wait
//! instructions, destroy calls) use the counting mock back-end; tests that
//! assert on data movement use the CPU back-end, which really executes
//! copies on worker threads.

#![allow(dead_code)]

use std::sync::Arc;

use streamforge::native::cpu::CpuBackend;
use streamforge::native::mock::MockBackend;
use streamforge::{Context, RuntimeConfig};

/// Context over a counting mock back-end, returning both handles
pub fn mock_context(devices: u32, config: RuntimeConfig) -> (Arc<Context>, Arc<MockBackend>) {
    let backend = MockBackend::new(devices);
    (Context::new(backend.clone(), config), backend)
}

/// Context over the executing CPU back-end
pub fn cpu_context(devices: u32, config: RuntimeConfig) -> Arc<Context> {
    Context::new(CpuBackend::new(devices), config)
}

/// CPU context with explicit peer-access topology
pub fn cpu_context_with_topology(
    devices: u32,
    peer_access: bool,
    config: RuntimeConfig,
) -> Arc<Context> {
    Context::new(
        CpuBackend::with_topology(devices, peer_access, false),
        config,
    )
}

/// Single-stream config so every event of a queue lands on one stream
pub fn single_stream_config() -> RuntimeConfig {
    RuntimeConfig::new()
        .with_compute_streams(1)
        .with_transfer_streams(0)
}
