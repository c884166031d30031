//! Process-wide runtime configuration
//!
//! [`RuntimeConfig`] is built exactly once at initialization (from the
//! environment or programmatically) and passed by `Arc` into every component
//! that needs it. There are no lazily initialized mutable globals: every
//! toggle is immutable for the lifetime of the runtime.
//!
//! # Environment Variables
//!
//! - `STREAMFORGE_COMPUTE_STREAMS`: streams per compute engine group
//! - `STREAMFORGE_TRANSFER_STREAMS`: streams per transfer group (0 disables)
//! - `STREAMFORGE_BATCH_LIMIT`: open-batch command count before forced submit
//! - `STREAMFORGE_MAX_WAIT_LIST`: native wait-list length cap
//! - `STREAMFORGE_PREFER_COPY_ENGINE`: route device-to-device copies to the
//!   transfer engine ("1"/"true")
//! - `STREAMFORGE_SINGLE_THREAD_MODE`: downgrade queue locking to
//!   non-blocking acquisition ("1"/"true")
//! - `STREAMFORGE_TRACK_INDIRECT_ACCESS`: kernels may reach USM allocations
//!   indirectly; launches then submit eagerly instead of batching

use std::env;

/// Which engine group a command should be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// Kernel launches and default placement
    Compute,
    /// Dedicated copy/transfer engines, when the device exposes them
    Transfer,
}

/// Direction of a memory transfer, as seen by the engine-selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
    /// Not a transfer (kernel launch, barrier, hint)
    None,
}

/// Engine-selection policy.
///
/// Which engine is "preferred" for a given transfer direction is tuning, not
/// structure, so it is a pluggable function rather than hard-coded branches.
/// The second argument is the process-wide copy-engine preference toggle.
pub type EnginePolicy = fn(TransferDirection, bool) -> EngineKind;

/// Default policy: host transfers prefer the copy engine, device-to-device
/// copies prefer compute unless the copy-engine toggle overrides.
pub fn default_engine_policy(direction: TransferDirection, prefer_copy_engine: bool) -> EngineKind {
    match direction {
        TransferDirection::HostToDevice | TransferDirection::DeviceToHost => EngineKind::Transfer,
        TransferDirection::DeviceToDevice => {
            if prefer_copy_engine {
                EngineKind::Transfer
            } else {
                EngineKind::Compute
            }
        }
        TransferDirection::None => EngineKind::Compute,
    }
}

/// Immutable process-wide configuration for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of streams in each queue's compute engine group
    pub compute_streams: usize,

    /// Number of streams in each queue's transfer engine group (0 disables
    /// the group; transfers then fall back to the compute group)
    pub transfer_streams: usize,

    /// Number of commands an open batch may accumulate before submission is
    /// forced. Driver-specific tuning, not a correctness knob.
    pub batch_limit: usize,

    /// Cap on retained native wait-list entries per command. Dependencies
    /// beyond the cap are resolved by a host-side wait instead.
    pub max_wait_events: usize,

    /// Route device-to-device transfers to the copy engine
    pub prefer_copy_engine: bool,

    /// The client guarantees single-threaded use; queue locks become
    /// non-blocking and contention is reported as a contract violation.
    /// Opt-in correctness trade, never the default.
    pub single_thread_mode: bool,

    /// Kernels may touch USM allocations not passed as arguments; launches
    /// then submit eagerly instead of batching so every previously appended
    /// memory command is visible to them.
    pub track_indirect_access: bool,

    /// Engine-selection policy for transfers
    pub engine_policy: EnginePolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            compute_streams: 4,
            transfer_streams: 2,
            batch_limit: 4,
            max_wait_events: 64,
            prefer_copy_engine: false,
            single_thread_mode: false,
            track_indirect_access: false,
            engine_policy: default_engine_policy,
        }
    }
}

impl RuntimeConfig {
    /// Create a config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a config from the process environment.
    ///
    /// Intended to be called once at startup; the result is immutable.
    pub fn from_env() -> Self {
        let mut config = RuntimeConfig::default();
        if let Some(n) = read_usize("STREAMFORGE_COMPUTE_STREAMS") {
            config.compute_streams = n.max(1);
        }
        if let Some(n) = read_usize("STREAMFORGE_TRANSFER_STREAMS") {
            config.transfer_streams = n;
        }
        if let Some(n) = read_usize("STREAMFORGE_BATCH_LIMIT") {
            config.batch_limit = n.max(1);
        }
        if let Some(n) = read_usize("STREAMFORGE_MAX_WAIT_LIST") {
            config.max_wait_events = n.max(1);
        }
        if let Some(v) = read_bool("STREAMFORGE_PREFER_COPY_ENGINE") {
            config.prefer_copy_engine = v;
        }
        if let Some(v) = read_bool("STREAMFORGE_SINGLE_THREAD_MODE") {
            config.single_thread_mode = v;
        }
        if let Some(v) = read_bool("STREAMFORGE_TRACK_INDIRECT_ACCESS") {
            config.track_indirect_access = v;
        }
        tracing::debug!(?config, "runtime configuration loaded");
        config
    }

    /// Set compute stream pool size
    pub fn with_compute_streams(mut self, n: usize) -> Self {
        self.compute_streams = n.max(1);
        self
    }

    /// Set transfer stream pool size (0 disables the transfer group)
    pub fn with_transfer_streams(mut self, n: usize) -> Self {
        self.transfer_streams = n;
        self
    }

    /// Set the open-batch submission threshold
    pub fn with_batch_limit(mut self, n: usize) -> Self {
        self.batch_limit = n.max(1);
        self
    }

    /// Set the native wait-list length cap
    pub fn with_max_wait_events(mut self, n: usize) -> Self {
        self.max_wait_events = n.max(1);
        self
    }

    /// Prefer the copy engine for device-to-device transfers
    pub fn with_prefer_copy_engine(mut self, v: bool) -> Self {
        self.prefer_copy_engine = v;
        self
    }

    /// Declare the whole program single-threaded
    pub fn with_single_thread_mode(mut self, v: bool) -> Self {
        self.single_thread_mode = v;
        self
    }

    /// Declare that kernels may reach USM allocations indirectly
    pub fn with_track_indirect_access(mut self, v: bool) -> Self {
        self.track_indirect_access = v;
        self
    }

    /// Replace the engine-selection policy
    pub fn with_engine_policy(mut self, policy: EnginePolicy) -> Self {
        self.engine_policy = policy;
        self
    }

    /// Apply the configured engine policy to a transfer direction
    pub fn select_engine(&self, direction: TransferDirection) -> EngineKind {
        (self.engine_policy)(direction, self.prefer_copy_engine)
    }
}

fn read_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn read_bool(name: &str) -> Option<bool> {
    env::var(name).ok().map(|v| {
        let v = v.trim().to_ascii_lowercase();
        v == "1" || v == "true" || v == "on" || v == "yes"
    })
}
