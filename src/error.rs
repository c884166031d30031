//! Unified error handling for StreamForge
//!
//! Every native-driver failure is translated into the nearest matching
//! variant at the call that observed it and returned to the client. There
//! are no hidden retry loops: a failed submission or copy is reported as-is,
//! and the first error wins.

use thiserror::Error;

/// Unified error type for the runtime
#[derive(Error, Debug, Clone)]
pub enum HalError {
    /// The event wait list was malformed (mixed contexts, foreign events)
    #[error("invalid event wait list: {0}")]
    InvalidEventWaitList(String),

    /// A parameter value was out of range or inconsistent
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// A memory handle did not belong to this context or was unusable
    #[error("invalid mem object: {0}")]
    InvalidMemObject(String),

    /// A rect/image region was degenerate or out of bounds
    #[error("invalid image size: {0}")]
    InvalidImageSize(String),

    /// The operation is not legal in the object's current state
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Host allocation failed
    #[error("out of host memory: {0}")]
    OutOfHostMemory(String),

    /// Native resource creation (stream, event, device allocation) failed
    #[error("out of resources: {0}")]
    OutOfResources(String),

    /// The back-end does not implement the requested feature
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// A native driver error with an attached message
    #[error("adapter error: {0}")]
    AdapterSpecific(String),

    /// Internal lock poisoned - this indicates a bug
    #[error("internal lock poisoned: {0}")]
    LockPoisoned(String),

    /// Unclassifiable failure
    #[error("unknown error")]
    Unknown,
}

impl<T> From<std::sync::PoisonError<T>> for HalError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        HalError::LockPoisoned(format!("lock poisoned: {}", err))
    }
}

/// Runtime result type
pub type HalResult<T> = Result<T, HalError>;

impl HalError {
    /// Check if this error is recoverable (temporary condition)
    ///
    /// Recoverable errors describe transient resource pressure; the caller
    /// may release work and try again. Contract violations and poisoned
    /// locks are permanent.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            HalError::OutOfResources(_)
                | HalError::OutOfHostMemory(_)
                | HalError::AdapterSpecific(_)
        )
    }

    /// Check if this error is permanent (should never retry)
    pub fn is_permanent(&self) -> bool {
        !self.is_recoverable()
    }
}
