//! Kernel error types
//!
//! Recoverable failures (bad arguments, exhausted resources) are reported as
//! [`KernelError`]. Broken invariants are not errors: they panic with a message
//! naming the rule that was violated.

use thiserror::Error;

/// Errors returned by fallible kernel operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    /// Thread names must be non-empty
    #[error("thread name must not be empty")]
    InvalidName,

    /// Priority outside `Priority::LOWEST..=Priority::MAXIMUM`
    #[error("priority {0} is out of range")]
    InvalidPriority(u32),

    /// Raw timer kind that maps to no [`TimerKind`](super::TimerKind)
    #[error("timer kind {0} is out of range")]
    InvalidTimerKind(u32),

    /// A stack or host thread could not be obtained
    #[error("failed to allocate {0}")]
    AllocationFailed(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The calling host thread already runs a kernel thread
    #[error("host thread is already bound to a kernel thread")]
    AlreadyBound,

    #[error("kernel has been shut down")]
    ShutDown,

    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for KernelError {
    fn from(err: serde_json::Error) -> Self {
        KernelError::Serialization(err.to_string())
    }
}

/// Result type for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;
