//! Error types shared by the NRS core, the policies and the control surface.
//!
//! Every variant maps onto the classic errno the RPC service reports to operators, so callers
//! can match either on the variant or on [`NrsError::errno`].

use thiserror::Error;

/// Scheduler errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NrsError {
    /// A policy type, policy instance or TBF rule with this name already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The named TBF rule does not exist (or is stopping).
    #[error("not found: {0}")]
    NotFound(String),

    /// The policy is not registered on the head, or the head itself does not exist.
    #[error("no such device: {0}")]
    NoDevice(String),

    /// The operation is never allowed in the current configuration.
    #[error("operation not permitted: {0}")]
    PermissionDenied(String),

    /// A transient lifecycle conflict; the caller should retry later.
    #[error("try again: {0}")]
    TryAgain(String),

    /// The policy still has outstanding references.
    #[error("policy {name} is busy with {refs} references")]
    Busy { name: String, refs: u64 },

    /// Malformed command, selector, rate or flags.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The opcode is reserved or the policy does not implement it.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Differentiated state could not be allocated.
    #[error("out of memory: {0}")]
    OutOfMemory(String),
}

impl NrsError {
    /// Negative errno equivalent of this error.
    pub fn errno(&self) -> i32 {
        match self {
            NrsError::AlreadyExists(_) => -libc::EEXIST,
            NrsError::NotFound(_) => -libc::ENOENT,
            NrsError::NoDevice(_) => -libc::ENODEV,
            NrsError::PermissionDenied(_) => -libc::EPERM,
            NrsError::TryAgain(_) => -libc::EAGAIN,
            NrsError::Busy { .. } => -libc::EBUSY,
            NrsError::InvalidArgument(_) => -libc::EINVAL,
            NrsError::NotSupported(_) => -libc::ENOSYS,
            NrsError::OutOfMemory(_) => -libc::ENOMEM,
        }
    }

    /// Whether the caller may retry the operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NrsError::TryAgain(_) | NrsError::Busy { .. })
    }
}

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, NrsError>;
