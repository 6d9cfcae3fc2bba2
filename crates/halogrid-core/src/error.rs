//! Error types for the halo exchange engine.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, HaloError>;

/// Errors surfaced by the exchange engine and its collaborator seams.
///
/// Peer-access denial is deliberately *not* an error: the topology probe
/// demotes such pairs to the non-peer transports instead.
#[derive(Error, Debug)]
pub enum HaloError {
    /// Configuration rejected at `realize` time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Device memory allocation failed. Fatal; the engine does not retry.
    #[error("device allocation of {requested} bytes on device {device} failed: {reason}")]
    AllocationFailed {
        /// Requested size in bytes.
        requested: usize,
        /// Device ordinal the allocation targeted.
        device: usize,
        /// Backend-reported reason.
        reason: String,
    },

    /// Host memory allocation failed.
    #[error("host allocation of {size} bytes failed")]
    HostAllocationFailed {
        /// Requested size in bytes.
        size: usize,
    },

    /// A device backend reported an error.
    #[error("backend error: {0}")]
    BackendError(String),

    /// A host/device or device/device copy failed.
    #[error("transfer failed: {0}")]
    TransferFailed(String),

    /// The process group reported a messaging failure. Fatal; no retry.
    #[error("process group error: {0}")]
    CommError(String),

    /// A received message did not have the planned length. This indicates a
    /// planner bug, never a transient condition.
    #[error("message length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch {
        /// Bytes the plan promised.
        expected: usize,
        /// Bytes actually received.
        actual: usize,
    },

    /// A transport operation was called in the wrong state.
    #[error("invalid state transition: {op} called in state {state}")]
    InvalidStateTransition {
        /// Operation attempted.
        op: &'static str,
        /// State the transport was in.
        state: &'static str,
    },

    /// The requested capability is not provided by this collaborator.
    #[error("not supported: {0}")]
    NotSupported(String),
}
