//! Error types for the machine manager.
//!
//! `MachineError` is what every manager operation returns. Provider-level
//! failures are carried as `InstanceError` inside `MachineError::Instance`
//! so that callers can tell backend trouble apart from lookup and state
//! errors.

use std::time::Duration;

use thiserror::Error;

use crate::snapshot::SnapshotStoreError;

/// Result alias used throughout the crate.
pub type Result<T, E = MachineError> = std::result::Result<T, E>;

/// Errors surfaced by the machine manager and its collaborators.
#[derive(Debug, Error)]
pub enum MachineError {
    /// Referenced machine, process, or snapshot does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Illegal state transition or duplicate identity.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The machine has no ready instance for this operation.
    #[error("machine {0} is not ready to perform this action")]
    NotReady(String),

    /// No provider is registered for the requested machine type.
    #[error("unsupported machine type: {0}")]
    UnsupportedType(String),

    /// Backend failure reported by an instance provider.
    #[error(transparent)]
    Instance(#[from] InstanceError),

    /// Snapshot persistence failure.
    #[error(transparent)]
    Store(SnapshotStoreError),

    /// Unexpected failure (panicked task, broken invariant).
    #[error("internal error: {0}")]
    Internal(String),
}

impl MachineError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn conflict(what: impl Into<String>) -> Self {
        Self::Conflict(what.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn is_instance(&self) -> bool {
        matches!(self, Self::Instance(_))
    }

    /// Stable reason code for the transport layer.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::NotReady(_) => "machine_not_ready",
            Self::UnsupportedType(_) => "unsupported_type",
            Self::Instance(e) => e.reason_code(),
            Self::Store(_) => "store_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl From<SnapshotStoreError> for MachineError {
    fn from(err: SnapshotStoreError) -> Self {
        match err {
            SnapshotStoreError::NotFound(id) => Self::NotFound(format!("snapshot {id}")),
            other => Self::Store(other),
        }
    }
}

/// Failures raised by instance providers and the instances they build.
#[derive(Debug, Error)]
pub enum InstanceError {
    /// Building a new instance from a recipe failed.
    #[error("provisioning failed: {0}")]
    Provision(String),

    /// Rebuilding an instance from a snapshot failed.
    #[error("restore failed: {0}")]
    Restore(String),

    /// Capturing an instance failed.
    #[error("snapshot failed: {0}")]
    Snapshot(String),

    /// Releasing provider resources failed.
    #[error("destroy failed: {0}")]
    Destroy(String),

    /// Starting, supervising, or killing a process failed.
    #[error("process error: {0}")]
    Process(String),

    /// Provisioning exceeded the provider's declared maximum.
    #[error("provisioning timed out after {0:?}")]
    Timeout(Duration),

    /// Provisioning was abandoned because the machine was destroyed.
    #[error("provisioning cancelled")]
    Cancelled,

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl InstanceError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Provision(_) => "provision_failed",
            Self::Restore(_) => "restore_failed",
            Self::Snapshot(_) => "snapshot_failed",
            Self::Destroy(_) => "destroy_failed",
            Self::Process(_) => "process_failed",
            Self::Timeout(_) => "provision_timeout",
            Self::Cancelled => "provision_cancelled",
            Self::Io(_) => "io_error",
        }
    }
}
