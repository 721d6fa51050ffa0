//! berth Machine Manager Library
//!
//! Orchestrates the lifecycle of machines: isolated execution environments
//! built from a recipe or a snapshot by a pluggable instance provider.
//!
//! ## Architecture
//!
//! ```text
//! MachineManager
//! ├── MachineRegistry    (live machines by id)
//! ├── ProviderRegistry   (machine type -> InstanceProvider)
//! ├── SnapshotStore      (saved snapshot records)
//! └── CleanupWorker      (retries failed instance destroys)
//! ```
//!
//! ## Modules
//!
//! - `machine`: machine entity and its state machine
//! - `provider`: provider, instance, and process interfaces with the
//!   `mock` and `local` implementations
//! - `snapshot`: snapshot records, in-memory and SQLite stores

pub mod cleanup;
pub mod config;
pub mod error;
pub mod machine;
pub mod manager;
pub mod provider;
pub mod registry;
pub mod sink;
pub mod snapshot;

mod process;

pub use cleanup::{CleanupWorker, CleanupWorkerConfig};
pub use error::{InstanceError, MachineError, Result};
pub use machine::{Machine, MachineRef, MachineState, ProjectBinding, Recipe};
pub use manager::MachineManager;
pub use provider::{
    BuildCancel, Instance, InstanceProcess, InstanceProvider, InstanceRef, ProcessRef,
    ProcessStatus, ProviderRegistry, SnapshotRef,
};
pub use registry::{MachineFilter, MachineRegistry};
pub use sink::LogSink;
pub use snapshot::{Snapshot, SnapshotFilter, SnapshotStore};
