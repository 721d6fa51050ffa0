//! Instance provider interface.
//!
//! A provider builds, restores, snapshots, and destroys instances for one
//! machine type. Instances supervise processes. Two implementations ship
//! with the crate:
//!
//! - `mock`: simulated instances for tests and development
//! - `local`: one host directory per instance, processes via `sh -c`

pub mod local;
pub mod mock;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use berth_id::InstanceId;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use crate::error::{InstanceError, MachineError, Result};
use crate::machine::Recipe;
use crate::sink::LogSink;

/// Default provider-declared maximum for provision/restore.
pub const DEFAULT_PROVISION_TIMEOUT: Duration = Duration::from_secs(600);

/// Shared handle to an instance.
pub type InstanceRef = Arc<dyn Instance>;

/// Shared handle to a process.
pub type ProcessRef = Arc<dyn InstanceProcess>;

/// Provider-side identity of an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    pub instance_id: InstanceId,
    pub machine_type: String,
    /// Provider-specific address of the instance (a directory, a container
    /// name, ...).
    pub location: String,
}

/// Opaque, provider-specific reference to captured instance state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub machine_type: String,
    pub location: String,
}

/// Lifecycle of a process inside an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    NotStarted,
    Running,
    Terminated,
}

/// Raised once nobody is waiting for a build anymore: its machine was
/// destroyed or the provider timeout expired.
///
/// Providers stop the build as soon as practical, discard what they built so
/// far, and return `InstanceError::Cancelled`.
#[derive(Debug, Clone)]
pub struct BuildCancel {
    rx: watch::Receiver<bool>,
}

impl BuildCancel {
    /// A cancel signal and the sender that raises it.
    pub fn new() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// A signal that is never raised.
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal is raised. Pends forever if its sender is
    /// dropped without raising it.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Pluggable backend for one machine type.
#[async_trait]
pub trait InstanceProvider: Send + Sync {
    /// Key this provider is registered under.
    fn machine_type(&self) -> &str;

    /// Upper bound on `provision` and `restore`.
    fn provision_timeout(&self) -> Duration {
        DEFAULT_PROVISION_TIMEOUT
    }

    /// Build a new instance from a recipe, streaming build output to `logs`.
    async fn provision(
        &self,
        recipe: &Recipe,
        logs: LogSink,
        cancel: BuildCancel,
    ) -> Result<InstanceRef, InstanceError>;

    /// Rebuild an instance from a previously captured snapshot.
    async fn restore(
        &self,
        snapshot: &SnapshotRef,
        logs: LogSink,
        cancel: BuildCancel,
    ) -> Result<InstanceRef, InstanceError>;

    /// Capture the instance without stopping or mutating it.
    async fn snapshot(&self, instance: &InstanceRef) -> Result<SnapshotRef, InstanceError>;

    /// Release every provider-side resource. Must succeed for instances that
    /// are already released or were only partially built.
    async fn destroy(&self, instance: &InstanceRef) -> Result<(), InstanceError>;

    /// Release provider-side snapshot data.
    async fn remove_snapshot(&self, _snapshot: &SnapshotRef) -> Result<(), InstanceError> {
        Ok(())
    }
}

/// Live backend realization of a machine.
#[async_trait]
pub trait Instance: Send + Sync + fmt::Debug {
    fn handle(&self) -> &InstanceHandle;

    /// Create a process that is not yet started.
    async fn create_process(&self, command_line: &str) -> Result<ProcessRef>;

    /// Look up a started process by pid.
    async fn get_process(&self, pid: u32) -> Result<ProcessRef>;

    /// Every process, in creation order.
    async fn list_processes(&self) -> Vec<ProcessRef>;

    /// Kill every live process. Failures are logged, not returned.
    async fn kill_all(&self);
}

/// Supervised command running inside an instance.
///
/// ```text
/// not_started --start--> running --(exit | kill)--> terminated
/// ```
#[async_trait]
pub trait InstanceProcess: Send + Sync + fmt::Debug {
    /// 0 until started, then a positive id unique within the instance.
    fn pid(&self) -> u32;

    fn command_line(&self) -> &str;

    fn status(&self) -> ProcessStatus;

    /// Exit code once terminated, if the process reported one.
    fn exit_code(&self) -> Option<i32>;

    /// Start the process.
    ///
    /// With `Some(output)` the call lasts as long as the process and delivers
    /// its output line by line. With `None` the process runs detached and its
    /// output is discarded. Starting twice is a `Conflict`.
    async fn start(&self, output: Option<LogSink>) -> Result<()>;

    /// Never blocks.
    fn is_alive(&self) -> bool {
        self.status() == ProcessStatus::Running
    }

    /// Request termination. A no-op once terminated.
    async fn kill(&self) -> Result<()>;
}

/// Providers keyed by machine type, assembled once at startup.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn InstanceProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own machine type.
    pub fn register(&mut self, provider: Arc<dyn InstanceProvider>) -> Result<()> {
        let key = provider.machine_type().to_string();
        if self.providers.contains_key(&key) {
            return Err(MachineError::conflict(format!(
                "provider for machine type {key} already registered"
            )));
        }
        info!(machine_type = %key, "Registered instance provider");
        self.providers.insert(key, provider);
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, provider: Arc<dyn InstanceProvider>) -> Result<Self> {
        self.register(provider)?;
        Ok(self)
    }

    pub fn get(&self, machine_type: &str) -> Result<Arc<dyn InstanceProvider>> {
        self.providers
            .get(machine_type)
            .cloned()
            .ok_or_else(|| MachineError::UnsupportedType(machine_type.to_string()))
    }

    pub fn machine_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
