//! Machine entity and lifecycle state machine.
//!
//! ## State Machine
//!
//! ```text
//! creating -> running -> destroyed
//!     |                     ^
//!     +-----> error --------+
//! ```
//!
//! Identity fields (id, type, owner, workspace) are immutable. State, the
//! attached instance, and project bindings live behind a per-machine lock
//! so operations on different machines never contend.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use berth_id::MachineId;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tracing::debug;

use crate::error::{MachineError, Result};
use crate::provider::InstanceRef;
use crate::sink::LogSink;

/// Shared handle to a registered machine.
pub type MachineRef = Arc<Machine>;

/// Lifecycle state of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineState {
    /// Provisioning or restore in flight.
    Creating,
    /// Instance attached and usable.
    Running,
    /// Provisioning failed; kept for inspection until destroyed.
    Error,
    /// Resources released; the machine is leaving the registry.
    Destroyed,
}

impl MachineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Error => "error",
            Self::Destroyed => "destroyed",
        }
    }

    /// Returns true if `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: MachineState) -> bool {
        matches!(
            (self, next),
            (Self::Creating, Self::Running)
                | (Self::Creating, Self::Error)
                | (Self::Running, Self::Destroyed)
                | (Self::Error, Self::Destroyed)
        )
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A project path bound to a machine. Equality is path equality.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProjectBinding {
    pub path: String,
}

impl ProjectBinding {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// Build instructions handed to a provider. The script is opaque here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    pub script: String,
    #[serde(rename = "type")]
    pub recipe_type: String,
}

impl Recipe {
    pub fn new(script: impl Into<String>, recipe_type: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            recipe_type: recipe_type.into(),
        }
    }
}

/// Mutable part of a machine, guarded by the machine's lock.
struct MachineInner {
    state: MachineState,
    instance: Option<InstanceRef>,
    bindings: BTreeSet<ProjectBinding>,
}

/// A tracked, owned, isolated execution environment.
pub struct Machine {
    id: MachineId,
    machine_type: String,
    owner: String,
    workspace_id: String,
    logs: LogSink,
    inner: RwLock<MachineInner>,
    /// Flipped to `true` when the machine is destroyed; in-flight
    /// provisioning watches it.
    cancel: watch::Sender<bool>,
}

impl Machine {
    /// Create a machine in `Creating`.
    pub fn new(
        id: MachineId,
        machine_type: impl Into<String>,
        workspace_id: impl Into<String>,
        owner: impl Into<String>,
        logs: LogSink,
    ) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            id,
            machine_type: machine_type.into(),
            owner: owner.into(),
            workspace_id: workspace_id.into(),
            logs,
            inner: RwLock::new(MachineInner {
                state: MachineState::Creating,
                instance: None,
                bindings: BTreeSet::new(),
            }),
            cancel,
        }
    }

    pub fn id(&self) -> MachineId {
        self.id
    }

    pub fn machine_type(&self) -> &str {
        &self.machine_type
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    /// Sink receiving this machine's provisioning and process output.
    pub fn logs(&self) -> &LogSink {
        &self.logs
    }

    pub async fn state(&self) -> MachineState {
        self.inner.read().await.state
    }

    /// Current instance, if one is attached.
    pub async fn instance(&self) -> Option<InstanceRef> {
        self.inner.read().await.instance.clone()
    }

    /// Instance of a `Running` machine, or `NotReady`.
    pub async fn ready_instance(&self) -> Result<InstanceRef> {
        let inner = self.inner.read().await;
        match (&inner.instance, inner.state) {
            (Some(instance), MachineState::Running) => Ok(Arc::clone(instance)),
            _ => Err(MachineError::NotReady(self.id.to_string())),
        }
    }

    /// Point-in-time copy of the bindings, in path order.
    pub async fn project_bindings(&self) -> Vec<ProjectBinding> {
        self.inner.read().await.bindings.iter().cloned().collect()
    }

    pub async fn is_bound(&self, binding: &ProjectBinding) -> bool {
        self.inner.read().await.bindings.contains(binding)
    }

    /// Add a binding. Returns false if it was already present.
    pub async fn bind(&self, binding: ProjectBinding) -> bool {
        self.inner.write().await.bindings.insert(binding)
    }

    /// Remove a binding. Returns false if it was not present.
    pub async fn unbind(&self, binding: &ProjectBinding) -> bool {
        self.inner.write().await.bindings.remove(binding)
    }

    /// Seed bindings, used when restoring from a snapshot.
    pub(crate) async fn bind_all(&self, bindings: impl IntoIterator<Item = ProjectBinding>) {
        self.inner.write().await.bindings.extend(bindings);
    }

    /// `Creating -> Running` with the freshly built instance.
    ///
    /// On failure the instance is handed back so the caller can release it.
    pub(crate) async fn attach(&self, instance: InstanceRef) -> std::result::Result<(), InstanceRef> {
        let mut inner = self.inner.write().await;
        if inner.state != MachineState::Creating {
            return Err(instance);
        }
        inner.instance = Some(instance);
        inner.state = MachineState::Running;
        debug!(machine_id = %self.id, "Machine running");
        Ok(())
    }

    /// `Creating -> Error`. Returns false if the machine already left
    /// `Creating` (for example because it was destroyed).
    pub(crate) async fn fail(&self) -> bool {
        let mut inner = self.inner.write().await;
        if inner.state != MachineState::Creating {
            return false;
        }
        inner.state = MachineState::Error;
        debug!(machine_id = %self.id, "Machine failed");
        true
    }

    /// Move to `Destroyed`, detaching the instance and signalling any
    /// in-flight provisioning.
    ///
    /// A `Creating` machine is failed first so that every transition stays
    /// legal. Destroying twice is `NotFound`: the machine is already gone
    /// from the caller's point of view.
    pub(crate) async fn mark_destroyed(&self) -> Result<Option<InstanceRef>> {
        let mut inner = self.inner.write().await;
        if inner.state == MachineState::Creating {
            inner.state = MachineState::Error;
        }
        if !inner.state.can_transition_to(MachineState::Destroyed) {
            return Err(MachineError::not_found(format!("machine {}", self.id)));
        }
        inner.state = MachineState::Destroyed;
        let instance = inner.instance.take();
        drop(inner);

        self.cancel.send_replace(true);
        Ok(instance)
    }

    /// Receiver that observes destruction.
    pub(crate) fn cancelled(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("id", &self.id)
            .field("machine_type", &self.machine_type)
            .field("owner", &self.owner)
            .field("workspace_id", &self.workspace_id)
            .finish_non_exhaustive()
    }
}
