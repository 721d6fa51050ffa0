//! In-memory registry of live machines.
//!
//! The map is guarded by a `tokio::sync::RwLock`. Entries are `Arc<Machine>`
//! so lookups hand out shared handles and release the lock immediately;
//! per-machine state has its own lock inside `Machine`.

use std::collections::HashMap;

use berth_id::MachineId;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{MachineError, Result};
use crate::machine::{MachineRef, ProjectBinding};

/// Criteria for [`MachineRegistry::list`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineFilter {
    pub owner: Option<String>,
    pub workspace_id: Option<String>,
    pub project: Option<ProjectBinding>,
}

impl MachineFilter {
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    pub fn project(mut self, project: ProjectBinding) -> Self {
        self.project = Some(project);
        self
    }

    async fn matches(&self, machine: &MachineRef) -> bool {
        if self.owner.as_deref().is_some_and(|o| o != machine.owner()) {
            return false;
        }
        if self
            .workspace_id
            .as_deref()
            .is_some_and(|w| w != machine.workspace_id())
        {
            return false;
        }
        match &self.project {
            Some(project) => machine.is_bound(project).await,
            None => true,
        }
    }
}

/// Live machines keyed by id.
#[derive(Debug, Default)]
pub struct MachineRegistry {
    machines: RwLock<HashMap<MachineId, MachineRef>>,
}

impl MachineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a machine. Fails with `Conflict` if the id is taken.
    pub async fn register(&self, machine: MachineRef) -> Result<()> {
        let mut machines = self.machines.write().await;
        let id = machine.id();
        if machines.contains_key(&id) {
            return Err(MachineError::conflict(format!("machine {id} already registered")));
        }
        machines.insert(id, machine);
        debug!(machine_id = %id, count = machines.len(), "Registered machine");
        Ok(())
    }

    pub async fn get(&self, id: &MachineId) -> Result<MachineRef> {
        self.machines
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| MachineError::not_found(format!("machine {id}")))
    }

    /// Remove a machine. Removing an absent id is `NotFound`.
    pub async fn remove(&self, id: &MachineId) -> Result<MachineRef> {
        let mut machines = self.machines.write().await;
        let machine = machines
            .remove(id)
            .ok_or_else(|| MachineError::not_found(format!("machine {id}")))?;
        debug!(machine_id = %id, count = machines.len(), "Removed machine");
        Ok(machine)
    }

    /// Point-in-time copy of the machines matching `filter`.
    ///
    /// The entries are copied out under the read lock; bindings are checked
    /// afterwards so the map lock is never held across a machine lock.
    pub async fn list(&self, filter: &MachineFilter) -> Vec<MachineRef> {
        let candidates: Vec<MachineRef> = self.machines.read().await.values().cloned().collect();

        let mut matching = Vec::with_capacity(candidates.len());
        for machine in candidates {
            if filter.matches(&machine).await {
                matching.push(machine);
            }
        }
        matching
    }

    pub async fn len(&self) -> usize {
        self.machines.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.machines.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::machine::Machine;
    use crate::sink::LogSink;

    fn machine(owner: &str, workspace: &str) -> MachineRef {
        Arc::new(Machine::new(
            MachineId::new(),
            "mock",
            workspace,
            owner,
            LogSink::discard(),
        ))
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = MachineRegistry::new();
        let m = machine("u1", "ws1");
        let id = m.id();

        registry.register(Arc::clone(&m)).await.unwrap();
        let found = registry.get(&id).await.unwrap();
        assert_eq!(found.id(), id);
        assert_eq!(found.owner(), "u1");
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_register_conflicts() {
        let registry = MachineRegistry::new();
        let m = machine("u1", "ws1");

        registry.register(Arc::clone(&m)).await.unwrap();
        let err = registry.register(m).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_remove_twice_is_not_found() {
        let registry = MachineRegistry::new();
        let m = machine("u1", "ws1");
        let id = m.id();
        registry.register(m).await.unwrap();

        registry.remove(&id).await.unwrap();
        assert!(registry.remove(&id).await.unwrap_err().is_not_found());
        assert!(registry.get(&id).await.unwrap_err().is_not_found());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_list_filters() {
        let registry = MachineRegistry::new();
        let a = machine("u1", "ws1");
        let b = machine("u1", "ws2");
        let c = machine("u2", "ws1");
        b.bind(ProjectBinding::new("/proj")).await;
        c.bind(ProjectBinding::new("/proj")).await;
        for m in [&a, &b, &c] {
            registry.register(Arc::clone(m)).await.unwrap();
        }

        assert_eq!(registry.list(&MachineFilter::default()).await.len(), 3);
        assert_eq!(registry.list(&MachineFilter::default().owner("u1")).await.len(), 2);
        assert_eq!(registry.list(&MachineFilter::default().workspace("ws1")).await.len(), 2);

        let bound = registry
            .list(&MachineFilter::default().project(ProjectBinding::new("/proj")))
            .await;
        assert_eq!(bound.len(), 2);

        let narrow = registry
            .list(
                &MachineFilter::default()
                    .owner("u1")
                    .project(ProjectBinding::new("/proj")),
            )
            .await;
        assert_eq!(narrow.len(), 1);
        assert_eq!(narrow[0].id(), b.id());
    }

    #[tokio::test]
    async fn test_concurrent_registration() {
        let registry = Arc::new(MachineRegistry::new());
        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    registry
                        .register(machine(&format!("u{}", i % 4), "ws"))
                        .await
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(registry.len().await, 32);
        assert_eq!(registry.list(&MachineFilter::default().owner("u0")).await.len(), 8);
    }
}
