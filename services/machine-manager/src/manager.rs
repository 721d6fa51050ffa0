//! Machine manager: the orchestration entry point.
//!
//! Callers share one `Arc<MachineManager>`. Provider calls (provision,
//! restore, snapshot) each run on their own task; the calling operation
//! awaits the outcome, so a hung build only ties up the caller that asked
//! for it.
//!
//! ## Create
//!
//! ```text
//! register (creating) -> spawn provider task -> wait for first of:
//!     task result        -> attach (running) | fail (error) + re-raise
//!     provider timeout   -> fail (error), cancel build, reap in background
//!     machine destroyed  -> cancel build, reap in background
//! ```
//!
//! A cancelled build is told through its `BuildCancel`; the provider kills
//! the build and discards partial state. Anything it still hands back is
//! destroyed by the reaper.

use std::sync::Arc;
use std::time::Duration;

use berth_id::{MachineId, SnapshotId};
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, instrument, warn};

use crate::cleanup::CleanupWorker;
use crate::error::{InstanceError, MachineError, Result};
use crate::machine::{Machine, MachineRef, ProjectBinding, Recipe};
use crate::provider::{BuildCancel, InstanceProvider, InstanceRef, ProcessRef, ProviderRegistry};
use crate::registry::{MachineFilter, MachineRegistry};
use crate::sink::LogSink;
use crate::snapshot::{Snapshot, SnapshotFilter, SnapshotStore};

type BuildTask = JoinHandle<Result<InstanceRef, InstanceError>>;

enum BuildOutcome {
    Finished(std::result::Result<Result<InstanceRef, InstanceError>, JoinError>),
    TimedOut(Duration),
    Cancelled,
}

/// Orchestrates machines across every registered provider.
pub struct MachineManager {
    providers: ProviderRegistry,
    machines: MachineRegistry,
    snapshots: Arc<dyn SnapshotStore>,
    cleaner: Arc<CleanupWorker>,
}

impl MachineManager {
    pub fn new(
        providers: ProviderRegistry,
        snapshots: Arc<dyn SnapshotStore>,
        cleaner: Arc<CleanupWorker>,
    ) -> Self {
        Self {
            providers,
            machines: MachineRegistry::new(),
            snapshots,
            cleaner,
        }
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn cleaner(&self) -> &Arc<CleanupWorker> {
        &self.cleaner
    }

    /// Number of registered machines.
    pub async fn machine_count(&self) -> usize {
        self.machines.len().await
    }

    /// Provision a new machine from a recipe.
    ///
    /// Blocks until the instance is ready, the build fails, or the provider's
    /// timeout expires. On failure the machine stays registered in `Error`.
    #[instrument(skip_all, fields(machine_type = %machine_type, workspace_id = %workspace_id, owner = %owner))]
    pub async fn create(
        &self,
        machine_type: &str,
        recipe: Recipe,
        workspace_id: &str,
        owner: &str,
        logs: LogSink,
    ) -> Result<MachineRef> {
        let provider = self.providers.get(machine_type)?;
        let machine = self.register(machine_type, workspace_id, owner, logs).await?;

        let (abandon, cancel) = BuildCancel::new();
        let build = tokio::spawn({
            let provider = Arc::clone(&provider);
            let logs = machine.logs().clone();
            async move { provider.provision(&recipe, logs, cancel).await }
        });

        self.drive(&machine, provider, build, abandon).await?;
        Ok(machine)
    }

    /// Restore a new machine from a saved snapshot.
    ///
    /// The machine inherits the snapshot's type, workspace, and project
    /// bindings; `owner` becomes its owner.
    #[instrument(skip_all, fields(snapshot_id = %snapshot_id, owner = %owner))]
    pub async fn create_from_snapshot(
        &self,
        snapshot_id: &SnapshotId,
        owner: &str,
        logs: LogSink,
    ) -> Result<MachineRef> {
        let snapshot = self.snapshots.get(snapshot_id).await?;
        let provider = self.providers.get(&snapshot.image_type)?;
        let machine = self
            .register(&snapshot.image_type, &snapshot.workspace_id, owner, logs)
            .await?;
        machine.bind_all(snapshot.projects.iter().cloned()).await;

        let (abandon, cancel) = BuildCancel::new();
        let build = tokio::spawn({
            let provider = Arc::clone(&provider);
            let logs = machine.logs().clone();
            let reference = snapshot.reference.clone();
            async move { provider.restore(&reference, logs, cancel).await }
        });

        self.drive(&machine, provider, build, abandon).await?;
        Ok(machine)
    }

    async fn register(
        &self,
        machine_type: &str,
        workspace_id: &str,
        owner: &str,
        logs: LogSink,
    ) -> Result<MachineRef> {
        let machine = Arc::new(Machine::new(
            MachineId::new(),
            machine_type,
            workspace_id,
            owner,
            logs,
        ));
        self.machines.register(Arc::clone(&machine)).await?;
        info!(machine_id = %machine.id(), "Machine creating");
        Ok(machine)
    }

    /// Wait for a build and publish its result on the machine.
    async fn drive(
        &self,
        machine: &MachineRef,
        provider: Arc<dyn InstanceProvider>,
        mut build: BuildTask,
        abandon: watch::Sender<bool>,
    ) -> Result<()> {
        let timeout = provider.provision_timeout();
        let mut destroyed = machine.cancelled();

        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, &mut build) => match result {
                Ok(joined) => BuildOutcome::Finished(joined),
                Err(_) => BuildOutcome::TimedOut(timeout),
            },
            _ = wait_destroyed(&mut destroyed) => BuildOutcome::Cancelled,
        };

        let machine_id = machine.id();
        match outcome {
            BuildOutcome::Finished(Ok(Ok(instance))) => {
                let instance_id = instance.handle().instance_id;
                match machine.attach(instance).await {
                    Ok(()) => {
                        info!(machine_id = %machine_id, instance_id = %instance_id, "Machine running");
                        Ok(())
                    }
                    Err(instance) => {
                        debug!(machine_id = %machine_id, "Machine destroyed while building");
                        tokio::spawn(release(provider, instance, Arc::clone(&self.cleaner)));
                        Err(InstanceError::Cancelled.into())
                    }
                }
            }
            BuildOutcome::Finished(Ok(Err(e))) => {
                machine.fail().await;
                machine.logs().send_line(format!("[ERROR] {e}"));
                warn!(machine_id = %machine_id, error = %e, "Machine build failed");
                Err(e.into())
            }
            BuildOutcome::Finished(Err(e)) => {
                machine.fail().await;
                error!(machine_id = %machine_id, error = %e, "Machine build task failed");
                Err(MachineError::Internal(format!("build task failed: {e}")))
            }
            BuildOutcome::TimedOut(timeout) => {
                abandon.send_replace(true);
                machine.fail().await;
                machine
                    .logs()
                    .send_line(format!("[ERROR] build timed out after {timeout:?}"));
                warn!(machine_id = %machine_id, timeout_secs = timeout.as_secs(), "Machine build timed out");
                self.reap(machine_id, provider, build);
                Err(InstanceError::Timeout(timeout).into())
            }
            BuildOutcome::Cancelled => {
                abandon.send_replace(true);
                debug!(machine_id = %machine_id, "Machine destroyed while building");
                self.reap(machine_id, provider, build);
                Err(InstanceError::Cancelled.into())
            }
        }
    }

    /// Wait out a cancelled build and destroy whatever it still produced.
    fn reap(&self, machine_id: MachineId, provider: Arc<dyn InstanceProvider>, build: BuildTask) {
        let cleaner = Arc::clone(&self.cleaner);
        tokio::spawn(async move {
            match build.await {
                Ok(Ok(instance)) => {
                    debug!(machine_id = %machine_id, "Releasing instance of abandoned build");
                    release(provider, instance, cleaner).await;
                }
                Ok(Err(e)) => {
                    debug!(machine_id = %machine_id, error = %e, "Abandoned build stopped");
                }
                Err(e) => {
                    warn!(machine_id = %machine_id, error = %e, "Abandoned build task failed");
                }
            }
        });
    }

    pub async fn get_machine(&self, id: &MachineId) -> Result<MachineRef> {
        self.machines.get(id).await
    }

    pub async fn get_machines(&self, filter: &MachineFilter) -> Vec<MachineRef> {
        self.machines.list(filter).await
    }

    /// Destroy a machine and release its instance.
    ///
    /// Provider failures are handed to the cleanup worker and never
    /// returned. A machine that is still building is abandoned.
    #[instrument(skip_all, fields(machine_id = %id))]
    pub async fn destroy(&self, id: &MachineId) -> Result<()> {
        let machine = self.machines.get(id).await?;
        let instance = machine.mark_destroyed().await?;

        if let Some(instance) = instance {
            match self.providers.get(machine.machine_type()) {
                Ok(provider) => release(provider, instance, Arc::clone(&self.cleaner)).await,
                Err(e) => error!(error = %e, "No provider to release instance"),
            }
        }

        self.machines.remove(id).await?;
        info!("Machine destroyed");
        Ok(())
    }

    /// Run a command on a running machine.
    ///
    /// With `output` the call returns once the process has exited and every
    /// line was delivered. Without it the call returns once the process runs.
    #[instrument(skip_all, fields(machine_id = %id))]
    pub async fn exec(
        &self,
        id: &MachineId,
        command_line: &str,
        output: Option<LogSink>,
    ) -> Result<ProcessRef> {
        let machine = self.machines.get(id).await?;
        let instance = machine.ready_instance().await?;

        let process = instance.create_process(command_line).await?;
        process.start(output).await?;
        debug!(pid = process.pid(), command = %command_line, "Process started");
        Ok(process)
    }

    pub async fn get_processes(&self, id: &MachineId) -> Result<Vec<ProcessRef>> {
        let machine = self.machines.get(id).await?;
        let instance = machine.ready_instance().await?;
        Ok(instance.list_processes().await)
    }

    pub async fn get_process(&self, id: &MachineId, pid: u32) -> Result<ProcessRef> {
        let machine = self.machines.get(id).await?;
        let instance = machine.ready_instance().await?;
        instance.get_process(pid).await
    }

    #[instrument(skip_all, fields(machine_id = %id))]
    pub async fn stop_process(&self, id: &MachineId, pid: u32) -> Result<()> {
        let process = self.get_process(id, pid).await?;
        process.kill().await?;
        info!("Process stopped");
        Ok(())
    }

    /// Bind a project. Binding twice is a no-op.
    pub async fn bind_project(&self, id: &MachineId, project: ProjectBinding) -> Result<()> {
        let machine = self.machines.get(id).await?;
        if machine.bind(project.clone()).await {
            debug!(machine_id = %id, path = %project.path, "Project bound");
        }
        Ok(())
    }

    /// Unbind a project. Unbinding an unbound project is a no-op.
    pub async fn unbind_project(&self, id: &MachineId, project: &ProjectBinding) -> Result<()> {
        let machine = self.machines.get(id).await?;
        if machine.unbind(project).await {
            debug!(machine_id = %id, path = %project.path, "Project unbound");
        }
        Ok(())
    }

    /// Snapshot a running machine.
    ///
    /// The record carries the machine's workspace and current bindings and
    /// is owned by `owner`, the caller saving it.
    #[instrument(skip_all, fields(machine_id = %id, owner = %owner))]
    pub async fn save(&self, id: &MachineId, owner: &str, description: &str) -> Result<Snapshot> {
        let machine = self.machines.get(id).await?;
        let instance = machine.ready_instance().await?;
        let provider = self.providers.get(machine.machine_type())?;

        let capture = tokio::spawn({
            let provider = Arc::clone(&provider);
            async move { provider.snapshot(&instance).await }
        });
        let reference = capture
            .await
            .map_err(|e| MachineError::Internal(format!("snapshot task failed: {e}")))??;

        let snapshot = Snapshot {
            id: SnapshotId::new(),
            owner: owner.to_string(),
            workspace_id: machine.workspace_id().to_string(),
            image_type: machine.machine_type().to_string(),
            description: description.to_string(),
            created_at: Utc::now(),
            projects: machine.project_bindings().await,
            reference,
        };

        if let Err(e) = self.snapshots.save(snapshot.clone()).await {
            // The record never landed, so the captured data is unreachable.
            if let Err(release_err) = provider.remove_snapshot(&snapshot.reference).await {
                warn!(error = %release_err, "Failed to release orphaned snapshot data");
            }
            return Err(e.into());
        }

        info!(snapshot_id = %snapshot.id, "Snapshot saved");
        Ok(snapshot)
    }

    pub async fn get_snapshot(&self, id: &SnapshotId) -> Result<Snapshot> {
        Ok(self.snapshots.get(id).await?)
    }

    pub async fn get_snapshots(&self, filter: &SnapshotFilter) -> Result<Vec<Snapshot>> {
        Ok(self.snapshots.list(filter).await?)
    }

    /// Delete a snapshot record and, best-effort, its provider-side data.
    #[instrument(skip_all, fields(snapshot_id = %id))]
    pub async fn remove_snapshot(&self, id: &SnapshotId) -> Result<()> {
        let snapshot = self.snapshots.remove(id).await?;

        match self.providers.get(&snapshot.reference.machine_type) {
            Ok(provider) => {
                if let Err(e) = provider.remove_snapshot(&snapshot.reference).await {
                    warn!(error = %e, "Failed to release snapshot data");
                }
            }
            Err(e) => warn!(error = %e, "No provider to release snapshot data"),
        }

        info!("Snapshot removed");
        Ok(())
    }

    /// Destroy every registered machine.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let machines = self.machines.list(&MachineFilter::default()).await;
        info!(count = machines.len(), "Destroying machines");

        for machine in machines {
            match self.destroy(&machine.id()).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(machine_id = %machine.id(), error = %e, "Failed to destroy machine"),
            }
        }
    }
}

async fn wait_destroyed(destroyed: &mut watch::Receiver<bool>) {
    let _ = destroyed.wait_for(|d| *d).await;
}

/// Destroy an instance, deferring to the cleanup worker on failure.
async fn release(
    provider: Arc<dyn InstanceProvider>,
    instance: InstanceRef,
    cleaner: Arc<CleanupWorker>,
) {
    let instance_id = instance.handle().instance_id;
    match provider.destroy(&instance).await {
        Ok(()) => debug!(instance_id = %instance_id, "Instance released"),
        Err(e) => {
            warn!(instance_id = %instance_id, error = %e, "Instance destroy failed, deferring");
            cleaner.submit(provider, instance).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::CleanupWorkerConfig;
    use crate::machine::MachineState;
    use crate::provider::mock::MockProvider;
    use crate::snapshot::InMemorySnapshotStore;

    fn manager_with(provider: MockProvider) -> MachineManager {
        shared_manager(Arc::new(provider))
    }

    fn shared_manager(provider: Arc<MockProvider>) -> MachineManager {
        let providers = ProviderRegistry::new().with(provider).unwrap();
        MachineManager::new(
            providers,
            Arc::new(InMemorySnapshotStore::new()),
            Arc::new(CleanupWorker::new(CleanupWorkerConfig::default())),
        )
    }

    fn recipe() -> Recipe {
        Recipe::new("FROM base", "dockerfile")
    }

    #[tokio::test]
    async fn test_unsupported_type_registers_nothing() {
        let manager = manager_with(MockProvider::new());
        let err = manager
            .create("docker", recipe(), "ws1", "u1", LogSink::discard())
            .await
            .unwrap_err();

        assert!(matches!(err, MachineError::UnsupportedType(_)));
        assert_eq!(manager.machine_count().await, 0);
    }

    #[tokio::test]
    async fn test_timeout_leaves_machine_in_error() {
        let provider = Arc::new(
            MockProvider::new()
                .with_delay(Duration::from_millis(300))
                .with_timeout(Duration::from_millis(50)),
        );
        let manager = shared_manager(Arc::clone(&provider));

        let err = manager
            .create("mock", recipe(), "ws1", "u1", LogSink::discard())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MachineError::Instance(InstanceError::Timeout(_))
        ));

        let machines = manager.get_machines(&MachineFilter::default()).await;
        assert_eq!(machines.len(), 1);
        assert_eq!(machines[0].state().await, MachineState::Error);
        assert!(machines[0].instance().await.is_none());

        // The build was stopped, not left to finish and be reaped.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(provider.provisioned_count(), 0);
        assert_eq!(provider.destroyed_count(), 0);
    }

    #[tokio::test]
    async fn test_destroy_while_creating_cancels_build() {
        let provider = Arc::new(MockProvider::new().with_delay(Duration::from_millis(300)));
        let manager = Arc::new(shared_manager(Arc::clone(&provider)));

        let create = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move {
                manager
                    .create("mock", recipe(), "ws1", "u1", LogSink::discard())
                    .await
            }
        });

        let id = loop {
            let machines = manager.get_machines(&MachineFilter::default()).await;
            if let Some(machine) = machines.first() {
                break machine.id();
            }
            tokio::task::yield_now().await;
        };

        manager.destroy(&id).await.unwrap();
        let err = create.await.unwrap().unwrap_err();
        assert!(matches!(err, MachineError::Instance(InstanceError::Cancelled)));
        assert!(manager.get_machine(&id).await.unwrap_err().is_not_found());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(provider.provisioned_count(), 0);
    }

    #[tokio::test]
    async fn test_saved_snapshot_matches_stored_record() {
        let manager = manager_with(MockProvider::new());
        let machine = manager
            .create("mock", recipe(), "ws1", "u1", LogSink::discard())
            .await
            .unwrap();

        let saved = manager.save(&machine.id(), "u1", "checkpoint").await.unwrap();
        assert_eq!(manager.get_snapshot(&saved.id).await.unwrap(), saved);
    }

    #[tokio::test]
    async fn test_failed_destroy_goes_to_cleaner() {
        let manager = manager_with(MockProvider::new().with_failing_destroys(1));
        let machine = manager
            .create("mock", recipe(), "ws1", "u1", LogSink::discard())
            .await
            .unwrap();

        manager.destroy(&machine.id()).await.unwrap();
        assert_eq!(manager.cleaner().pending().await, 1);
        assert_eq!(manager.cleaner().run_pass().await.destroyed, 1);
    }

    #[tokio::test]
    async fn test_shutdown_destroys_everything() {
        let manager = manager_with(MockProvider::new());
        for ws in ["ws1", "ws2", "ws3"] {
            manager
                .create("mock", recipe(), ws, "u1", LogSink::discard())
                .await
                .unwrap();
        }

        manager.shutdown().await;
        assert_eq!(manager.machine_count().await, 0);
    }
}
