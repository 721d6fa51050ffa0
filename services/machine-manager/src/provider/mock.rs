//! Mock instance provider for testing and development.
//!
//! Instances are purely in-memory. Processes understand two commands:
//!
//! - `echo <text>` writes `<text>` to the output and exits 0
//! - `sleep <secs>` stays alive for `<secs>` (fractions allowed) or until killed
//!
//! Anything else exits 0 immediately without output.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use berth_id::InstanceId;
use tokio::sync::oneshot;
use tracing::{debug, info};

use super::{
    BuildCancel, Instance, InstanceHandle, InstanceProcess, InstanceProvider, InstanceRef, ProcessRef,
    ProcessStatus, SnapshotRef, DEFAULT_PROVISION_TIMEOUT,
};
use crate::error::{InstanceError, MachineError, Result};
use crate::machine::Recipe;
use crate::process::{PidAllocator, ProcessCell, ProcessTable};
use crate::sink::LogSink;

/// Machine type the mock provider registers under unless told otherwise.
pub const MOCK_MACHINE_TYPE: &str = "mock";

/// Mock provider for testing and development.
pub struct MockProvider {
    machine_type: String,

    /// Simulated build time for provision and restore.
    delay: Duration,

    timeout: Duration,

    /// Whether provision should "fail".
    fail_provision: bool,

    /// Whether restore should "fail".
    fail_restore: bool,

    /// Number of upcoming destroy calls that should fail.
    failing_destroys: AtomicU64,

    /// Counter for snapshot locations.
    snapshot_counter: AtomicU64,

    provisioned: AtomicU64,
    destroyed: AtomicU64,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            machine_type: MOCK_MACHINE_TYPE.to_string(),
            delay: Duration::from_millis(10),
            timeout: DEFAULT_PROVISION_TIMEOUT,
            fail_provision: false,
            fail_restore: false,
            failing_destroys: AtomicU64::new(0),
            snapshot_counter: AtomicU64::new(0),
            provisioned: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
        }
    }

    /// Create a mock provider that fails every provision and restore.
    pub fn failing() -> Self {
        Self {
            fail_provision: true,
            fail_restore: true,
            ..Self::new()
        }
    }

    /// Provision normally but fail every restore.
    pub fn with_failing_restores(mut self) -> Self {
        self.fail_restore = true;
        self
    }

    /// Register under a different machine type.
    pub fn with_type(mut self, machine_type: impl Into<String>) -> Self {
        self.machine_type = machine_type.into();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fail the next `count` destroy calls.
    pub fn with_failing_destroys(self, count: u64) -> Self {
        self.failing_destroys.store(count, Ordering::SeqCst);
        self
    }

    /// Successful provisions and restores so far.
    pub fn provisioned_count(&self) -> u64 {
        self.provisioned.load(Ordering::SeqCst)
    }

    /// Successful destroys so far.
    pub fn destroyed_count(&self) -> u64 {
        self.destroyed.load(Ordering::SeqCst)
    }

    async fn build(
        &self,
        source: &str,
        logs: &LogSink,
        mut cancel: BuildCancel,
    ) -> Result<InstanceRef, InstanceError> {
        tokio::select! {
            _ = tokio::time::sleep(self.delay) => {}
            _ = cancel.cancelled() => {
                debug!(source = %source, "[MOCK] Build abandoned");
                return Err(InstanceError::Cancelled);
            }
        }

        let instance = MockInstance::new(&self.machine_type);
        self.provisioned.fetch_add(1, Ordering::SeqCst);
        logs.send_line(format!("Successfully built {}", instance.handle.instance_id));
        debug!(
            instance_id = %instance.handle.instance_id,
            source = %source,
            "[MOCK] Instance ready"
        );
        Ok(Arc::new(instance))
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceProvider for MockProvider {
    fn machine_type(&self) -> &str {
        &self.machine_type
    }

    fn provision_timeout(&self) -> Duration {
        self.timeout
    }

    async fn provision(
        &self,
        recipe: &Recipe,
        logs: LogSink,
        cancel: BuildCancel,
    ) -> Result<InstanceRef, InstanceError> {
        info!(
            machine_type = %self.machine_type,
            recipe_type = %recipe.recipe_type,
            "[MOCK] Provisioning instance"
        );

        for (step, line) in recipe.script.lines().enumerate() {
            logs.send_line(format!("Step {} : {}", step + 1, line));
        }

        if self.fail_provision {
            tokio::time::sleep(self.delay).await;
            return Err(InstanceError::Provision(
                "mock provider configured to fail".to_string(),
            ));
        }

        self.build("recipe", &logs, cancel).await
    }

    async fn restore(
        &self,
        snapshot: &SnapshotRef,
        logs: LogSink,
        cancel: BuildCancel,
    ) -> Result<InstanceRef, InstanceError> {
        info!(location = %snapshot.location, "[MOCK] Restoring instance");
        logs.send_line(format!("Restoring from {}", snapshot.location));

        if self.fail_restore {
            tokio::time::sleep(self.delay).await;
            return Err(InstanceError::Restore(
                "mock provider configured to fail".to_string(),
            ));
        }

        self.build(&snapshot.location, &logs, cancel).await
    }

    async fn snapshot(&self, instance: &InstanceRef) -> Result<SnapshotRef, InstanceError> {
        let counter = self.snapshot_counter.fetch_add(1, Ordering::SeqCst);
        let location = format!("mock://snapshots/{:016x}", counter);
        info!(
            instance_id = %instance.handle().instance_id,
            location = %location,
            "[MOCK] Capturing snapshot"
        );
        Ok(SnapshotRef {
            machine_type: self.machine_type.clone(),
            location,
        })
    }

    async fn destroy(&self, instance: &InstanceRef) -> Result<(), InstanceError> {
        let handle = instance.handle();
        info!(instance_id = %handle.instance_id, "[MOCK] Destroying instance");

        let should_fail = self
            .failing_destroys
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(InstanceError::Destroy(format!(
                "mock provider refused to destroy {}",
                handle.instance_id
            )));
        }

        instance.kill_all().await;
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        debug!(instance_id = %handle.instance_id, "[MOCK] Instance destroyed");
        Ok(())
    }
}

/// In-memory instance.
#[derive(Debug)]
pub struct MockInstance {
    handle: InstanceHandle,
    processes: ProcessTable,
}

impl MockInstance {
    fn new(machine_type: &str) -> Self {
        let instance_id = InstanceId::new();
        Self {
            handle: InstanceHandle {
                location: format!("mock://{instance_id}"),
                instance_id,
                machine_type: machine_type.to_string(),
            },
            processes: ProcessTable::new(),
        }
    }
}

#[async_trait]
impl Instance for MockInstance {
    fn handle(&self) -> &InstanceHandle {
        &self.handle
    }

    async fn create_process(&self, command_line: &str) -> Result<ProcessRef> {
        let process: ProcessRef = Arc::new(MockProcess {
            cell: Arc::new(ProcessCell::new(command_line)),
            pids: self.processes.pids(),
        });
        self.processes.insert(Arc::clone(&process)).await;
        Ok(process)
    }

    async fn get_process(&self, pid: u32) -> Result<ProcessRef> {
        self.processes.get(pid).await
    }

    async fn list_processes(&self) -> Vec<ProcessRef> {
        self.processes.list().await
    }

    async fn kill_all(&self) {
        self.processes.kill_all().await;
    }
}

/// What a mock process does once started.
#[derive(Debug, Clone, PartialEq)]
enum MockCommand {
    Echo(String),
    Sleep(Duration),
    Exit,
}

impl MockCommand {
    fn parse(command_line: &str) -> Self {
        let command_line = command_line.trim();
        let (program, args) = command_line
            .split_once(char::is_whitespace)
            .unwrap_or((command_line, ""));

        match program {
            "echo" => Self::Echo(args.trim().to_string()),
            "sleep" => args
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .map(Self::Sleep)
                .unwrap_or(Self::Exit),
            _ => Self::Exit,
        }
    }
}

/// Simulated process.
#[derive(Debug)]
pub struct MockProcess {
    cell: Arc<ProcessCell>,
    pids: Arc<PidAllocator>,
}

async fn run(
    command: MockCommand,
    output: LogSink,
    kill_rx: oneshot::Receiver<()>,
    cell: Arc<ProcessCell>,
) {
    match command {
        MockCommand::Echo(text) => {
            output.send_line(text);
            cell.finish(Some(0));
        }
        MockCommand::Sleep(duration) => {
            tokio::select! {
                _ = tokio::time::sleep(duration) => cell.finish(Some(0)),
                Ok(()) = kill_rx => {
                    debug!(pid = cell.pid(), "[MOCK] Process killed");
                    cell.finish(None);
                }
            }
        }
        MockCommand::Exit => cell.finish(Some(0)),
    }
}

#[async_trait]
impl InstanceProcess for MockProcess {
    fn pid(&self) -> u32 {
        self.cell.pid()
    }

    fn command_line(&self) -> &str {
        self.cell.command_line()
    }

    fn status(&self) -> ProcessStatus {
        self.cell.status()
    }

    fn exit_code(&self) -> Option<i32> {
        self.cell.exit_code()
    }

    async fn start(&self, output: Option<LogSink>) -> Result<()> {
        let kill_rx = self.cell.begin_start(&self.pids)?;
        let command = MockCommand::parse(self.cell.command_line());
        debug!(pid = self.cell.pid(), command = ?command, "[MOCK] Starting process");

        let attached = output.is_some();
        let task = tokio::spawn(run(
            command,
            output.unwrap_or_default(),
            kill_rx,
            Arc::clone(&self.cell),
        ));

        if attached {
            task.await
                .map_err(|e| MachineError::Internal(format!("mock process task failed: {e}")))?;
        }
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        self.cell.kill().await
    }
}
