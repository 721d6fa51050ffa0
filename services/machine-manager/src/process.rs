//! Process supervision building blocks shared by instance implementations.
//!
//! - `ProcessCell` holds one process's state machine and its kill switch.
//! - `ProcessTable` is an instance's process set, guarded by a per-instance
//!   lock and paired with a pid allocator that never reuses ids.
//!
//! Providers own the part that actually runs something: they call
//! `ProcessCell::begin_start`, run the workload on a task that listens on the
//! returned kill receiver, and call `ProcessCell::finish` when it ends.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use crate::error::{MachineError, Result};
use crate::provider::{ProcessRef, ProcessStatus};

#[derive(Debug)]
struct CellState {
    status: ProcessStatus,
    pid: u32,
    exit_code: Option<i32>,
    kill_tx: Option<oneshot::Sender<()>>,
}

/// State machine of a single supervised process.
#[derive(Debug)]
pub(crate) struct ProcessCell {
    command_line: String,
    state: Mutex<CellState>,
    exited: watch::Sender<bool>,
}

impl ProcessCell {
    pub(crate) fn new(command_line: impl Into<String>) -> Self {
        let (exited, _) = watch::channel(false);
        Self {
            command_line: command_line.into(),
            state: Mutex::new(CellState {
                status: ProcessStatus::NotStarted,
                pid: 0,
                exit_code: None,
                kill_tx: None,
            }),
            exited,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CellState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn command_line(&self) -> &str {
        &self.command_line
    }

    pub(crate) fn pid(&self) -> u32 {
        self.lock().pid
    }

    pub(crate) fn status(&self) -> ProcessStatus {
        self.lock().status
    }

    pub(crate) fn exit_code(&self) -> Option<i32> {
        self.lock().exit_code
    }

    /// `NotStarted -> Running`. Allocates the pid and returns the receiver
    /// the workload must watch for kill requests.
    pub(crate) fn begin_start(&self, pids: &PidAllocator) -> Result<oneshot::Receiver<()>> {
        let mut state = self.lock();
        if state.status != ProcessStatus::NotStarted {
            return Err(MachineError::conflict(format!(
                "process {} ({}) is already started",
                state.pid, self.command_line
            )));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        state.pid = pids.next();
        state.status = ProcessStatus::Running;
        state.kill_tx = Some(kill_tx);
        debug!(pid = state.pid, command = %self.command_line, "Process started");
        Ok(kill_rx)
    }

    /// `Running -> Terminated`. Idempotent.
    pub(crate) fn finish(&self, exit_code: Option<i32>) {
        {
            let mut state = self.lock();
            if state.status == ProcessStatus::Terminated {
                return;
            }
            state.status = ProcessStatus::Terminated;
            state.exit_code = exit_code;
            state.kill_tx = None;
            debug!(pid = state.pid, exit_code = ?exit_code, "Process terminated");
        }
        self.exited.send_replace(true);
    }

    /// Wait until the process reaches `Terminated`.
    pub(crate) async fn wait(&self) {
        let mut exited = self.exited.subscribe();
        let _ = exited.wait_for(|done| *done).await;
    }

    /// Request termination and wait for it.
    ///
    /// A process that was never started is terminated on the spot. Killing a
    /// terminated process is a no-op.
    pub(crate) async fn kill(&self) -> Result<()> {
        let kill_tx = {
            let mut state = self.lock();
            let status = state.status;
            match status {
                ProcessStatus::Terminated => return Ok(()),
                ProcessStatus::NotStarted => {
                    drop(state);
                    self.finish(None);
                    return Ok(());
                }
                ProcessStatus::Running => state.kill_tx.take(),
            }
        };

        // A concurrent kill may already have taken the switch.
        if let Some(kill_tx) = kill_tx {
            if kill_tx.send(()).is_err() {
                warn!(command = %self.command_line, "Process supervisor is gone");
            }
        }

        self.wait().await;
        Ok(())
    }
}

/// Monotonic pid source for one instance. Pids start at 1 and are never
/// reused.
#[derive(Debug)]
pub(crate) struct PidAllocator(AtomicU32);

impl PidAllocator {
    pub(crate) fn new() -> Self {
        Self(AtomicU32::new(1))
    }

    pub(crate) fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

/// An instance's processes in creation order.
#[derive(Debug)]
pub(crate) struct ProcessTable {
    processes: tokio::sync::Mutex<Vec<ProcessRef>>,
    pids: Arc<PidAllocator>,
}

impl ProcessTable {
    pub(crate) fn new() -> Self {
        Self {
            processes: tokio::sync::Mutex::new(Vec::new()),
            pids: Arc::new(PidAllocator::new()),
        }
    }

    pub(crate) fn pids(&self) -> Arc<PidAllocator> {
        Arc::clone(&self.pids)
    }

    pub(crate) async fn insert(&self, process: ProcessRef) {
        self.processes.lock().await.push(process);
    }

    pub(crate) async fn get(&self, pid: u32) -> Result<ProcessRef> {
        if pid == 0 {
            return Err(MachineError::not_found("process 0"));
        }
        self.processes
            .lock()
            .await
            .iter()
            .find(|p| p.pid() == pid)
            .cloned()
            .ok_or_else(|| MachineError::not_found(format!("process {pid}")))
    }

    pub(crate) async fn list(&self) -> Vec<ProcessRef> {
        self.processes.lock().await.clone()
    }

    /// Kill every live process. The table stays usable while kills are
    /// waited on.
    pub(crate) async fn kill_all(&self) {
        let processes = self.list().await;
        for process in processes.iter().filter(|p| p.is_alive()) {
            if let Err(e) = process.kill().await {
                warn!(pid = process.pid(), error = %e, "Failed to kill process");
            }
        }
    }
}
