//! Local instance provider.
//!
//! Every instance is a directory under `<data_dir>/instances`. The recipe
//! script and every process run through `sh -c` with the instance directory
//! as working directory. Snapshots are directory copies kept under
//! `<data_dir>/snapshots`.
//!
//! Each shell leads its own process group. Killing a process signals the
//! whole group, so pipelines and background jobs it spawned go with it.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use berth_id::{InstanceId, Token};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::{
    BuildCancel, Instance, InstanceHandle, InstanceProcess, InstanceProvider, InstanceRef, ProcessRef,
    ProcessStatus, SnapshotRef, DEFAULT_PROVISION_TIMEOUT,
};
use crate::error::{InstanceError, MachineError, Result};
use crate::machine::Recipe;
use crate::process::{PidAllocator, ProcessCell, ProcessTable};
use crate::sink::LogSink;

pub const LOCAL_MACHINE_TYPE: &str = "local";

/// Directory-backed provider.
pub struct LocalProvider {
    instances_dir: PathBuf,
    snapshots_dir: PathBuf,
    timeout: Duration,
}

impl LocalProvider {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            instances_dir: data_dir.join("instances"),
            snapshots_dir: data_dir.join("snapshots"),
            timeout: DEFAULT_PROVISION_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn instances_dir(&self) -> &Path {
        &self.instances_dir
    }

    pub fn snapshots_dir(&self) -> &Path {
        &self.snapshots_dir
    }

    /// Create an empty directory for a new instance.
    async fn allocate(&self) -> io::Result<LocalInstance> {
        let instance_id = InstanceId::new();
        let dir = self.instances_dir.join(instance_id.to_string());
        tokio::fs::create_dir_all(&dir).await?;
        Ok(LocalInstance::new(instance_id, dir))
    }
}

#[async_trait]
impl InstanceProvider for LocalProvider {
    fn machine_type(&self) -> &str {
        LOCAL_MACHINE_TYPE
    }

    fn provision_timeout(&self) -> Duration {
        self.timeout
    }

    #[instrument(skip(self, recipe, logs, cancel), fields(recipe_type = %recipe.recipe_type))]
    async fn provision(
        &self,
        recipe: &Recipe,
        logs: LogSink,
        mut cancel: BuildCancel,
    ) -> Result<InstanceRef, InstanceError> {
        let instance = self.allocate().await?;
        info!(
            instance_id = %instance.handle.instance_id,
            dir = %instance.dir.display(),
            "Provisioning local instance"
        );

        let status = match run_script(&recipe.script, &instance.dir, &logs, &mut cancel).await {
            Ok(Some(status)) => status,
            Ok(None) => {
                discard_dir(&instance.dir).await;
                info!(instance_id = %instance.handle.instance_id, "Build abandoned");
                return Err(InstanceError::Cancelled);
            }
            Err(e) => {
                discard_dir(&instance.dir).await;
                return Err(InstanceError::Provision(format!(
                    "failed to run recipe script: {e}"
                )));
            }
        };

        if !status.success() {
            discard_dir(&instance.dir).await;
            return Err(InstanceError::Provision(format!(
                "recipe script exited with {status}"
            )));
        }

        debug!(instance_id = %instance.handle.instance_id, "Local instance ready");
        Ok(Arc::new(instance))
    }

    #[instrument(skip(self, snapshot, logs, cancel), fields(location = %snapshot.location))]
    async fn restore(
        &self,
        snapshot: &SnapshotRef,
        logs: LogSink,
        cancel: BuildCancel,
    ) -> Result<InstanceRef, InstanceError> {
        let source = PathBuf::from(&snapshot.location);
        if !tokio::fs::try_exists(&source).await? {
            return Err(InstanceError::Restore(format!(
                "snapshot data missing at {}",
                source.display()
            )));
        }

        let instance = self.allocate().await?;
        logs.send_line(format!("Restoring from {}", source.display()));

        if let Err(e) = copy_tree(source, instance.dir.clone()).await {
            discard_dir(&instance.dir).await;
            return Err(InstanceError::Restore(format!("failed to copy snapshot: {e}")));
        }

        // A blocking copy cannot be interrupted, so the signal is checked after it.
        if cancel.is_cancelled() {
            discard_dir(&instance.dir).await;
            info!(instance_id = %instance.handle.instance_id, "Restore abandoned");
            return Err(InstanceError::Cancelled);
        }

        logs.send_line(format!("Restored {}", instance.handle.instance_id));
        Ok(Arc::new(instance))
    }

    async fn snapshot(&self, instance: &InstanceRef) -> Result<SnapshotRef, InstanceError> {
        let handle = instance.handle();
        let target = self
            .snapshots_dir
            .join(format!("{}-{}", handle.instance_id, Token::random()));

        info!(
            instance_id = %handle.instance_id,
            target = %target.display(),
            "Capturing local snapshot"
        );

        tokio::fs::create_dir_all(&self.snapshots_dir).await?;
        copy_tree(PathBuf::from(&handle.location), target.clone())
            .await
            .map_err(|e| InstanceError::Snapshot(format!("failed to copy instance: {e}")))?;

        Ok(SnapshotRef {
            machine_type: LOCAL_MACHINE_TYPE.to_string(),
            location: target.to_string_lossy().into_owned(),
        })
    }

    async fn destroy(&self, instance: &InstanceRef) -> Result<(), InstanceError> {
        let handle = instance.handle();
        info!(instance_id = %handle.instance_id, "Destroying local instance");

        instance.kill_all().await;
        match tokio::fs::remove_dir_all(&handle.location).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(InstanceError::Destroy(format!(
                "failed to remove {}: {e}",
                handle.location
            ))),
        }
    }

    async fn remove_snapshot(&self, snapshot: &SnapshotRef) -> Result<(), InstanceError> {
        match tokio::fs::remove_dir_all(&snapshot.location).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn discard_dir(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), error = %e, "Failed to remove instance directory");
        }
    }
}

/// Recursively copy `from` into `to`, creating `to`.
async fn copy_tree(from: PathBuf, to: PathBuf) -> io::Result<()> {
    tokio::task::spawn_blocking(move || copy_tree_blocking(&from, &to))
        .await
        .map_err(io::Error::other)?
}

/// Symlinks are copied as links, never followed.
fn copy_tree_blocking(from: &Path, to: &Path) -> io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            std::os::unix::fs::symlink(std::fs::read_link(entry.path())?, &target)?;
        } else if file_type.is_dir() {
            copy_tree_blocking(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// `sh -c` as the leader of a new process group.
fn shell(command_line: &str, dir: &Path) -> Command {
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(command_line)
        .current_dir(dir)
        .stdin(Stdio::null())
        .process_group(0)
        .kill_on_drop(true);
    command
}

/// Process group led by a child spawned through [`shell`].
#[derive(Debug, Clone, Copy)]
struct ProcessGroup(Option<Pid>);

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self(
            child
                .id()
                .and_then(|id| i32::try_from(id).ok())
                .map(Pid::from_raw),
        )
    }

    /// SIGKILL every member. A group that is already gone is fine.
    fn kill(self) {
        let Some(pgid) = self.0 else {
            return;
        };
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(pgid = pgid.as_raw(), error = %e, "Failed to signal process group"),
        }
    }
}

/// Forward each line of `stream` to `sink` until EOF.
fn forward_lines<R>(stream: R, sink: LogSink) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            sink.send_line(line);
        }
    })
}

fn forward_output(child: &mut Child, sink: &LogSink) -> Vec<JoinHandle<()>> {
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(forward_lines(stdout, sink.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(forward_lines(stderr, sink.clone()));
    }
    readers
}

/// Run a build script. Returns `None` if `cancel` fired first, after the
/// script's whole process group is dead.
async fn run_script(
    script: &str,
    dir: &Path,
    logs: &LogSink,
    cancel: &mut BuildCancel,
) -> io::Result<Option<ExitStatus>> {
    let mut child = shell(script, dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let group = ProcessGroup::of(&child);

    let readers = forward_output(&mut child, logs);
    let status = tokio::select! {
        status = child.wait() => Some(status?),
        _ = cancel.cancelled() => {
            debug!("Killing abandoned build script");
            group.kill();
            child.wait().await?;
            None
        }
    };

    group.kill();
    for reader in readers {
        let _ = reader.await;
    }
    Ok(status)
}

/// Instance backed by a host directory.
#[derive(Debug)]
pub struct LocalInstance {
    handle: InstanceHandle,
    dir: PathBuf,
    processes: ProcessTable,
}

impl LocalInstance {
    fn new(instance_id: InstanceId, dir: PathBuf) -> Self {
        Self {
            handle: InstanceHandle {
                instance_id,
                machine_type: LOCAL_MACHINE_TYPE.to_string(),
                location: dir.to_string_lossy().into_owned(),
            },
            dir,
            processes: ProcessTable::new(),
        }
    }
}

#[async_trait]
impl Instance for LocalInstance {
    fn handle(&self) -> &InstanceHandle {
        &self.handle
    }

    async fn create_process(&self, command_line: &str) -> Result<ProcessRef> {
        let process: ProcessRef = Arc::new(LocalProcess {
            cell: Arc::new(ProcessCell::new(command_line)),
            pids: self.processes.pids(),
            dir: self.dir.clone(),
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

/// `sh -c` child of a local instance.
#[derive(Debug)]
pub struct LocalProcess {
    cell: Arc<ProcessCell>,
    pids: Arc<PidAllocator>,
    dir: PathBuf,
}

/// Own the child until it exits or a kill is requested.
///
/// The process counts as terminated once its shell has exited and the rest
/// of its group is killed.
async fn supervise(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    readers: Vec<JoinHandle<()>>,
    cell: Arc<ProcessCell>,
) {
    let group = ProcessGroup::of(&child);
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = kill_rx => {
            debug!(pid = cell.pid(), "Killing process group");
            group.kill();
            child.wait().await
        }
    };

    // Stragglers would otherwise hold the output pipes open.
    group.kill();

    // Output must be fully delivered before the process reads as terminated.
    for reader in readers {
        let _ = reader.await;
    }

    let exit_code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(pid = cell.pid(), error = %e, "Failed to wait for process");
            None
        }
    };
    cell.finish(exit_code);
}

#[async_trait]
impl InstanceProcess for LocalProcess {
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

        let mut command = shell(self.cell.command_line(), &self.dir);
        if output.is_some() {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.cell.finish(None);
                return Err(InstanceError::Process(format!(
                    "failed to spawn {}: {e}",
                    self.cell.command_line()
                ))
                .into());
            }
        };

        let readers = match &output {
            Some(sink) => forward_output(&mut child, sink),
            None => Vec::new(),
        };
        let task = tokio::spawn(supervise(child, kill_rx, readers, Arc::clone(&self.cell)));

        if output.is_some() {
            task.await
                .map_err(|e| MachineError::Internal(format!("process supervisor failed: {e}")))?;
        }
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        self.cell.kill().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::drain;
    use tempfile::TempDir;

    fn provider(dir: &TempDir) -> LocalProvider {
        LocalProvider::new(dir.path())
    }

    async fn provisioned(provider: &LocalProvider, script: &str) -> InstanceRef {
        provider
            .provision(&Recipe::new(script, "shell"), LogSink::discard(), BuildCancel::never())
            .await
            .unwrap()
    }

    fn instance_count(provider: &LocalProvider) -> usize {
        std::fs::read_dir(provider.instances_dir())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_provision_runs_script_in_instance_dir() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);
        let (logs, mut rx) = LogSink::channel();

        let instance = provider
            .provision(
                &Recipe::new("echo building && touch built.txt", "shell"),
                logs,
                BuildCancel::never(),
            )
            .await
            .unwrap();

        let location = PathBuf::from(&instance.handle().location);
        assert!(location.starts_with(provider.instances_dir()));
        assert!(location.join("built.txt").exists());
        assert_eq!(drain(&mut rx), vec!["building".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_script_removes_instance_dir() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);

        let result = provider
            .provision(
                &Recipe::new("echo oops >&2; exit 3", "shell"),
                LogSink::discard(),
                BuildCancel::never(),
            )
            .await;

        assert!(matches!(result, Err(InstanceError::Provision(_))));
        assert_eq!(instance_count(&provider), 0);
    }

    #[tokio::test]
    async fn test_attached_process_streams_output() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);
        let instance = provisioned(&provider, "true").await;

        let process = instance.create_process("echo one; echo two; exit 7").await.unwrap();
        let (sink, mut rx) = LogSink::channel();
        process.start(Some(sink)).await.unwrap();

        assert_eq!(process.status(), ProcessStatus::Terminated);
        assert_eq!(process.exit_code(), Some(7));
        assert_eq!(drain(&mut rx), vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn test_detached_process_can_be_killed() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);
        let instance = provisioned(&provider, "true").await;

        let process = instance.create_process("sleep 30").await.unwrap();
        process.start(None).await.unwrap();
        assert!(process.is_alive());
        assert_eq!(process.pid(), 1);

        process.kill().await.unwrap();
        assert!(!process.is_alive());
        assert!(process.start(None).await.unwrap_err().is_conflict());
        process.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_restore_copies_files() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);
        let instance = provisioned(&provider, "mkdir -p src && echo v1 > src/state").await;

        let reference = provider.snapshot(&instance).await.unwrap();
        assert!(PathBuf::from(&reference.location).starts_with(provider.snapshots_dir()));

        let restored = provider
            .restore(&reference, LogSink::discard(), BuildCancel::never())
            .await
            .unwrap();
        let state = std::fs::read_to_string(
            PathBuf::from(&restored.handle().location).join("src/state"),
        )
        .unwrap();
        assert_eq!(state.trim(), "v1");

        provider.remove_snapshot(&reference).await.unwrap();
        provider.remove_snapshot(&reference).await.unwrap();
        assert!(matches!(
            provider
                .restore(&reference, LogSink::discard(), BuildCancel::never())
                .await,
            Err(InstanceError::Restore(_))
        ));
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);
        let instance = provisioned(&provider, "true").await;

        let process = instance.create_process("sleep 30").await.unwrap();
        process.start(None).await.unwrap();

        provider.destroy(&instance).await.unwrap();
        assert!(!PathBuf::from(&instance.handle().location).exists());
        assert!(!process.is_alive());

        provider.destroy(&instance).await.unwrap();
    }

    #[tokio::test]
    async fn test_kill_reaches_child_processes() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);
        let instance = provisioned(&provider, "true").await;

        let process = instance.create_process("sleep 30; echo done").await.unwrap();
        let (sink, mut rx) = LogSink::channel();
        let attached = tokio::spawn({
            let process = Arc::clone(&process);
            async move { process.start(Some(sink)).await }
        });

        while !process.is_alive() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tokio::time::timeout(Duration::from_secs(5), process.kill())
            .await
            .expect("kill waited for the child process")
            .unwrap();
        assert!(!process.is_alive());
        assert_eq!(process.exit_code(), None);

        attached.await.unwrap().unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_background_job_does_not_outlive_process() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);
        let instance = provisioned(&provider, "true").await;

        let process = instance
            .create_process("(sleep 1; touch late) & echo started")
            .await
            .unwrap();
        let (sink, mut rx) = LogSink::channel();
        tokio::time::timeout(Duration::from_secs(5), process.start(Some(sink)))
            .await
            .expect("background job held the output open")
            .unwrap();

        assert_eq!(process.exit_code(), Some(0));
        assert_eq!(drain(&mut rx), vec!["started".to_string()]);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!PathBuf::from(&instance.handle().location).join("late").exists());
    }

    #[tokio::test]
    async fn test_cancelled_build_is_killed_and_discarded() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);
        let marker = dir.path().join("finished");
        let (tx, cancel) = BuildCancel::new();

        let build = tokio::spawn({
            let script = format!("sleep 1; touch {}", marker.display());
            async move {
                provider
                    .provision(&Recipe::new(script, "shell"), LogSink::discard(), cancel)
                    .await
                    .map(|_| ())
            }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send_replace(true);

        let result = tokio::time::timeout(Duration::from_secs(5), build)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(InstanceError::Cancelled)));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
        assert_eq!(instance_count(&LocalProvider::new(dir.path())), 0);
    }

    #[tokio::test]
    async fn test_cancelled_restore_is_discarded() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);
        let instance = provisioned(&provider, "echo v1 > state").await;
        let reference = provider.snapshot(&instance).await.unwrap();
        provider.destroy(&instance).await.unwrap();

        let (tx, cancel) = BuildCancel::new();
        tx.send_replace(true);
        let result = provider.restore(&reference, LogSink::discard(), cancel).await;

        assert!(matches!(result, Err(InstanceError::Cancelled)));
        assert_eq!(instance_count(&provider), 0);
    }

    #[tokio::test]
    async fn test_snapshot_copies_symlinks_as_links() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);
        let instance = provisioned(
            &provider,
            "mkdir data && echo v1 > data/state && ln -s data current && ln -s missing dangling",
        )
        .await;

        let reference = provider.snapshot(&instance).await.unwrap();
        let copy = PathBuf::from(&reference.location);

        let link = copy.join("current");
        assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(std::fs::read_link(&link).unwrap(), PathBuf::from("data"));
        assert_eq!(
            std::fs::read_link(copy.join("dangling")).unwrap(),
            PathBuf::from("missing")
        );
        assert!(copy.join("data/state").is_file());
    }
}
