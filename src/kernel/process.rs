//! Child process lifecycle
//!
//! The manager owns every process spawned through the kernel. For each child
//! it runs one reader task per output stream and one watcher task that reaps
//! the child, so callers never hold the table lock across an await.
//!
//! Output and exit notifications go out through a lossless [`Fanout`]. The
//! exit event for a process is emitted only after its readers have drained,
//! so every output chunk a subscriber sees precedes the exit.
//!
//! Stdin is fed by a writer task per process. Writes queue in call order and
//! a child that never reads its stdin only stalls the callers awaiting that
//! one process.

use super::fanout::Fanout;
use super::protocol::StdStream;
use super::sandbox::{ResourceLimits, SandboxPolicy, SandboxWrapper, UlimitWrapper};
use super::store::{
    now_millis, ProcessRecord, ProcessStore, RecordStatus, StoreError, FINISHED_RECORD_LIMIT,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const READ_CHUNK: usize = 8192;
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Exit code reported for a process terminated by a signal
pub const SIGNAL_EXIT_CODE: i32 = -1;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Process already exists: {0}")]
    AlreadyExists(String),

    #[error("Process not found: {0}")]
    NotFound(String),

    #[error("Empty command for process {0}")]
    EmptyCommand(String),

    #[error("Failed to spawn process {id}: {source}")]
    Spawn {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Stdin not available for process {0}")]
    StdinUnavailable(String),

    #[error("Process {0} was recovered from a previous session and cannot be controlled")]
    NotControllable(String),

    #[error("Failed to write to process {id}: {source}")]
    Write {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, ProcessError>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceLimits>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxPolicy>,
}

impl ProcessOptions {
    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn sandbox(mut self, policy: SandboxPolicy) -> Self {
        self.sandbox = Some(policy);
        self
    }

    fn needs_wrapping(&self) -> bool {
        self.sandbox.is_some() || self.limits.as_ref().is_some_and(|l| !l.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    Output {
        id: String,
        stream: StdStream,
        data: Bytes,
    },
    Exit {
        id: String,
        pid: Option<u32>,
        code: i32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Running,
    Exited,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStatus {
    pub state: ProcessState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl ProcessStatus {
    fn unknown() -> Self {
        Self {
            state: ProcessState::Unknown,
            pid: None,
            exit_code: None,
        }
    }
}

/// What [`ProcessManager::recover`] found in the persisted records
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RecoveryReport {
    /// Still alive, tracked for status queries only
    pub adopted: Vec<String>,
    /// Gone while the daemon was down, now `abnormal_exit`
    pub vanished: Vec<String>,
}

/// Resolves once a spawned process has exited
pub struct ExitWatcher {
    rx: watch::Receiver<Option<i32>>,
}

impl ExitWatcher {
    /// Exit code, or `None` if the watcher task went away without reporting
    pub async fn wait(mut self) -> Option<i32> {
        match self.rx.wait_for(|code| code.is_some()).await {
            Ok(code) => *code,
            Err(_) => None,
        }
    }
}

/// Resolves once a queued stdin write reached the pipe
pub struct StdinWrite {
    id: String,
    len: usize,
    rx: oneshot::Receiver<std::io::Result<()>>,
}

impl StdinWrite {
    pub async fn finish(self) -> Result<()> {
        match self.rx.await {
            Ok(Ok(())) => {
                trace!(id = %self.id, "Wrote {} bytes to stdin", self.len);
                Ok(())
            }
            Ok(Err(source)) => Err(ProcessError::Write { id: self.id, source }),
            Err(_) => Err(ProcessError::StdinUnavailable(self.id)),
        }
    }
}

type StdinRequest = (Bytes, oneshot::Sender<std::io::Result<()>>);

/// Handles to a child this session spawned
struct Control {
    stdin: Option<mpsc::UnboundedSender<StdinRequest>>,
    kill: CancellationToken,
    exit_rx: watch::Receiver<Option<i32>>,
}

struct TrackedProcess {
    record: ProcessRecord,
    /// `None` for processes adopted by [`ProcessManager::recover`]
    control: Option<Control>,
}

impl TrackedProcess {
    fn is_running(&self) -> bool {
        self.record.status == RecordStatus::Running
    }

    /// An adopted process is only known by pid. Mark it gone once the pid
    /// stops answering; returns the record to persist if that happened.
    fn reap_if_vanished(&mut self, id: &str) -> Option<ProcessRecord> {
        if self.control.is_some() || !self.is_running() {
            return None;
        }
        if self.record.pid.is_some_and(pid_alive) {
            return None;
        }
        if !self.record.finish(RecordStatus::AbnormalExit, None) {
            return None;
        }
        info!(id = %id, "Recovered process is gone");
        Some(self.record.clone())
    }
}

struct Shared {
    processes: Mutex<HashMap<String, TrackedProcess>>,
    store: Arc<dyn ProcessStore>,
    wrapper: Arc<dyn SandboxWrapper>,
    events: Fanout<ProcessEvent>,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, HashMap<String, TrackedProcess>> {
        self.processes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, record: &ProcessRecord) {
        if let Err(e) = self.store.save(record) {
            warn!(id = %record.id, "Failed to persist process record: {}", e);
        }
    }

    /// Record the exit and notify while holding the table, so a respawn of the
    /// same id cannot interleave with the old process's exit event. The
    /// snapshot write happens after the table is released.
    fn mark_exited(&self, id: &str, pid: Option<u32>, code: i32) {
        let record = {
            let mut table = self.table();
            let Some(tracked) = table.get_mut(id) else {
                return;
            };
            if tracked.record.pid != pid || !tracked.record.finish(RecordStatus::Exited, Some(code)) {
                return;
            }
            if let Some(control) = tracked.control.as_mut() {
                control.stdin = None;
            }
            let record = tracked.record.clone();
            self.events.emit(ProcessEvent::Exit {
                id: id.to_string(),
                pid,
                code,
            });
            prune_finished(&mut table);
            record
        };
        self.persist(&record);
    }
}

/// Spawns, controls and reaps child processes
#[derive(Clone)]
pub struct ProcessManager {
    shared: Arc<Shared>,
}

impl ProcessManager {
    pub fn new(store: Arc<dyn ProcessStore>) -> Self {
        Self::with_wrapper(store, Arc::new(UlimitWrapper::new()))
    }

    pub fn with_wrapper(store: Arc<dyn ProcessStore>, wrapper: Arc<dyn SandboxWrapper>) -> Self {
        Self {
            shared: Arc::new(Shared {
                processes: Mutex::new(HashMap::new()),
                store,
                wrapper,
                events: Fanout::new(),
            }),
        }
    }

    /// Whether pause/resume can work on this platform
    pub fn supports_job_control() -> bool {
        cfg!(unix)
    }

    /// Receive every output and exit event emitted from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ProcessEvent> {
        self.shared.events.subscribe()
    }

    /// Spawn `command` under `id`. Must be called from within a Tokio runtime.
    ///
    /// Fails if `id` is tracked and still running. An id whose process already
    /// exited is replaced.
    pub fn spawn(
        &self,
        id: &str,
        command: &[String],
        options: ProcessOptions,
        creator_id: Option<String>,
    ) -> Result<Option<u32>> {
        if command.is_empty() {
            return Err(ProcessError::EmptyCommand(id.to_string()));
        }

        let argv = if options.needs_wrapping() {
            let wrapped = self.shared.wrapper.wrap(
                command,
                options.sandbox.as_ref(),
                options.limits.as_ref(),
            );
            if wrapped.is_empty() {
                return Err(ProcessError::EmptyCommand(id.to_string()));
            }
            wrapped
        } else {
            command.to_vec()
        };

        let mut table = self.shared.table();
        let vanished = table.get_mut(id).and_then(|t| t.reap_if_vanished(id));
        if table.get(id).is_some_and(TrackedProcess::is_running) {
            return Err(ProcessError::AlreadyExists(id.to_string()));
        }

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .envs(&options.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ref dir) = options.cwd {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                drop(table);
                if let Some(record) = vanished {
                    self.shared.persist(&record);
                }
                return Err(ProcessError::Spawn {
                    id: id.to_string(),
                    source,
                });
            }
        };
        let pid = child.id();
        info!(id = %id, pid = ?pid, "Spawned process: {:?}", argv);

        let record = ProcessRecord {
            id: id.to_string(),
            pid,
            command: command.to_vec(),
            cwd: options.cwd.clone(),
            env: options.env.into_iter().collect(),
            start_time: now_millis(),
            end_time: None,
            status: RecordStatus::Running,
            exit_code: None,
            creator_id,
            memory_limit_mb: options.limits.as_ref().and_then(|l| l.memory),
            cpu_limit_secs: options.limits.as_ref().and_then(|l| l.cpu),
            sandboxed: options.sandbox.is_some(),
        };

        let readers = self.spawn_readers(id, &mut child);
        let stdin = child.stdin.take().map(|pipe| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(pump_stdin(id.to_string(), pipe, rx));
            tx
        });
        let kill = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);

        table.insert(
            id.to_string(),
            TrackedProcess {
                record: record.clone(),
                control: Some(Control {
                    stdin,
                    kill: kill.clone(),
                    exit_rx,
                }),
            },
        );
        drop(table);

        // Persisted before the watcher exists, so the exit record lands last
        self.shared.persist(&record);
        tokio::spawn(watch_child(
            Arc::clone(&self.shared),
            id.to_string(),
            pid,
            child,
            kill,
            readers,
            exit_tx,
        ));

        Ok(pid)
    }

    fn spawn_readers(&self, id: &str, child: &mut Child) -> Vec<JoinHandle<()>> {
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump_output(
                Arc::clone(&self.shared),
                id.to_string(),
                StdStream::Stdout,
                stdout,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump_output(
                Arc::clone(&self.shared),
                id.to_string(),
                StdStream::Stderr,
                stderr,
            )));
        }
        readers
    }

    /// Queue `data` for the process's stdin. Lookup happens now; the returned
    /// handle resolves once the bytes are written.
    pub fn queue_stdin(&self, id: &str, data: Bytes) -> Result<StdinWrite> {
        let table = self.shared.table();
        let tracked = table
            .get(id)
            .ok_or_else(|| ProcessError::NotFound(id.to_string()))?;
        let control = tracked
            .control
            .as_ref()
            .ok_or_else(|| ProcessError::NotControllable(id.to_string()))?;
        let stdin = control
            .stdin
            .as_ref()
            .ok_or_else(|| ProcessError::StdinUnavailable(id.to_string()))?;

        let (tx, rx) = oneshot::channel();
        let len = data.len();
        stdin
            .send((data, tx))
            .map_err(|_| ProcessError::StdinUnavailable(id.to_string()))?;
        Ok(StdinWrite {
            id: id.to_string(),
            len,
            rx,
        })
    }

    pub async fn write_to_stdin(&self, id: &str, data: &[u8]) -> Result<()> {
        self.queue_stdin(id, Bytes::copy_from_slice(data))?
            .finish()
            .await
    }

    /// Request termination. Returns false if the process already exited.
    pub fn kill(&self, id: &str) -> Result<bool> {
        let table = self.shared.table();
        let tracked = table
            .get(id)
            .ok_or_else(|| ProcessError::NotFound(id.to_string()))?;
        let control = tracked
            .control
            .as_ref()
            .ok_or_else(|| ProcessError::NotControllable(id.to_string()))?;
        if !tracked.is_running() {
            return Ok(false);
        }
        info!(id = %id, pid = ?tracked.record.pid, "Killing process");
        control.kill.cancel();
        Ok(true)
    }

    /// SIGSTOP the process. False if unknown, not ours, or signalling failed.
    pub fn pause(&self, id: &str) -> bool {
        self.signal_controlled(id, JobSignal::Stop)
    }

    /// SIGCONT the process. False if unknown, not ours, or signalling failed.
    pub fn resume(&self, id: &str) -> bool {
        self.signal_controlled(id, JobSignal::Continue)
    }

    fn signal_controlled(&self, id: &str, signal: JobSignal) -> bool {
        let pid = {
            let table = self.shared.table();
            match table.get(id) {
                Some(t) if t.control.is_some() && t.is_running() => t.record.pid,
                _ => None,
            }
        };
        let Some(pid) = pid else {
            debug!(id = %id, "No controllable process to {}", signal.as_str());
            return false;
        };
        let delivered = send_job_signal(pid, signal);
        if delivered {
            info!(id = %id, pid, "Sent {} to process", signal.as_str());
        } else {
            warn!(id = %id, pid, "Failed to {} process", signal.as_str());
        }
        delivered
    }

    /// Handle that resolves when the process exits. Lookup happens now.
    pub fn exit_watcher(&self, id: &str) -> Result<ExitWatcher> {
        let table = self.shared.table();
        let tracked = table
            .get(id)
            .ok_or_else(|| ProcessError::NotFound(id.to_string()))?;
        let control = tracked
            .control
            .as_ref()
            .ok_or_else(|| ProcessError::NotControllable(id.to_string()))?;
        Ok(ExitWatcher {
            rx: control.exit_rx.clone(),
        })
    }

    /// Wait for the process to exit. No timeout.
    pub async fn wait(&self, id: &str) -> Result<Option<i32>> {
        Ok(self.exit_watcher(id)?.wait().await)
    }

    pub fn get_status(&self, id: &str) -> ProcessStatus {
        let (status, vanished) = {
            let mut table = self.shared.table();
            let Some(tracked) = table.get_mut(id) else {
                return ProcessStatus::unknown();
            };
            let vanished = tracked.reap_if_vanished(id);
            let status = ProcessStatus {
                state: if tracked.is_running() {
                    ProcessState::Running
                } else {
                    ProcessState::Exited
                },
                pid: tracked.record.pid,
                exit_code: tracked.record.exit_code,
            };
            (status, vanished)
        };
        if let Some(record) = vanished {
            self.shared.persist(&record);
        }
        status
    }

    /// True if nobody was recorded as creator, or `creator_id` matches it.
    /// Unknown ids are owned by everyone; the operation itself reports them.
    pub fn is_owned_by(&self, id: &str, creator_id: Option<&str>) -> bool {
        let table = self.shared.table();
        match table.get(id).and_then(|t| t.record.creator_id.as_deref()) {
            None => true,
            Some(owner) => creator_id == Some(owner),
        }
    }

    /// Reconcile persisted `running` records with reality after a restart
    pub fn recover(&self) -> Result<RecoveryReport> {
        let records = self.shared.store.load()?;
        let mut report = RecoveryReport::default();
        let mut vanished = Vec::new();
        let mut table = self.shared.table();

        for mut record in records {
            if record.status != RecordStatus::Running || table.contains_key(&record.id) {
                continue;
            }

            let alive = record.pid.is_some_and(pid_alive);
            if alive {
                info!(id = %record.id, pid = ?record.pid, "Adopted running process from previous session");
                report.adopted.push(record.id.clone());
                table.insert(
                    record.id.clone(),
                    TrackedProcess {
                        record,
                        control: None,
                    },
                );
            } else {
                warn!(id = %record.id, pid = ?record.pid, "Process exited while the kernel was down");
                record.finish(RecordStatus::AbnormalExit, None);
                report.vanished.push(record.id.clone());
                vanished.push(record);
            }
        }
        drop(table);

        for record in &vanished {
            self.shared.persist(record);
        }
        Ok(report)
    }
}

async fn pump_output<R>(shared: Arc<Shared>, id: String, stream: StdStream, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => shared.events.emit(ProcessEvent::Output {
                id: id.clone(),
                stream,
                data: Bytes::copy_from_slice(&buf[..n]),
            }),
            Err(e) => {
                debug!(id = %id, "Error reading {}: {}", stream.as_str(), e);
                break;
            }
        }
    }
    trace!(id = %id, "{} closed", stream.as_str());
}

async fn pump_stdin(
    id: String,
    mut pipe: ChildStdin,
    mut requests: mpsc::UnboundedReceiver<StdinRequest>,
) {
    while let Some((data, done)) = requests.recv().await {
        let result = async {
            pipe.write_all(&data).await?;
            pipe.flush().await
        }
        .await;
        let failed = result.is_err();
        let _ = done.send(result);
        if failed {
            debug!(id = %id, "Stdin closed");
            break;
        }
    }
    trace!(id = %id, "Stdin writer finished");
}

/// Forget the oldest exited processes beyond [`FINISHED_RECORD_LIMIT`]
fn prune_finished(table: &mut HashMap<String, TrackedProcess>) {
    let mut finished: Vec<(u64, String)> = table
        .iter()
        .filter(|(_, t)| !t.is_running())
        .map(|(id, t)| (t.record.end_time.unwrap_or(0), id.clone()))
        .collect();
    if finished.len() <= FINISHED_RECORD_LIMIT {
        return;
    }
    finished.sort();
    let excess = finished.len() - FINISHED_RECORD_LIMIT;
    for (_, id) in finished.into_iter().take(excess) {
        table.remove(&id);
    }
    trace!(pruned = excess, "Dropped old exited processes");
}

async fn watch_child(
    shared: Arc<Shared>,
    id: String,
    pid: Option<u32>,
    mut child: Child,
    kill: CancellationToken,
    readers: Vec<JoinHandle<()>>,
    exit_tx: watch::Sender<Option<i32>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill.cancelled() => {
            if let Err(e) = child.start_kill() {
                debug!(id = %id, "start_kill failed: {}", e);
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => status.code().unwrap_or(SIGNAL_EXIT_CODE),
        Err(e) => {
            warn!(id = %id, "Failed to wait for process: {}", e);
            SIGNAL_EXIT_CODE
        }
    };

    for mut reader in readers {
        if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut reader)
            .await
            .is_err()
        {
            debug!(id = %id, "Output still open after exit, detaching reader");
            reader.abort();
        }
    }

    info!(id = %id, code, "Process exited");
    shared.mark_exited(&id, pid, code);
    let _ = exit_tx.send(Some(code));
}

#[derive(Debug, Clone, Copy)]
enum JobSignal {
    Stop,
    Continue,
}

impl JobSignal {
    fn as_str(&self) -> &'static str {
        match self {
            JobSignal::Stop => "pause",
            JobSignal::Continue => "resume",
        }
    }
}

#[cfg(unix)]
fn send_job_signal(pid: u32, signal: JobSignal) -> bool {
    let sig = match signal {
        JobSignal::Stop => libc::SIGSTOP,
        JobSignal::Continue => libc::SIGCONT,
    };
    unsafe { libc::kill(pid as libc::pid_t, sig) == 0 }
}

#[cfg(not(unix))]
fn send_job_signal(_pid: u32, _signal: JobSignal) -> bool {
    false
}

/// Liveness probe with signal 0. EPERM still means the pid exists.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::store::MemoryProcessStore;

    fn manager() -> (ProcessManager, Arc<MemoryProcessStore>) {
        let store = Arc::new(MemoryProcessStore::new());
        (ProcessManager::new(store.clone()), store)
    }

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    async fn collect_until_exit(
        rx: &mut mpsc::UnboundedReceiver<ProcessEvent>,
        id: &str,
    ) -> (Vec<u8>, i32) {
        let mut out = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out waiting for process events")
                .expect("event channel closed");
            match event {
                ProcessEvent::Output {
                    id: ev_id, data, ..
                } if ev_id == id => out.extend_from_slice(&data),
                ProcessEvent::Exit {
                    id: ev_id, code, ..
                } if ev_id == id => return (out, code),
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_output_then_exit() {
        let (pm, store) = manager();
        let mut rx = pm.subscribe();
        pm.spawn("echo", &cmd(&["sh", "-c", "echo hello"]), Default::default(), None)
            .unwrap();

        let (out, code) = collect_until_exit(&mut rx, "echo").await;
        assert_eq!(out, b"hello\n");
        assert_eq!(code, 0);

        let status = pm.get_status("echo");
        assert_eq!(status.state, ProcessState::Exited);
        assert_eq!(status.exit_code, Some(0));

        let record = store.get("echo").unwrap();
        assert_eq!(record.status, RecordStatus::Exited);
        assert!(record.end_time.is_some());
    }

    #[tokio::test]
    async fn test_stdin_roundtrip_through_cat() {
        let (pm, _) = manager();
        let mut rx = pm.subscribe();
        pm.spawn("cat", &cmd(&["cat"]), Default::default(), None)
            .unwrap();
        pm.write_to_stdin("cat", b"ping\n").await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            ProcessEvent::Output {
                id: "cat".into(),
                stream: StdStream::Stdout,
                data: Bytes::from_static(b"ping\n"),
            }
        );

        assert!(pm.kill("cat").unwrap());
        let code = pm.wait("cat").await.unwrap();
        assert_eq!(code, Some(SIGNAL_EXIT_CODE));
        assert!(!pm.kill("cat").unwrap());
        assert!(matches!(
            pm.write_to_stdin("cat", b"late").await,
            Err(ProcessError::StdinUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_stderr_and_exit_code() {
        let (pm, _) = manager();
        let mut rx = pm.subscribe();
        pm.spawn(
            "fail",
            &cmd(&["sh", "-c", "echo oops >&2; exit 3"]),
            Default::default(),
            None,
        )
        .unwrap();

        let mut saw_stderr = false;
        loop {
            match rx.recv().await.unwrap() {
                ProcessEvent::Output { stream, data, .. } => {
                    assert_eq!(stream, StdStream::Stderr);
                    assert_eq!(&data[..], b"oops\n");
                    saw_stderr = true;
                }
                ProcessEvent::Exit { code, .. } => {
                    assert_eq!(code, 3);
                    break;
                }
            }
        }
        assert!(saw_stderr);
    }

    #[tokio::test]
    async fn test_duplicate_running_id_is_rejected() {
        let (pm, _) = manager();
        pm.spawn("dup", &cmd(&["sleep", "5"]), Default::default(), None)
            .unwrap();
        let err = pm
            .spawn("dup", &cmd(&["sleep", "5"]), Default::default(), None)
            .unwrap_err();
        assert!(matches!(err, ProcessError::AlreadyExists(_)));
        pm.kill("dup").unwrap();
    }

    #[tokio::test]
    async fn test_exited_id_can_be_reused() {
        let (pm, _) = manager();
        pm.spawn("once", &cmd(&["true"]), Default::default(), None)
            .unwrap();
        assert_eq!(pm.wait("once").await.unwrap(), Some(0));
        pm.spawn("once", &cmd(&["sh", "-c", "exit 4"]), Default::default(), None)
            .unwrap();
        assert_eq!(pm.wait("once").await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let (pm, _) = manager();
        let err = pm
            .spawn(
                "missing",
                &cmd(&["/definitely/not/a/binary"]),
                Default::default(),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
        assert_eq!(pm.get_status("missing").state, ProcessState::Unknown);
        assert!(matches!(
            pm.spawn("empty", &[], Default::default(), None),
            Err(ProcessError::EmptyCommand(_))
        ));
    }

    #[tokio::test]
    async fn test_env_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let (pm, _) = manager();
        let mut rx = pm.subscribe();
        let options = ProcessOptions::default()
            .cwd(dir.path().display().to_string())
            .env("KAIRO_TEST_VALUE", "42");
        pm.spawn(
            "env",
            &cmd(&["sh", "-c", "echo $KAIRO_TEST_VALUE; pwd"]),
            options,
            None,
        )
        .unwrap();

        let (out, _) = collect_until_exit(&mut rx, "env").await;
        let text = String::from_utf8(out).unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        assert!(text.starts_with("42\n"));
        assert!(text.trim_end().ends_with(canonical.file_name().unwrap().to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_limits_are_applied_through_wrapper() {
        let (pm, store) = manager();
        let mut rx = pm.subscribe();
        let options = ProcessOptions::default().limits(ResourceLimits {
            cpu: Some(30),
            memory: None,
        });
        pm.spawn("limited", &cmd(&["sh", "-c", "ulimit -t"]), options, None)
            .unwrap();
        let (out, code) = collect_until_exit(&mut rx, "limited").await;
        assert_eq!(code, 0);
        assert_eq!(String::from_utf8(out).unwrap().trim(), "30");

        let record = store.get("limited").unwrap();
        assert_eq!(record.cpu_limit_secs, Some(30));
        assert_eq!(record.command, cmd(&["sh", "-c", "ulimit -t"]));
    }

    #[tokio::test]
    async fn test_ownership() {
        let (pm, _) = manager();
        pm.spawn("owned", &cmd(&["sleep", "5"]), Default::default(), Some("A".into()))
            .unwrap();
        pm.spawn("shared", &cmd(&["sleep", "5"]), Default::default(), None)
            .unwrap();

        assert!(pm.is_owned_by("owned", Some("A")));
        assert!(!pm.is_owned_by("owned", Some("B")));
        assert!(!pm.is_owned_by("owned", None));
        assert!(pm.is_owned_by("shared", Some("B")));
        assert!(pm.is_owned_by("shared", None));
        assert!(pm.is_owned_by("nobody", Some("B")));

        pm.kill("owned").unwrap();
        pm.kill("shared").unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pause_and_resume() {
        let (pm, _) = manager();
        pm.spawn("sleeper", &cmd(&["sleep", "5"]), Default::default(), None)
            .unwrap();
        assert!(ProcessManager::supports_job_control());
        assert!(pm.pause("sleeper"));
        assert!(pm.resume("sleeper"));
        assert!(!pm.pause("unknown"));
        pm.kill("sleeper").unwrap();
        pm.wait("sleeper").await.unwrap();
        assert!(!pm.resume("sleeper"));
    }

    #[test]
    fn test_unknown_status() {
        let (pm, _) = manager();
        assert_eq!(pm.get_status("ghost"), ProcessStatus::unknown());
        assert!(matches!(pm.kill("ghost"), Err(ProcessError::NotFound(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_recover_marks_vanished_and_adopts_live() {
        let store = Arc::new(MemoryProcessStore::new());

        let dead_pid = {
            let mut child = std::process::Command::new("true").spawn().unwrap();
            let pid = child.id();
            child.wait().unwrap();
            pid
        };
        let base = ProcessRecord {
            id: String::new(),
            pid: None,
            command: vec!["x".into()],
            cwd: None,
            env: vec![],
            start_time: now_millis(),
            end_time: None,
            status: RecordStatus::Running,
            exit_code: None,
            creator_id: Some("A".into()),
            memory_limit_mb: None,
            cpu_limit_secs: None,
            sandboxed: false,
        };
        store
            .save(&ProcessRecord {
                id: "alive".into(),
                pid: Some(std::process::id()),
                ..base.clone()
            })
            .unwrap();
        store
            .save(&ProcessRecord {
                id: "gone".into(),
                pid: Some(dead_pid),
                ..base.clone()
            })
            .unwrap();
        let mut finished = ProcessRecord {
            id: "done".into(),
            ..base
        };
        finished.finish(RecordStatus::Exited, Some(0));
        store.save(&finished).unwrap();

        let pm = ProcessManager::new(store.clone());
        let report = pm.recover().unwrap();
        assert_eq!(report.adopted, vec!["alive".to_string()]);
        assert_eq!(report.vanished, vec!["gone".to_string()]);

        assert_eq!(store.get("gone").unwrap().status, RecordStatus::AbnormalExit);
        assert_eq!(pm.get_status("alive").state, ProcessState::Running);
        assert_eq!(pm.get_status("gone").state, ProcessState::Unknown);
        assert!(!pm.is_owned_by("alive", Some("B")));
        assert!(matches!(
            pm.kill("alive"),
            Err(ProcessError::NotControllable(_))
        ));
        assert!(!pm.pause("alive"));
    }

    fn running_record(id: &str, pid: u32) -> ProcessRecord {
        ProcessRecord {
            id: id.into(),
            pid: Some(pid),
            command: vec!["sleep".into(), "30".into()],
            cwd: None,
            env: vec![],
            start_time: now_millis(),
            end_time: None,
            status: RecordStatus::Running,
            exit_code: None,
            creator_id: None,
            memory_limit_mb: None,
            cpu_limit_secs: None,
            sandboxed: false,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_adopted_id_is_reusable_once_pid_is_gone() {
        let store = Arc::new(MemoryProcessStore::new());
        let mut adopted = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        store.save(&running_record("job", adopted.id())).unwrap();

        let pm = ProcessManager::new(store.clone());
        assert_eq!(pm.recover().unwrap().adopted, vec!["job".to_string()]);
        assert!(matches!(
            pm.spawn("job", &cmd(&["true"]), Default::default(), None),
            Err(ProcessError::AlreadyExists(_))
        ));

        adopted.kill().unwrap();
        adopted.wait().unwrap();

        pm.spawn("job", &cmd(&["true"]), Default::default(), None)
            .unwrap();
        assert_eq!(pm.wait("job").await.unwrap(), Some(0));
        assert_eq!(store.get("job").unwrap().status, RecordStatus::Exited);
    }

    #[tokio::test]
    async fn test_stdin_writes_keep_order() {
        let (pm, _) = manager();
        let mut rx = pm.subscribe();
        pm.spawn("cat", &cmd(&["cat"]), Default::default(), None)
            .unwrap();

        let first = pm.queue_stdin("cat", Bytes::from_static(b"one\n")).unwrap();
        let second = pm.queue_stdin("cat", Bytes::from_static(b"two\n")).unwrap();
        second.finish().await.unwrap();
        first.finish().await.unwrap();

        let mut out = Vec::new();
        while out.len() < 8 {
            match tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .unwrap()
                .unwrap()
            {
                ProcessEvent::Output { data, .. } => out.extend_from_slice(&data),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(out, b"one\ntwo\n");
        pm.kill("cat").unwrap();
    }

    #[test]
    fn test_prune_keeps_running_and_newest_finished() {
        let mut table = HashMap::new();
        table.insert(
            "live".to_string(),
            TrackedProcess {
                record: running_record("live", 1),
                control: None,
            },
        );
        for i in 0..FINISHED_RECORD_LIMIT + 3 {
            let id = format!("done-{i}");
            let mut record = running_record(&id, 1);
            record.finish(RecordStatus::Exited, Some(0));
            record.end_time = Some(i as u64);
            table.insert(id, TrackedProcess { record, control: None });
        }

        prune_finished(&mut table);
        assert_eq!(table.len(), FINISHED_RECORD_LIMIT + 1);
        assert!(table.contains_key("live"));
        for i in 0..3 {
            assert!(!table.contains_key(&format!("done-{i}")));
        }
        assert!(table.contains_key("done-3"));
    }
}
