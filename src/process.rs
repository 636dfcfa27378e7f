//! One live worker process per channel.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::timeout;

#[cfg(unix)]
use nix::{
    sys::signal::{kill, killpg, Signal},
    unistd::Pid,
};

use crate::error::BridgeError;
use crate::protocol::{classify_line, InboundLine};

/// Resolved program and arguments used to launch a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Serialized writer for a worker's input stream. Each call writes one whole
/// line and flushes before the next writer gets the lock.
pub struct LineWriter {
    inner: AsyncMutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
}

impl LineWriter {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: AsyncMutex::new(Some(Box::new(writer))),
        }
    }

    pub async fn write_line(&self, line: &str) -> Result<(), BridgeError> {
        let mut guard = self.inner.lock().await;
        let writer = guard.as_mut().ok_or(BridgeError::ChannelClosed)?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(BridgeError::ChannelWrite)?;
        writer.write_all(b"\n").await.map_err(BridgeError::ChannelWrite)?;
        writer.flush().await.map_err(BridgeError::ChannelWrite)?;
        Ok(())
    }

    /// Close the stream; later writes fail with [`BridgeError::ChannelClosed`].
    pub async fn close(&self) {
        if let Some(mut writer) = self.inner.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.is_none()
    }
}

/// Bounded ring of stderr and non-protocol stdout lines.
#[derive(Debug)]
pub struct DiagnosticTail {
    capacity: usize,
    lines: parking_lot::Mutex<VecDeque<String>>,
}

impl DiagnosticTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            lines: parking_lot::Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    pub fn last(&self) -> Option<String> {
        self.lines.lock().back().cloned()
    }
}

/// Private temporary directory handed to the worker as `TMPDIR`.
///
/// The contents are recorded right after creation; [`sweep`](Self::sweep)
/// deletes what appeared during the run and then removes the directory.
#[derive(Debug)]
pub struct ScratchDir {
    dir: tempfile::TempDir,
    baseline: HashSet<PathBuf>,
}

impl ScratchDir {
    pub fn create(channel_id: &str) -> std::io::Result<Self> {
        let prefix = format!("session-bridge-{}-", sanitize_for_path(channel_id));
        let dir = tempfile::Builder::new().prefix(&prefix).tempdir()?;
        let baseline = snapshot_files(dir.path());
        Ok(Self { dir, baseline })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Returns how many entries created during the run were deleted.
    pub fn sweep(self) -> std::io::Result<usize> {
        let created: Vec<PathBuf> = snapshot_files(self.dir.path())
            .into_iter()
            .filter(|path| !self.baseline.contains(path))
            .collect();
        let mut removed = 0;
        for path in created {
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => {
                    tracing::debug!(target = "session_bridge::process", path = %path.display(), error = %error, "failed removing scratch entry");
                }
            }
        }
        self.dir.close()?;
        Ok(removed)
    }
}

fn snapshot_files(root: &Path) -> HashSet<PathBuf> {
    let mut seen = HashSet::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if entry.file_type().is_ok_and(|kind| kind.is_dir()) {
                stack.push(path.clone());
            }
            seen.insert(path);
        }
    }
    seen
}

fn sanitize_for_path(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(32)
        .collect();
    if cleaned.is_empty() {
        "channel".to_string()
    } else {
        cleaned
    }
}

/// Exclusive reader over a worker's output. Dropping it releases the stream;
/// the next [`ChannelProcess::read_lines`] call continues where this one
/// stopped.
pub struct InboundLines<'a> {
    lines: AsyncMutexGuard<'a, Lines<BufReader<ChildStdout>>>,
    diagnostics: &'a DiagnosticTail,
    channel_id: &'a str,
}

impl InboundLines<'_> {
    /// Next line of output, or `None` once the worker closes its stdout.
    pub async fn next(&mut self) -> Result<Option<InboundLine>, BridgeError> {
        loop {
            let Some(raw) = self
                .lines
                .next_line()
                .await
                .map_err(BridgeError::ChannelRead)?
            else {
                return Ok(None);
            };
            match classify_line(&raw) {
                None => continue,
                Some(InboundLine::Diagnostic(text)) => {
                    tracing::debug!(target = "session_bridge::process", channel = %self.channel_id, line = %text, "worker diagnostic");
                    self.diagnostics.push(text.clone());
                    return Ok(Some(InboundLine::Diagnostic(text)));
                }
                Some(event) => return Ok(Some(event)),
            }
        }
    }
}

pub struct ChannelProcess {
    channel_id: String,
    pid: Option<u32>,
    child: AsyncMutex<Option<Child>>,
    writer: Arc<LineWriter>,
    stdout: AsyncMutex<Lines<BufReader<ChildStdout>>>,
    scratch: parking_lot::Mutex<Option<ScratchDir>>,
    diagnostics: Arc<DiagnosticTail>,
    stderr_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    exit_status: parking_lot::Mutex<Option<ExitStatus>>,
    stopping: AtomicBool,
}

/// How long an exited worker's stderr is drained into the tail.
const STDERR_DRAIN: Duration = Duration::from_millis(250);

impl std::fmt::Debug for ChannelProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelProcess")
            .field("channel_id", &self.channel_id)
            .field("pid", &self.pid)
            .finish()
    }
}

impl ChannelProcess {
    /// Spawn `command` in `working_dir` with a fresh scratch directory.
    pub async fn start(
        channel_id: &str,
        command: &WorkerCommand,
        working_dir: &Path,
        diagnostic_capacity: usize,
    ) -> Result<Self, BridgeError> {
        if !working_dir.is_dir() {
            return Err(BridgeError::WorkingDirMissing(working_dir.to_path_buf()));
        }

        let scratch = ScratchDir::create(channel_id)?;
        let program = command.program.display().to_string();

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(working_dir)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("TMPDIR", scratch.path())
            .env("TMP", scratch.path())
            .env("TEMP", scratch.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so signals reach the worker's subprocesses too.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                if nix::libc::setsid() == -1 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(())
                }
            });
        }

        let mut child = cmd.spawn().map_err(|source| BridgeError::Launch {
            program: program.clone(),
            source,
        })?;
        let pid = child.id();

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            let _ = child.start_kill();
            return Err(BridgeError::Launch {
                program,
                source: std::io::Error::other("worker stdio is unavailable"),
            });
        };

        let diagnostics = Arc::new(DiagnosticTail::new(diagnostic_capacity));
        let stderr_task = stderr.map(|stderr| {
            let sink = Arc::clone(&diagnostics);
            let channel = channel_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    tracing::debug!(target = "session_bridge::process", channel = %channel, line = %line, "worker stderr");
                    sink.push(line);
                }
            })
        });

        tracing::info!(
            target = "session_bridge::process",
            channel = %channel_id,
            program = %program,
            pid = ?pid,
            cwd = %working_dir.display(),
            "worker started"
        );

        Ok(Self {
            channel_id: channel_id.to_string(),
            pid,
            child: AsyncMutex::new(Some(child)),
            writer: Arc::new(LineWriter::new(stdin)),
            stdout: AsyncMutex::new(BufReader::new(stdout).lines()),
            scratch: parking_lot::Mutex::new(Some(scratch)),
            diagnostics,
            stderr_task: parking_lot::Mutex::new(stderr_task),
            exit_status: parking_lot::Mutex::new(None),
            stopping: AtomicBool::new(false),
        })
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn writer(&self) -> &Arc<LineWriter> {
        &self.writer
    }

    pub fn scratch_path(&self) -> Option<PathBuf> {
        self.scratch
            .lock()
            .as_ref()
            .map(|scratch| scratch.path().to_path_buf())
    }

    pub async fn write_line(&self, line: &str) -> Result<(), BridgeError> {
        self.writer.write_line(line).await
    }

    pub async fn read_lines(&self) -> InboundLines<'_> {
        InboundLines {
            lines: self.stdout.lock().await,
            diagnostics: &self.diagnostics,
            channel_id: &self.channel_id,
        }
    }

    pub fn diagnostics(&self) -> Vec<String> {
        self.diagnostics.snapshot()
    }

    pub fn last_diagnostic(&self) -> Option<String> {
        self.diagnostics.last()
    }

    /// True once `interrupt` or `terminate` has been called.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Non-blocking liveness check.
    pub fn has_exited(&self) -> bool {
        if self.exit_status.lock().is_some() {
            return true;
        }
        let Ok(mut guard) = self.child.try_lock() else {
            // Someone is stopping or reaping it right now.
            return self.is_stopping();
        };
        match guard.as_mut() {
            None => true,
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => {
                    *self.exit_status.lock() = Some(status);
                    true
                }
                Ok(None) => false,
                Err(_) => true,
            },
        }
    }

    /// Ask the worker to stop what it is doing (SIGINT), escalating to a
    /// forced kill after `grace`.
    pub async fn interrupt(&self, grace: Duration) -> Option<ExitStatus> {
        self.stop(StopSignal::Interrupt, grace).await
    }

    /// SIGTERM, escalating to a forced kill after `grace`.
    pub async fn terminate(&self, grace: Duration) -> Option<ExitStatus> {
        self.stop(StopSignal::Terminate, grace).await
    }

    async fn stop(&self, signal: StopSignal, grace: Duration) -> Option<ExitStatus> {
        self.stopping.store(true, Ordering::SeqCst);
        self.writer.close().await;
        let taken = self.child.lock().await.take();
        if let Some(mut child) = taken {
            let status = terminate_child(&mut child, signal, grace).await;
            tracing::info!(target = "session_bridge::process", channel = %self.channel_id, pid = ?self.pid, status = ?status, "worker stopped");
            if let Some(status) = status {
                *self.exit_status.lock() = Some(status);
            }
        }
        *self.exit_status.lock()
    }

    /// Wait for the worker to exit after it closed its output. A worker that
    /// lingers longer than `grace` is terminated.
    pub async fn wait_exit(&self, grace: Duration) -> Option<ExitStatus> {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            let status = match timeout(grace, child.wait()).await {
                Ok(Ok(status)) => Some(status),
                Ok(Err(error)) => {
                    tracing::warn!(target = "session_bridge::process", channel = %self.channel_id, error = %error, "failed waiting for worker");
                    None
                }
                Err(_) => terminate_child(child, StopSignal::Terminate, grace).await,
            };
            guard.take();
            if let Some(status) = status {
                *self.exit_status.lock() = Some(status);
            }
        }
        drop(guard);

        let stderr_task = self.stderr_task.lock().take();
        if let Some(task) = stderr_task {
            let _ = timeout(STDERR_DRAIN, task).await;
        }
        *self.exit_status.lock()
    }

    /// Delete scratch files created during the run and remove the directory.
    /// Safe to call more than once.
    pub fn cleanup(&self) -> usize {
        let Some(scratch) = self.scratch.lock().take() else {
            return 0;
        };
        let path = scratch.path().to_path_buf();
        match scratch.sweep() {
            Ok(removed) => {
                tracing::debug!(target = "session_bridge::process", channel = %self.channel_id, dir = %path.display(), removed, "scratch directory swept");
                removed
            }
            Err(error) => {
                tracing::warn!(target = "session_bridge::process", channel = %self.channel_id, dir = %path.display(), error = %error, "failed removing scratch directory");
                0
            }
        }
    }

    /// Terminate and release everything this process owns.
    pub async fn shutdown(&self, grace: Duration) -> Option<ExitStatus> {
        let status = self.terminate(grace).await;
        self.cleanup();
        status
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Interrupt,
    Terminate,
}

#[cfg(unix)]
fn signal_worker(pid: u32, signal: Signal) {
    let pid = Pid::from_raw(pid as i32);
    if killpg(pid, signal).is_err() {
        let _ = kill(pid, signal);
    }
}

/// Signal `child`, escalating to a forced kill if it has not exited within
/// `grace`.
pub async fn terminate_child(
    child: &mut Child,
    signal: StopSignal,
    grace: Duration,
) -> Option<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status);
    }

    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let first = match signal {
                StopSignal::Interrupt => Signal::SIGINT,
                StopSignal::Terminate => Signal::SIGTERM,
            };
            signal_worker(pid, first);
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal;
        let _ = child.start_kill();
    }

    if let Ok(result) = timeout(grace, child.wait()).await {
        return result.ok();
    }

    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            signal_worker(pid, Signal::SIGKILL);
        }
    }

    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    child.wait().await.ok()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::Value;
    use tokio::io::{AsyncBufReadExt, BufReader};

    use super::{ChannelProcess, DiagnosticTail, LineWriter, ScratchDir, WorkerCommand};
    use crate::error::BridgeError;
    use crate::protocol::{InboundLine, WorkerEvent};

    fn sh(script: &str) -> WorkerCommand {
        WorkerCommand {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            env: vec![],
        }
    }

    #[tokio::test]
    async fn concurrent_writers_never_interleave_lines() {
        let (host, worker) = tokio::io::duplex(64);
        let writer = Arc::new(LineWriter::new(host));
        let mut tasks = Vec::new();
        for n in 0..20 {
            let writer = Arc::clone(&writer);
            tasks.push(tokio::spawn(async move {
                let line = format!(
                    r#"{{"type":"response","id":{n},"allow":true,"pad":"{}"}}"#,
                    "x".repeat(100)
                );
                writer.write_line(&line).await.unwrap();
            }));
        }

        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(worker).lines();
            let mut seen = Vec::new();
            while seen.len() < 20 {
                let line = lines.next_line().await.unwrap().unwrap();
                let value: Value = serde_json::from_str(&line).unwrap();
                seen.push(value["id"].as_i64().unwrap());
            }
            seen
        });

        for task in tasks {
            task.await.unwrap();
        }
        let mut seen = reader.await.unwrap();
        seen.sort_unstable();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn closed_writer_reports_channel_closed() {
        let (host, _worker) = tokio::io::duplex(64);
        let writer = LineWriter::new(host);
        writer.close().await;
        assert!(writer.is_closed().await);
        assert!(matches!(
            writer.write_line("{}").await,
            Err(BridgeError::ChannelClosed)
        ));
    }

    #[test]
    fn diagnostic_tail_is_bounded() {
        let tail = DiagnosticTail::new(2);
        tail.push("a".into());
        tail.push("b".into());
        tail.push("c".into());
        assert_eq!(tail.snapshot(), vec!["b".to_string(), "c".to_string()]);
        assert_eq!(tail.last().as_deref(), Some("c"));
    }

    #[test]
    fn sweep_removes_only_new_entries_then_the_directory() {
        let scratch = ScratchDir::create("chan/../x").unwrap();
        let root = scratch.path().to_path_buf();
        assert!(root
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("session-bridge-chanx-"));
        std::fs::write(root.join("a.txt"), "a").unwrap();
        std::fs::create_dir(root.join("nested")).unwrap();
        std::fs::write(root.join("nested/b.txt"), "b").unwrap();
        let removed = scratch.sweep().unwrap();
        assert!(removed >= 2);
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn missing_working_dir_fails_before_spawn() {
        let result =
            ChannelProcess::start("c", &sh("true"), std::path::Path::new("/no/such/dir"), 10)
                .await;
        assert!(matches!(result, Err(BridgeError::WorkingDirMissing(_))));
    }

    #[tokio::test]
    async fn spawn_failure_is_a_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let command = WorkerCommand {
            program: "/definitely/not/a/worker".into(),
            args: vec![],
            env: vec![],
        };
        let err = ChannelProcess::start("c", &command, dir.path(), 10)
            .await
            .unwrap_err();
        assert!(err.is_launch_failure());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn echo_worker_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let process = ChannelProcess::start(
            "echo",
            &WorkerCommand {
                program: "cat".into(),
                args: vec![],
                env: vec![],
            },
            dir.path(),
            10,
        )
        .await
        .unwrap();

        process.write_line(r#"{"type":"done"}"#).await.unwrap();
        {
            let mut lines = process.read_lines().await;
            assert_eq!(
                lines.next().await.unwrap(),
                Some(InboundLine::Event(WorkerEvent::Done))
            );
        }

        process.write_line("plain text").await.unwrap();
        let mut lines = process.read_lines().await;
        assert_eq!(
            lines.next().await.unwrap(),
            Some(InboundLine::Diagnostic("plain text".into()))
        );
        drop(lines);
        assert_eq!(process.last_diagnostic().as_deref(), Some("plain text"));

        process.shutdown(Duration::from_millis(500)).await;
        assert!(process.has_exited());
        assert!(process.scratch_path().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_escalates_to_kill() {
        let dir = tempfile::tempdir().unwrap();
        let process = ChannelProcess::start(
            "stubborn",
            &sh(r#"trap "" TERM INT; while true; do sleep 0.05; done"#),
            dir.path(),
            10,
        )
        .await
        .unwrap();
        // Give the shell time to install its trap.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = process.terminate(Duration::from_millis(200)).await;
        assert!(status.is_some());
        assert!(!status.unwrap().success());
        assert!(process.is_stopping());
        assert!(process.has_exited());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn worker_sees_private_tmpdir_and_cleanup_sweeps_it() {
        let dir = tempfile::tempdir().unwrap();
        let process = ChannelProcess::start(
            "scratch",
            &sh(r#"touch "$TMPDIR/leftover.txt"; echo '{"type":"done"}'"#),
            dir.path(),
            10,
        )
        .await
        .unwrap();
        let scratch = process.scratch_path().unwrap();

        let mut lines = process.read_lines().await;
        assert_eq!(
            lines.next().await.unwrap(),
            Some(InboundLine::Event(WorkerEvent::Done))
        );
        assert_eq!(lines.next().await.unwrap(), None);
        drop(lines);

        let status = process.wait_exit(Duration::from_secs(2)).await.unwrap();
        assert!(status.success());
        assert!(scratch.join("leftover.txt").exists());
        assert_eq!(process.cleanup(), 1);
        assert!(!scratch.exists());
        assert_eq!(process.cleanup(), 0);
    }
}
