//! Child process handle
//!
//! A `ProcessHandle` owns one interpreter process and its three pipes. The
//! pipes are never shared: whoever holds the handle is the only reader of
//! stdout/stderr and the only writer of stdin.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, SystemTime};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal as UnixSignal};
use nix::unistd::Pid;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tracing::{debug, warn};

use super::status::ProcessState;
use crate::config::EngineCommand;
use crate::core::{scratch_file_name, SessionId};
use crate::error::{ExecError, ExecResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// One observation on an output stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A complete line, without its terminator
    Line(StreamKind, String),
    /// The stream is closed; it will not be polled again
    Eof(StreamKind),
}

impl StreamEvent {
    pub fn kind(&self) -> StreamKind {
        match self {
            StreamEvent::Line(kind, _) | StreamEvent::Eof(kind) => *kind,
        }
    }
}

/// Newline-framed reader over one output pipe.
///
/// Bytes of an unfinished line stay in `pending` when a read is cancelled,
/// so dropping `next_event` mid-line loses nothing. Lines are decoded
/// lossily: invalid UTF-8 becomes U+FFFD instead of an error.
#[derive(Debug)]
struct LineReader<R> {
    kind: StreamKind,
    reader: BufReader<R>,
    pending: Vec<u8>,
    open: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(kind: StreamKind, inner: R) -> Self {
        Self {
            kind,
            reader: BufReader::new(inner),
            pending: Vec::new(),
            open: true,
        }
    }

    async fn next_event(&mut self) -> ExecResult<StreamEvent> {
        let read = self
            .reader
            .read_until(b'\n', &mut self.pending)
            .await
            .map_err(ExecError::Read)?;

        if read == 0 && self.pending.is_empty() {
            self.open = false;
            return Ok(StreamEvent::Eof(self.kind));
        }

        let mut bytes = std::mem::take(&mut self.pending);
        if bytes.last() == Some(&b'\n') {
            bytes.pop();
            if bytes.last() == Some(&b'\r') {
                bytes.pop();
            }
        }
        Ok(StreamEvent::Line(
            self.kind,
            String::from_utf8_lossy(&bytes).into_owned(),
        ))
    }

    async fn next_event_within(&mut self, timeout: Duration) -> ExecResult<Option<StreamEvent>> {
        if !self.open {
            return Ok(Some(StreamEvent::Eof(self.kind)));
        }
        match tokio::time::timeout(timeout, self.next_event()).await {
            Ok(event) => event.map(Some),
            Err(_) => Ok(None),
        }
    }
}

#[derive(Debug)]
pub struct ProcessHandle {
    session_id: SessionId,
    pid: u32,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: LineReader<ChildStdout>,
    stderr: LineReader<ChildStderr>,
    scratch_path: PathBuf,
    created_at: SystemTime,
    exit_status: Option<ExitStatus>,
}

impl ProcessHandle {
    /// Write `source` to a fresh scratch file under `scratch_dir` and start
    /// `engine` on it with all three standard streams piped.
    pub async fn spawn(
        session_id: SessionId,
        source: &str,
        engine: &EngineCommand,
        scratch_dir: &Path,
    ) -> ExecResult<Self> {
        fs::create_dir_all(scratch_dir).await.map_err(|e| {
            ExecError::spawn(
                format!("cannot create scratch dir {}", scratch_dir.display()),
                e,
            )
        })?;

        let created_at = SystemTime::now();
        let scratch_path = scratch_dir.join(scratch_file_name(source, created_at));
        fs::write(&scratch_path, source).await.map_err(|e| {
            ExecError::spawn(format!("cannot write {}", scratch_path.display()), e)
        })?;

        let mut child = engine
            .command_for(&scratch_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::spawn(format!("cannot start {}", engine), e))?;

        let pid = child.id().unwrap_or_default();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

        debug!(
            "Spawned pid {} for session {} ({})",
            pid,
            session_id,
            scratch_path.display()
        );

        Ok(Self {
            session_id,
            pid,
            child,
            stdin,
            stdout: LineReader::new(StreamKind::Stdout, stdout),
            stderr: LineReader::new(StreamKind::Stderr, stderr),
            scratch_path,
            created_at,
            exit_status: None,
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn scratch_path(&self) -> &Path {
        &self.scratch_path
    }

    /// Exit code once the process has been reaped; `None` while running or
    /// when it was killed by a signal
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_status.and_then(|status| status.code())
    }

    /// Non-blocking liveness check. Reaps the child if it has exited.
    pub fn is_terminated(&mut self) -> bool {
        if self.exit_status.is_some() {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(
                    "Failed to poll pid {} of session {}: {}",
                    self.pid, self.session_id, e
                );
                true
            }
        }
    }

    /// OS-level state of the process
    pub fn state(&mut self) -> ProcessState {
        if self.is_terminated() {
            ProcessState::Dead
        } else {
            ProcessState::probe(self.pid)
        }
    }

    /// Read at most one line from `stream`, waiting no longer than `timeout`.
    ///
    /// `Ok(None)` means nothing became ready in time.
    pub async fn read_line(
        &mut self,
        stream: StreamKind,
        timeout: Duration,
    ) -> ExecResult<Option<StreamEvent>> {
        match stream {
            StreamKind::Stdout => self.stdout.next_event_within(timeout).await,
            StreamKind::Stderr => self.stderr.next_event_within(timeout).await,
        }
    }

    /// Wait until stdout or stderr is readable, or `timeout` elapses, and take
    /// at most one line from each ready stream. stdout wins ties.
    ///
    /// An empty result means the wait timed out. Closed streams are skipped.
    pub async fn poll_streams(&mut self, timeout: Duration) -> ExecResult<Vec<StreamEvent>> {
        let Self { stdout, stderr, .. } = self;
        let (stdout_open, stderr_open) = (stdout.open, stderr.open);

        if !stdout_open && !stderr_open {
            tokio::time::sleep(timeout).await;
            return Ok(Vec::new());
        }

        let first = tokio::select! {
            biased;
            event = stdout.next_event(), if stdout_open => event?,
            event = stderr.next_event(), if stderr_open => event?,
            _ = tokio::time::sleep(timeout) => return Ok(Vec::new()),
        };

        let second = match first.kind() {
            StreamKind::Stdout if stderr.open => ready_now(stderr.next_event()).await,
            StreamKind::Stderr if stdout.open => ready_now(stdout.next_event()).await,
            _ => None,
        };

        let mut events = vec![first];
        match second {
            Some(Ok(event)) => events.push(event),
            Some(Err(e)) => warn!("Dropped unreadable line: {}", e),
            None => {}
        }
        Ok(events)
    }

    /// Write one line to stdin and flush it
    pub async fn write_line(&mut self, text: &str) -> ExecResult<()> {
        if self.is_terminated() {
            return Err(ExecError::Write("process has exited".to_string()));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| ExecError::Write("stdin is closed".to_string()))?;

        let mut payload = String::with_capacity(text.len() + 1);
        payload.push_str(text);
        if !text.ends_with('\n') {
            payload.push('\n');
        }

        let result = match stdin.write_all(payload.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                self.stdin = None;
            }
            return Err(ExecError::Write(e.to_string()));
        }
        Ok(())
    }

    /// Send SIGTERM, wait up to `grace`, then SIGKILL. No-op once terminated.
    pub async fn terminate(&mut self, grace: Duration) -> ExecResult<()> {
        if self.is_terminated() {
            return Ok(());
        }
        self.stdin = None;

        if self.pid != 0 {
            match kill(Pid::from_raw(self.pid as i32), UnixSignal::SIGTERM) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!("SIGTERM to pid {} failed: {}", self.pid, e),
            }
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.exit_status = Some(status);
                return Ok(());
            }
            Ok(Err(e)) => return Err(ExecError::Terminate(e.to_string())),
            Err(_) => warn!(
                "pid {} ignored SIGTERM for {:?}, sending SIGKILL",
                self.pid, grace
            ),
        }

        self.child
            .kill()
            .await
            .map_err(|e| ExecError::Terminate(e.to_string()))?;
        self.is_terminated();
        Ok(())
    }

    /// SIGKILL right away and reap. No-op once terminated.
    pub async fn kill(&mut self) -> ExecResult<()> {
        if self.is_terminated() {
            return Ok(());
        }
        self.stdin = None;
        self.child
            .kill()
            .await
            .map_err(|e| ExecError::Terminate(e.to_string()))?;
        self.is_terminated();
        Ok(())
    }

    /// Give the process up to `grace` to exit on its own, then terminate it.
    ///
    /// Returns `true` if it exited without being signalled.
    pub async fn shutdown(&mut self, grace: Duration) -> ExecResult<bool> {
        if self.is_terminated() {
            return Ok(true);
        }
        self.stdin = None;

        if let Ok(Ok(status)) = tokio::time::timeout(grace, self.child.wait()).await {
            self.exit_status = Some(status);
            return Ok(true);
        }
        self.terminate(grace).await?;
        Ok(false)
    }
}

fn missing_pipe(name: &str) -> ExecError {
    ExecError::spawn(
        format!("{} pipe", name),
        std::io::Error::new(std::io::ErrorKind::Other, "stream was not captured"),
    )
}

/// Poll `fut` exactly once
async fn ready_now<F: Future>(fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        out = fut => Some(out),
        _ = std::future::ready(()) => None,
    }
}
