//! Call/response access to registered processes
//!
//! Each call looks its handle up by session id, does one bounded operation
//! and returns a [`CommunicateResult`]. Nothing here raises: unknown ids,
//! dead processes and I/O failures all come back as `ok == false`.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ExecutorConfig;
use crate::core::SessionId;
use crate::error::ExecError;
use crate::process::{ProcessHandle, ProcessRegistry, StreamEvent, StreamKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpOutcome {
    Success,
    /// Nothing to read yet
    Pending,
    /// Another caller holds the process
    Busy,
    /// The process can no longer be used
    Unavailable,
    NotFound,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunicateResult {
    /// OS pid, `-1` when the session is unknown
    pub process_id: i64,
    pub ok: bool,
    /// `Success`, the line read, or a failure description
    pub message: String,
    pub outcome: OpOutcome,
}

impl CommunicateResult {
    fn new(process_id: i64, outcome: OpOutcome, message: impl Into<String>) -> Self {
        Self {
            process_id,
            ok: outcome == OpOutcome::Success,
            message: message.into(),
            outcome,
        }
    }

    pub fn success(process_id: i64, message: impl Into<String>) -> Self {
        Self::new(process_id, OpOutcome::Success, message)
    }

    pub fn not_found() -> Self {
        Self::new(-1, OpOutcome::NotFound, "Process not found")
    }

    pub fn error(process_id: i64, detail: impl std::fmt::Display) -> Self {
        Self::new(process_id, OpOutcome::Failed, format!("Error: {}", detail))
    }

    /// Map an engine error onto the call result. Transient failures are
    /// reported as `Pending` so the caller retries.
    pub fn from_error(process_id: i64, err: &ExecError) -> Self {
        match err {
            ExecError::RegistryMiss(_) => Self::not_found(),
            e if e.is_transient() => {
                Self::new(process_id, OpOutcome::Pending, format!("Retry later: {}", e))
            }
            e => Self::error(process_id, e),
        }
    }

    /// Whether the same call may succeed later, as opposed to the session
    /// being gone or broken
    pub fn is_retryable(&self) -> bool {
        matches!(self.outcome, OpOutcome::Pending | OpOutcome::Busy)
    }
}

#[derive(Clone)]
pub struct StatelessExecutionOps {
    registry: ProcessRegistry,
    config: Arc<ExecutorConfig>,
}

impl StatelessExecutionOps {
    pub fn new(registry: ProcessRegistry, config: Arc<ExecutorConfig>) -> Self {
        Self { registry, config }
    }

    /// Spawn the engine on `source` and register it under `session_id`
    pub async fn create(&self, session_id: &SessionId, source: &str) -> CommunicateResult {
        if self.registry.contains(session_id) {
            return CommunicateResult::error(-1, format!("session {} is already active", session_id));
        }

        let handle = match ProcessHandle::spawn(
            session_id.clone(),
            source,
            &self.config.engine,
            &self.config.scratch_dir,
        )
        .await
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Stateless create for {} failed: {}", session_id, e);
                return CommunicateResult::error(-1, e);
            }
        };

        let pid = i64::from(handle.pid());
        match self.registry.put(handle) {
            Ok(_) => {
                info!("Stateless session {} created (pid {})", session_id, pid);
                CommunicateResult::success(pid, "Success")
            }
            Err(e) => CommunicateResult::from_error(pid, &e),
        }
    }

    /// Write one line to the process stdin
    pub async fn write_input(&self, session_id: &SessionId, text: &str) -> CommunicateResult {
        let entry = match self.registry.lookup(session_id) {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Write to {} rejected: {}", session_id, e);
                return CommunicateResult::from_error(-1, &e);
            }
        };
        let pid = i64::from(entry.pid);
        let Ok(mut handle) = entry.handle.try_lock() else {
            return CommunicateResult::new(pid, OpOutcome::Busy, "Process is locked");
        };

        let state = handle.state();
        if state.is_unusable() {
            return CommunicateResult::new(
                pid,
                OpOutcome::Unavailable,
                format!("Process is {}", state),
            );
        }

        match handle.write_line(text).await {
            Ok(()) => CommunicateResult::success(pid, "Success"),
            Err(e) => CommunicateResult::from_error(pid, &e),
        }
    }

    /// Read one stdout line, waiting at most the configured read timeout
    pub async fn read_output(&self, session_id: &SessionId) -> CommunicateResult {
        let entry = match self.registry.lookup(session_id) {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Read from {} rejected: {}", session_id, e);
                return CommunicateResult::from_error(-1, &e);
            }
        };
        let pid = i64::from(entry.pid);
        let Ok(mut handle) = entry.handle.try_lock() else {
            return CommunicateResult::new(pid, OpOutcome::Busy, "Process is locked");
        };

        let read = handle
            .read_line(StreamKind::Stdout, self.config.read_timeout)
            .await;
        drop(handle);

        match read {
            Ok(Some(StreamEvent::Line(_, line))) => CommunicateResult::success(pid, line),
            Ok(Some(StreamEvent::Eof(_))) => {
                self.cleanup(session_id).await;
                CommunicateResult::new(pid, OpOutcome::Unavailable, "Process output ended")
            }
            Ok(None) => CommunicateResult::new(pid, OpOutcome::Pending, "No output yet"),
            Err(e) => CommunicateResult::from_error(pid, &e),
        }
    }

    /// Terminate and unregister a session. `false` if it was not registered.
    pub async fn cleanup(&self, session_id: &SessionId) -> bool {
        let Some(shared) = self.registry.remove(session_id) else {
            return false;
        };
        let mut handle = shared.lock().await;
        if let Err(e) = handle.terminate(self.config.terminate_grace).await {
            warn!("Cleanup of session {} failed: {}", session_id, e);
        }
        debug!("Session {} cleaned up", session_id);
        true
    }

    /// Clean up every registered process older than the session limit.
    /// Returns how many were reaped.
    pub async fn reap_expired(&self) -> usize {
        self.reap_older_than(self.config.max_session_duration).await
    }

    async fn reap_older_than(&self, max_age: Duration) -> usize {
        let now = SystemTime::now();
        let mut reaped = 0;
        for entry in self.registry.list_entries() {
            let age = now.duration_since(entry.created_at).unwrap_or_default();
            if age >= max_age && self.cleanup(&entry.session_id).await {
                info!(
                    "Reaped session {} after {}s",
                    entry.session_id,
                    age.as_secs()
                );
                reaped += 1;
            }
        }
        reaped
    }
}
