//! Interactive executor
//!
//! Drives one interpreter process from spawn to stop. The caller pumps it with
//! [`InteractiveExecutor::advance`]; every call performs one bounded poll
//! iteration and returns the batch of signals it produced.
//!
//! ```text
//! Idle --advance--> Running --advance*--> Stopped
//!                      |                     ^
//!                      +----stop(reason)-----+
//! ```

mod signal;

pub use signal::{Interaction, Signal, StopReason, StopSummary};

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::ExecutorConfig;
use crate::core::SessionId;
use crate::process::{ProcessHandle, ProcessRegistry, SharedHandle, StreamEvent, StreamKind};

pub const STARTED_MESSAGE: &str = "Process started";
pub const KEEPALIVE_MESSAGE: &str = "Process is running...";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Idle,
    Running,
    Stopped,
}

pub struct InteractiveExecutor {
    session_id: SessionId,
    source: String,
    config: Arc<ExecutorConfig>,
    registry: ProcessRegistry,
    handle: Option<SharedHandle>,
    state: ExecutorState,
    /// Set once stdout hits EOF; the next iteration finishes the session
    stdout_eof: bool,
    output: VecDeque<String>,
    errors: VecDeque<String>,
    dropped_lines: u64,
}

impl InteractiveExecutor {
    pub fn new(
        session_id: SessionId,
        source: impl Into<String>,
        config: Arc<ExecutorConfig>,
        registry: ProcessRegistry,
    ) -> Self {
        Self {
            session_id,
            source: source.into(),
            config,
            registry,
            handle: None,
            state: ExecutorState::Idle,
            stdout_eof: false,
            output: VecDeque::new(),
            errors: VecDeque::new(),
            dropped_lines: 0,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn state(&self) -> ExecutorState {
        self.state
    }

    pub fn is_stopped(&self) -> bool {
        self.state == ExecutorState::Stopped
    }

    /// Run one iteration, applying at most one interaction.
    ///
    /// From `Idle` this spawns the process. A spawn failure yields a lone
    /// `Stopped`. Once stopped, every call returns an empty batch.
    pub async fn advance(&mut self, interaction: Option<Interaction>) -> Vec<Signal> {
        match self.state {
            ExecutorState::Idle => self.start(interaction).await,
            ExecutorState::Running => self.step(interaction).await,
            ExecutorState::Stopped => Vec::new(),
        }
    }

    /// Force the session down: end the process, drop the registry entry and
    /// emit the final `Stopped`. Empty if already stopped.
    ///
    /// A timed-out process is killed outright; other reasons get
    /// `terminate_grace` to exit after SIGTERM.
    pub async fn stop(&mut self, reason: StopReason) -> Vec<Signal> {
        if self.state == ExecutorState::Stopped {
            return Vec::new();
        }

        let exit_code = match self.handle.take() {
            Some(shared) => {
                self.registry.remove(&self.session_id);
                let mut handle = shared.lock().await;
                let ended = match reason {
                    StopReason::Timeout { .. } => handle.kill().await,
                    _ => handle.terminate(self.config.terminate_grace).await,
                };
                if let Err(e) = ended {
                    error!("Failed to terminate session {}: {}", self.session_id, e);
                }
                handle.exit_code()
            }
            None => None,
        };

        vec![self.stopped(reason, exit_code)]
    }

    async fn start(&mut self, interaction: Option<Interaction>) -> Vec<Signal> {
        let spawned = ProcessHandle::spawn(
            self.session_id.clone(),
            &self.source,
            &self.config.engine,
            &self.config.scratch_dir,
        )
        .await
        .and_then(|handle| self.registry.put(handle));

        let shared = match spawned {
            Ok(shared) => shared,
            Err(e) => {
                error!("Session {} could not start: {}", self.session_id, e);
                let reason = StopReason::SpawnFailed {
                    message: e.to_string(),
                };
                return vec![self.stopped(reason, None)];
            }
        };

        self.state = ExecutorState::Running;
        let mut signals = vec![Signal::running(STARTED_MESSAGE)];
        {
            let mut handle = shared.lock().await;
            info!("Session {} started (pid {})", self.session_id, handle.pid());
            if let Some(interaction) = interaction {
                signals.extend(deliver(&self.session_id, &mut handle, interaction).await);
            }
        }
        self.handle = Some(shared);
        signals
    }

    async fn step(&mut self, interaction: Option<Interaction>) -> Vec<Signal> {
        if self.stdout_eof {
            return self.finish().await;
        }
        let Some(shared) = self.handle.clone() else {
            return self.finish().await;
        };
        let mut handle = shared.lock().await;

        let mut signals = Vec::new();
        let events = match handle.poll_streams(self.config.poll_interval).await {
            Ok(events) => events,
            Err(e) => {
                warn!("Read error in session {}: {}", self.session_id, e);
                signals.push(Signal::exception(format!("read failed: {}", e)));
                Vec::new()
            }
        };
        let nothing_read = events.is_empty();

        for event in events {
            match event {
                StreamEvent::Line(StreamKind::Stdout, line) => {
                    self.keep(StreamKind::Stdout, line.clone());
                    signals.push(Signal::output(line));
                }
                StreamEvent::Eof(StreamKind::Stdout) => {
                    self.stdout_eof = true;
                    signals.push(Signal::exception("EOF"));
                }
                StreamEvent::Line(StreamKind::Stderr, line) => {
                    self.keep(StreamKind::Stderr, line.clone());
                    signals.push(Signal::exception(line));
                }
                // the interpreter closes stderr early on some paths; not a stop condition
                StreamEvent::Eof(StreamKind::Stderr) => {
                    debug!("stderr of session {} closed, ignoring", self.session_id);
                }
            }
        }
        signals.push(Signal::running(KEEPALIVE_MESSAGE));

        if let Some(interaction) = interaction {
            signals.extend(deliver(&self.session_id, &mut handle, interaction).await);
        }

        let exited = nothing_read && !self.stdout_eof && handle.is_terminated();
        drop(handle);

        if exited {
            signals.extend(self.finish().await);
        }
        signals
    }

    /// Natural end: let the process exit, then release it
    async fn finish(&mut self) -> Vec<Signal> {
        let (reason, exit_code) = match self.handle.take() {
            Some(shared) => {
                self.registry.remove(&self.session_id);
                let mut handle = shared.lock().await;
                let exited = match handle.shutdown(self.config.terminate_grace).await {
                    Ok(exited) => exited,
                    Err(e) => {
                        error!("Failed to shut down session {}: {}", self.session_id, e);
                        false
                    }
                };
                let reason = if exited {
                    StopReason::Exited
                } else {
                    StopReason::StreamEof
                };
                (reason, handle.exit_code())
            }
            None => (StopReason::StreamEof, None),
        };
        vec![self.stopped(reason, exit_code)]
    }

    /// Remember a line for the summary, evicting the oldest past the cap
    fn keep(&mut self, stream: StreamKind, line: String) {
        let limit = self.config.summary_line_limit;
        let lines = match stream {
            StreamKind::Stdout => &mut self.output,
            StreamKind::Stderr => &mut self.errors,
        };
        lines.push_back(line);
        while lines.len() > limit {
            lines.pop_front();
            self.dropped_lines += 1;
        }
    }

    fn stopped(&mut self, reason: StopReason, exit_code: Option<i32>) -> Signal {
        self.state = ExecutorState::Stopped;
        info!(
            "Session {} stopped: {:?} (exit code {:?}, {} output lines, {} dropped)",
            self.session_id,
            reason,
            exit_code,
            self.output.len(),
            self.dropped_lines
        );
        Signal::Stopped {
            summary: StopSummary {
                reason,
                exit_code,
                output: std::mem::take(&mut self.output).into(),
                errors: std::mem::take(&mut self.errors).into(),
                dropped_lines: std::mem::take(&mut self.dropped_lines),
            },
        }
    }
}

/// Write one interaction to stdin. A failed write on a live process comes back
/// as an `Exception`; on a dead one it is dropped and the next poll sees the
/// exit.
async fn deliver(
    session_id: &SessionId,
    handle: &mut ProcessHandle,
    interaction: Interaction,
) -> Option<Signal> {
    match interaction {
        Interaction::Input { data } => match handle.write_line(&data).await {
            Ok(()) => {
                debug!("Session {} <- {:?}", session_id, data);
                None
            }
            Err(e) if handle.is_terminated() => {
                debug!("Session {} dropped input, process gone: {}", session_id, e);
                None
            }
            Err(e) => {
                warn!("Session {} input not delivered: {}", session_id, e);
                Some(Signal::exception(format!("input not delivered: {}", e)))
            }
        },
    }
}
