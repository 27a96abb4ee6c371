//! Error taxonomy for the execution engine
//!
//! Errors local to one poll iteration are absorbed by the caller and retried;
//! only spawn failures, confirmed termination and forced timeouts end a session.

use std::time::Duration;

use thiserror::Error;

use crate::core::SessionId;

#[derive(Debug, Error)]
pub enum ExecError {
    /// The scratch file or the child process could not be created
    #[error("failed to spawn engine ({context}): {source}")]
    Spawn {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// stdin is closed or the process has exited
    #[error("stdin write failed: {0}")]
    Write(String),

    /// A stream read failed for a reason other than EOF
    #[error("stream read failed: {0}")]
    Read(#[source] std::io::Error),

    /// The process did not go away when asked to
    #[error("failed to terminate process: {0}")]
    Terminate(String),

    #[error("unknown session: {0}")]
    RegistryMiss(SessionId),

    #[error("session {0} is already active")]
    SessionActive(SessionId),

    /// Transient queue backend failure
    #[error("queue backend unavailable: {0}")]
    QueueUnavailable(String),

    #[error("execution exceeded the {}s limit", .0.as_secs())]
    Timeout(Duration),
}

impl ExecError {
    pub fn spawn(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn {
            context: context.into(),
            source,
        }
    }

    /// Whether retrying the same operation later can succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::QueueUnavailable(_) | Self::Read(_))
    }
}

pub type ExecResult<T> = Result<T, ExecError>;
