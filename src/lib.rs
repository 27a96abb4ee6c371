//! Interactive execution worker for the pseudocode judge.
//!
//! Runs the pseudocode interpreter as a child process, exchanges stdin and
//! stdout lines with it while it runs and reports its progress as
//! [`Signal`]s. Sessions are bridged to clients through per-session queue
//! lists (`input_<id>` / `output_<id>`); the [`StatelessExecutionOps`] give
//! call/response access to the same processes.

pub mod config;
pub mod core;
pub mod error;
pub mod executor;
pub mod jobs;
pub mod process;
pub mod redis_manager;
pub mod service;
pub mod session;
pub mod stateless;

#[cfg(test)]
mod testing;

pub use config::{EngineCommand, ExecutorConfig};
pub use crate::core::SessionId;
pub use error::{ExecError, ExecResult};
pub use executor::{Interaction, InteractiveExecutor, Signal, StopReason, StopSummary};
pub use process::{ProcessHandle, ProcessRegistry, ProcessState};
pub use service::{ExecutionService, StartedSession};
pub use session::{ExecutionSession, MemoryQueue, QueueBackend, RedisQueue};
pub use stateless::{CommunicateResult, OpOutcome, StatelessExecutionOps};
