//! Executor configuration
//!
//! Loaded from environment variables (a `.env` file is honoured by the binary),
//! each falling back to a default when unset or unparsable.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tokio::process::Command;
use tracing::warn;

/// Interpreter invocation: `<program> <args...> <scratch file>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl EngineCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Parse a whitespace separated command line; `None` if it is blank
    pub fn parse(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(|s| s.to_string());
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    /// Build the command that runs `scratch_file`
    pub fn command_for(&self, scratch_file: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).arg(scratch_file);
        cmd
    }
}

impl fmt::Display for EngineCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Interpreter used to run scratch files
    pub engine: EngineCommand,
    /// Directory holding one scratch file per execution
    pub scratch_dir: PathBuf,
    /// Bound of the multiplexed stdout/stderr wait
    pub poll_interval: Duration,
    /// Wall-clock limit of one session
    pub max_session_duration: Duration,
    /// Maximum input items drained from the queue per cycle
    pub input_batch_limit: usize,
    /// Time between SIGTERM and SIGKILL
    pub terminate_grace: Duration,
    /// Wait bound of a stateless `read_output`
    pub read_timeout: Duration,
    pub redis_url: String,
    /// Expiry of stateless-op result keys
    pub result_ttl_secs: u64,
    /// Lines of stdout and of stderr kept for the final summary; older ones
    /// are dropped
    pub summary_line_limit: usize,
    /// Undelivered output items a session holds while the queue is down
    pub outbox_limit: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            engine: EngineCommand::new("./Pseudo/PseudoEngine2"),
            scratch_dir: PathBuf::from("./Buffer"),
            poll_interval: Duration::from_millis(100),
            max_session_duration: Duration::from_secs(120),
            input_batch_limit: 200,
            terminate_grace: Duration::from_millis(500),
            read_timeout: Duration::from_millis(1000),
            redis_url: "redis://localhost:6379".to_string(),
            result_ttl_secs: 300,
            summary_line_limit: 1000,
            outbox_limit: 10_000,
        }
    }
}

impl ExecutorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let engine = match std::env::var("ENGINE_COMMAND") {
            Ok(raw) => EngineCommand::parse(&raw).unwrap_or_else(|| {
                warn!("ENGINE_COMMAND is blank, using {}", defaults.engine);
                defaults.engine.clone()
            }),
            Err(_) => defaults.engine.clone(),
        };

        Self {
            engine,
            scratch_dir: std::env::var("SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.scratch_dir),
            poll_interval: Duration::from_millis(env_or("POLL_INTERVAL_MS", 100)),
            max_session_duration: Duration::from_secs(env_or("MAX_SESSION_SECS", 120)),
            input_batch_limit: env_or("INPUT_BATCH_LIMIT", defaults.input_batch_limit),
            terminate_grace: Duration::from_millis(env_or("TERMINATE_GRACE_MS", 500)),
            read_timeout: Duration::from_millis(env_or("READ_TIMEOUT_MS", 1000)),
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            result_ttl_secs: env_or("RESULT_TTL_SECS", defaults.result_ttl_secs),
            summary_line_limit: env_or("SUMMARY_LINE_LIMIT", defaults.summary_line_limit),
            outbox_limit: env_or("OUTBOX_LIMIT", defaults.outbox_limit),
        }
    }

    pub fn with_engine(mut self, engine: EngineCommand) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_session_duration(mut self, limit: Duration) -> Self {
        self.max_session_duration = limit;
        self
    }

    pub fn with_input_batch_limit(mut self, limit: usize) -> Self {
        self.input_batch_limit = limit;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_summary_line_limit(mut self, limit: usize) -> Self {
        self.summary_line_limit = limit;
        self
    }

    pub fn with_outbox_limit(mut self, limit: usize) -> Self {
        self.outbox_limit = limit;
        self
    }
}

fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr + fmt::Display,
    T::Err: fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(e) => {
                warn!("Invalid {}={:?} ({}), using {}", key, raw, e, default);
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_engine_command() {
        let engine = EngineCommand::parse("  ./Pseudo/PseudoEngine2 --quiet ").unwrap();
        assert_eq!(engine.program, "./Pseudo/PseudoEngine2");
        assert_eq!(engine.args, vec!["--quiet"]);
        assert_eq!(engine.to_string(), "./Pseudo/PseudoEngine2 --quiet");

        assert!(EngineCommand::parse("   ").is_none());
    }

    #[test]
    fn test_env_or_fallback() {
        std::env::set_var("PSEUDO_EXEC_TEST_BAD_NUMBER", "fast");
        assert_eq!(env_or("PSEUDO_EXEC_TEST_BAD_NUMBER", 100u64), 100);

        std::env::set_var("PSEUDO_EXEC_TEST_GOOD_NUMBER", " 250 ");
        assert_eq!(env_or("PSEUDO_EXEC_TEST_GOOD_NUMBER", 100u64), 250);

        assert_eq!(env_or("PSEUDO_EXEC_TEST_UNSET", 7usize), 7);
    }

    #[test]
    fn test_defaults() {
        let config = ExecutorConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.input_batch_limit, 200);
        assert_eq!(config.max_session_duration, Duration::from_secs(120));
        assert_eq!(config.summary_line_limit, 1000);
        assert_eq!(config.outbox_limit, 10_000);
    }
}
