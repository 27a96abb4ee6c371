//! Shared test helpers: `/bin/sh` stands in for the pseudocode engine.

use std::path::Path;
use std::time::Duration;

use crate::config::{EngineCommand, ExecutorConfig};
use crate::executor::{InteractiveExecutor, Interaction, Signal};

/// Minimal DECLARE/INPUT/OUTPUT interpreter written in sh
pub const PSEUDO_FIXTURE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/test-codes/mini_pseudo.sh");

/// Runs the scratch file as a shell script
pub fn shell_engine() -> EngineCommand {
    EngineCommand::new("sh")
}

pub fn pseudo_engine() -> EngineCommand {
    EngineCommand::new("sh").with_args([PSEUDO_FIXTURE])
}

pub fn shell_config(scratch_dir: &Path) -> ExecutorConfig {
    ExecutorConfig::default()
        .with_engine(shell_engine())
        .with_scratch_dir(scratch_dir)
        .with_poll_interval(Duration::from_millis(20))
        .with_max_session_duration(Duration::from_secs(10))
        .with_read_timeout(Duration::from_millis(500))
}

pub fn pseudo_config(scratch_dir: &Path) -> ExecutorConfig {
    shell_config(scratch_dir).with_engine(pseudo_engine())
}

/// Advance `executor` until it stops or `max_steps` runs out, feeding one of
/// `inputs` per iteration after the first.
pub async fn drive(
    executor: &mut InteractiveExecutor,
    inputs: &[&str],
    max_steps: usize,
) -> Vec<Signal> {
    let mut pending = inputs.iter();
    let mut signals = executor.advance(None).await;
    for _ in 0..max_steps {
        if executor.is_stopped() {
            break;
        }
        let interaction = pending.next().map(|data| Interaction::input(*data));
        signals.extend(executor.advance(interaction).await);
    }
    signals
}
