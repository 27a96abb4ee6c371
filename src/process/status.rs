//! OS-level process state probing

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Running,
    Sleeping,
    DiskSleep,
    Stopped,
    TracingStop,
    Zombie,
    Dead,
    Waking,
    Idle,
    Locked,
}

impl ProcessState {
    /// States in which the process can no longer take input
    pub fn is_unusable(self) -> bool {
        matches!(
            self,
            ProcessState::Zombie | ProcessState::Dead | ProcessState::Stopped | ProcessState::Locked
        )
    }

    /// Map the state letter of `/proc/<pid>/stat`
    pub fn from_stat_code(code: char) -> Option<Self> {
        let state = match code {
            'R' => ProcessState::Running,
            'S' => ProcessState::Sleeping,
            'D' => ProcessState::DiskSleep,
            'T' => ProcessState::Stopped,
            't' => ProcessState::TracingStop,
            'Z' => ProcessState::Zombie,
            'X' | 'x' => ProcessState::Dead,
            'K' | 'W' => ProcessState::Waking,
            'I' | 'P' => ProcessState::Idle,
            'L' => ProcessState::Locked,
            _ => return None,
        };
        Some(state)
    }

    /// Extract the state from a `/proc/<pid>/stat` line.
    ///
    /// The command name field may itself contain spaces and parentheses, so
    /// the state is taken after the last `)`.
    pub fn parse_stat(stat: &str) -> Option<Self> {
        let rest = &stat[stat.rfind(')')? + 1..];
        let code = rest.trim_start().chars().next()?;
        Self::from_stat_code(code)
    }

    /// Current state of `pid`; a missing process is `Dead`
    pub fn probe(pid: u32) -> Self {
        if pid == 0 {
            return ProcessState::Dead;
        }

        #[cfg(target_os = "linux")]
        {
            match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
                Ok(stat) => Self::parse_stat(&stat).unwrap_or(ProcessState::Running),
                Err(_) => ProcessState::Dead,
            }
        }

        #[cfg(not(target_os = "linux"))]
        {
            use nix::sys::signal::kill;
            use nix::unistd::Pid;

            match kill(Pid::from_raw(pid as i32), None) {
                Ok(()) => ProcessState::Running,
                Err(_) => ProcessState::Dead,
            }
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessState::Running => "running",
            ProcessState::Sleeping => "sleeping",
            ProcessState::DiskSleep => "disk sleeping",
            ProcessState::Stopped => "stopped",
            ProcessState::TracingStop => "tracing stop",
            ProcessState::Zombie => "zombie",
            ProcessState::Dead => "dead",
            ProcessState::Waking => "waking",
            ProcessState::Idle => "idle",
            ProcessState::Locked => "locked",
        };
        write!(f, "{}", s)
    }
}
