use serde::{Deserialize, Serialize};

/// Status event emitted by an executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
    Running { message: String },
    /// One stdout line
    Output { line: String },
    /// One stderr line, or a stream condition such as `EOF`
    Exception { reason: String },
    /// Terminal signal
    Stopped { summary: StopSummary },
}

impl Signal {
    pub fn running(message: impl Into<String>) -> Self {
        Signal::Running {
            message: message.into(),
        }
    }

    pub fn output(line: impl Into<String>) -> Self {
        Signal::Output { line: line.into() }
    }

    pub fn exception(reason: impl Into<String>) -> Self {
        Signal::Exception {
            reason: reason.into(),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Signal::Running { .. })
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Signal::Stopped { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    /// The process exited on its own
    Exited,
    /// stdout closed; the process was terminated if it lingered
    StreamEof,
    SpawnFailed { message: String },
    Timeout { limit_secs: u64 },
    Cancelled,
}

/// Best-effort result carried by `Signal::Stopped`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopSummary {
    pub reason: StopReason,
    pub exit_code: Option<i32>,
    /// Most recent stdout lines, in order
    pub output: Vec<String>,
    /// Most recent stderr lines, in order
    pub errors: Vec<String>,
    /// Lines left out of `output` and `errors` by the summary cap
    #[serde(default)]
    pub dropped_lines: u64,
}

impl StopSummary {
    pub fn new(reason: StopReason) -> Self {
        Self {
            reason,
            exit_code: None,
            output: Vec::new(),
            errors: Vec::new(),
            dropped_lines: 0,
        }
    }
}

/// Request to feed data into a running process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Interaction {
    Input { data: String },
}

impl Interaction {
    pub fn input(data: impl Into<String>) -> Self {
        Interaction::Input { data: data.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_json_shape() {
        let json = serde_json::to_value(Signal::output("7")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "output", "line": "7"}));

        let json = serde_json::to_value(Signal::exception("EOF")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "exception", "reason": "EOF"}));
    }

    #[test]
    fn test_stopped_json_shape() {
        let mut summary = StopSummary::new(StopReason::Timeout { limit_secs: 120 });
        summary.output.push("1".into());
        let json = serde_json::to_value(Signal::Stopped { summary }).unwrap();

        assert_eq!(json["type"], "stopped");
        assert_eq!(json["summary"]["reason"]["kind"], "timeout");
        assert_eq!(json["summary"]["reason"]["limit_secs"], 120);
        assert_eq!(json["summary"]["output"][0], "1");
        assert_eq!(json["summary"]["dropped_lines"], 0);
    }

    #[test]
    fn test_summary_without_dropped_lines_parses() {
        let raw = r#"{"reason":{"kind":"exited"},"exit_code":0,"output":["a"],"errors":[]}"#;
        let summary: StopSummary = serde_json::from_str(raw).unwrap();
        assert_eq!(summary.dropped_lines, 0);
        assert_eq!(summary.output, vec!["a"]);
    }

    #[test]
    fn test_interaction_from_json() {
        let parsed: Interaction =
            serde_json::from_str(r#"{"type":"input","data":"42"}"#).unwrap();
        assert_eq!(parsed, Interaction::input("42"));
    }
}
