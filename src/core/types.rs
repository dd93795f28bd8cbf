use crate::kernel::cgroup::backend::ResourceUsage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How the proxy runs the payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadMode {
    Direct,
    /// Under the syscall tracer, frames written to the output pipe
    Traced,
}

/// Host->proxy launch contract.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SandboxLaunchRequest {
    pub run_id: String,
    pub binary: PathBuf,
    pub mode: PayloadMode,
    pub hostname: String,
}

/// Proxy->host completion report.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyStatus {
    /// Payload pid as seen from the host namespace
    pub payload_pid: Option<i32>,
    pub exit_code: Option<i32>,
    pub term_signal: Option<i32>,
    pub internal_error: Option<String>,
    pub trace_truncated: bool,
    pub events_emitted: u64,
}

/// What the deadline kill did to the proxy's process group.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KillReport {
    /// Signals delivered to the whole group, in order
    pub group_signals: Vec<String>,
    /// Signals that only reached the proxy pid, with the group error
    pub fallbacks: Vec<String>,
    pub escalation_ms: u64,
}

impl KillReport {
    /// Whether every signal reached the whole group.
    pub fn reached_group(&self) -> bool {
        self.fallbacks.is_empty()
    }

    pub fn summary(&self) -> String {
        let mut text = format!(
            "group signals [{}] over {}ms",
            self.group_signals.join(", "),
            self.escalation_ms
        );
        if !self.reached_group() {
            text.push_str(&format!("; fallbacks [{}]", self.fallbacks.join("; ")));
        }
        text
    }
}

/// Everything the supervisor observed about one launch.
#[derive(Clone, Debug)]
pub struct LaunchOutcome {
    pub proxy_pid: i32,
    pub timed_out: bool,
    pub elapsed: Duration,
    /// `None` when the proxy died before reporting
    pub status: Option<ProxyStatus>,
    /// Output-pipe lines stamped when they arrived
    pub lines: Vec<(String, DateTime<Utc>)>,
    pub kill_report: Option<KillReport>,
    pub usage: Option<ResourceUsage>,
}

impl LaunchOutcome {
    /// Exit classification shared by every executor path.
    ///
    /// Timeout wins over everything; proxy failures report -1; signal
    /// deaths report 128 + signal.
    pub fn classify(&self) -> (i32, Option<String>, Option<i32>) {
        if self.timed_out {
            return (124, Some("execution timeout".to_string()), None);
        }
        let Some(status) = &self.status else {
            return (-1, Some("sandbox proxy exited without a status".to_string()), None);
        };
        if let Some(err) = &status.internal_error {
            return (-1, Some(err.clone()), None);
        }
        match (status.exit_code, status.term_signal) {
            (_, Some(signal)) => (128 + signal, None, Some(signal)),
            (Some(code), None) => (code, None, None),
            (None, None) => (-1, Some("payload exit status unknown".to_string()), None),
        }
    }
}
