/// Sandboxed benchmark execution
/// Validates and stages a binary, runs it through the supervisor and turns
/// whatever happened into a `BenchResult`
use crate::binary::validate_binary;
use crate::config::types::{Result, SandboxConfig};
use crate::config::validator::validate_config;
use crate::core::supervisor::launch_with_supervisor;
use crate::core::types::{LaunchOutcome, PayloadMode, SandboxLaunchRequest};
use crate::kernel::cgroup::backend::ResourceUsage;
use crate::kernel::cgroup::governor::ResourceGovernor;
use crate::observability::audit::{events, CorrelationIds};
use crate::safety::stage_binary;
use crate::trace::protocol::parse_transcript;
use crate::trace::types::SyscallEvent;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};

/// Outcome of one sandboxed run. `success` is exactly `exit_code == 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
    pub exit_code: i32,
    pub runtime_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_usage: Option<ResourceUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syscalls: Option<Vec<SyscallEvent>>,
}

impl BenchResult {
    pub fn new(exit_code: i32, runtime_ms: u64) -> Self {
        Self {
            sandbox_group: None,
            invocation_id: None,
            exit_code,
            runtime_ms,
            success: exit_code == 0,
            error_message: None,
            signal: None,
            resource_usage: None,
            syscalls: None,
        }
    }

    pub fn failed(exit_code: i32, runtime_ms: u64, message: String) -> Self {
        Self {
            error_message: Some(message),
            ..Self::new(exit_code, runtime_ms)
        }
    }

    pub fn timed_out(&self) -> bool {
        self.exit_code == 124 && self.error_message.as_deref() == Some("execution timeout")
    }
}

/// Runs binaries under one validated configuration
pub struct SandboxExecutor {
    config: SandboxConfig,
}

impl SandboxExecutor {
    pub fn new(config: SandboxConfig) -> Result<Self> {
        validate_config(&config)?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn run(&self, bytes: &[u8], mode: PayloadMode) -> Result<BenchResult> {
        if let Err(e) = validate_binary(bytes, Some(self.config.max_file_size)) {
            events::validation_rejected(e.to_string());
            return Err(e.into());
        }

        // Ceilings are only applied to traced runs.
        let governor = match mode {
            PayloadMode::Traced => ResourceGovernor::establish(&self.config)?,
            PayloadMode::Direct => None,
        };

        let staged = stage_binary(bytes, &self.config.temp_dir_prefix)?;
        let correlation = CorrelationIds::new();
        let request = SandboxLaunchRequest {
            run_id: correlation.run_id.clone(),
            binary: staged.path().to_path_buf(),
            mode,
            hostname: self.config.hostname.clone(),
        };

        events::execution_start(&correlation, mode_name(mode));
        let launched =
            launch_with_supervisor(&request, self.config.max_execution_time, governor.as_ref());

        let staging_dir = staged.dir().map(|dir| dir.display().to_string());
        if let Err(e) = staged.release() {
            log::warn!("{}", e);
            events::cleanup_failure(staging_dir.unwrap_or_default(), e.to_string());
        }

        let outcome = match launched {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!("Sandbox launch failed: {}", e);
                let mut result = BenchResult::failed(-1, 0, e.to_string());
                if let Some(governor) = &governor {
                    result.sandbox_group = Some(governor.group().to_string());
                    result.invocation_id = Some(governor.invocation_id().to_string());
                }
                return Ok(result);
            }
        };

        let correlation = correlation.with_root_pid(outcome.proxy_pid);
        let result = self.build_result(&outcome, mode, &correlation);
        events::execution_end(&correlation, result.exit_code, result.runtime_ms);
        Ok(result)
    }

    fn build_result(
        &self,
        outcome: &LaunchOutcome,
        mode: PayloadMode,
        correlation: &CorrelationIds,
    ) -> BenchResult {
        let runtime_ms = outcome.elapsed.as_millis() as u64;
        let (exit_code, error_message, signal) = outcome.classify();

        if outcome.timed_out {
            events::execution_timeout(
                correlation,
                self.config.max_execution_time.as_millis() as u64,
                outcome.kill_report.as_ref(),
            );
        }

        let mut result = BenchResult::new(exit_code, runtime_ms);
        result.error_message = error_message;
        result.signal = signal.and_then(signal_name);
        result.resource_usage = outcome.usage.clone();

        if mode == PayloadMode::Traced {
            let pid = outcome
                .status
                .as_ref()
                .and_then(|status| status.payload_pid)
                .unwrap_or(outcome.proxy_pid);
            let transcript = parse_transcript(&outcome.lines, pid);
            if let Some(status) = transcript.status {
                result.sandbox_group = Some(status.sandbox_group);
                result.invocation_id = Some(status.invocation_id);
            }
            if transcript.skipped_lines > 0 {
                log::debug!("Skipped {} malformed trace lines", transcript.skipped_lines);
            }
            if outcome.status.as_ref().is_some_and(|s| s.trace_truncated) {
                events::trace_truncated(pid, transcript.events.len() as u64);
            }
            result.syscalls = Some(transcript.events);
        }

        log::info!(
            "Run {} finished: exit_code={} runtime_ms={}",
            correlation.run_id,
            result.exit_code,
            result.runtime_ms
        );
        result
    }
}

fn mode_name(mode: PayloadMode) -> &'static str {
    match mode {
        PayloadMode::Direct => "direct",
        PayloadMode::Traced => "traced",
    }
}

fn signal_name(signal: i32) -> Option<String> {
    Signal::try_from(signal)
        .ok()
        .map(|signal| signal.as_str().to_string())
}

/// Run `bytes` inside the sandbox without tracing.
pub fn run_benchmark(bytes: &[u8], config: &SandboxConfig) -> Result<BenchResult> {
    SandboxExecutor::new(config.clone())?.run(bytes, PayloadMode::Direct)
}

/// Run `bytes` inside the sandbox under the tracing helper, with ceilings.
pub fn run_benchmark_with_trace(bytes: &[u8], config: &SandboxConfig) -> Result<BenchResult> {
    SandboxExecutor::new(config.clone())?.run(bytes, PayloadMode::Traced)
}
