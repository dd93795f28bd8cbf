//! Dynamic syscall tracing
//!
//! [`Tracer`] drives a ptrace session and pushes paired entry/exit events
//! into an [`EventSink`]. [`trace_binary`] wraps it with validation and
//! staging; [`spawn_trace`] runs the same thing on a dedicated thread.

pub mod decode;
pub mod protocol;
pub mod tracer;
pub mod types;

pub use tracer::{RootExit, TraceOutcome, Tracer, TracerOptions};
pub use types::{EventKind, Register, SyscallArg, SyscallEvent, SyscallState};

use crate::binary::validate_binary;
use crate::config::types::{BinTraceError, Result, SandboxConfig};
use crate::config::validator::validate_config;
use crate::kernel::syscalls::number_of;
use crate::observability::audit::events;
use crate::safety::stage_binary;
use serde::Serialize;
use std::io;
use std::process::Command;
use std::thread::{self, JoinHandle};

/// Destination for traced events, in emission order
pub trait EventSink {
    fn record(&mut self, event: SyscallEvent) -> io::Result<()>;
}

impl EventSink for Vec<SyscallEvent> {
    fn record(&mut self, event: SyscallEvent) -> io::Result<()> {
        self.push(event);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceReport {
    pub outcome: TraceOutcome,
    pub events: Vec<SyscallEvent>,
}

impl TraceReport {
    pub fn truncated(&self) -> bool {
        self.outcome.truncated
    }

    /// Keep only events for the given syscall numbers. Entry and exit share
    /// a number, so pairs stay intact.
    pub fn retain_syscalls(&mut self, numbers: &[u64]) {
        if numbers.is_empty() {
            return;
        }
        self.events.retain(|event| numbers.contains(&event.number));
    }
}

/// Resolve syscall names to numbers, rejecting names the table does not know.
pub fn resolve_syscall_names(names: &[String]) -> Result<Vec<u64>> {
    names
        .iter()
        .map(|name| {
            number_of(name).ok_or_else(|| {
                BinTraceError::Config(format!("unknown syscall name '{}'", name))
            })
        })
        .collect()
}

/// Validate, stage and trace `bytes` on the calling thread.
pub fn trace_binary(bytes: &[u8], config: &SandboxConfig) -> Result<TraceReport> {
    validate_config(config)?;
    if let Err(e) = validate_binary(bytes, Some(config.max_file_size)) {
        events::validation_rejected(e.to_string());
        return Err(e.into());
    }

    let staged = stage_binary(bytes, &config.temp_dir_prefix)?;
    let options = TracerOptions {
        follow_forks: config.follow_forks,
        ..TracerOptions::default()
    };

    let result = Tracer::spawn(staged.path(), options).and_then(|tracer| {
        let mut collected = Vec::new();
        let outcome = tracer.run(&mut collected)?;
        Ok(TraceReport {
            outcome,
            events: collected,
        })
    });

    if let Err(e) = staged.release() {
        log::warn!("{}", e);
    }

    let report = result?;
    if report.truncated() {
        events::trace_truncated(report.outcome.root_pid, report.outcome.events_emitted);
    }
    log::info!(
        "Traced pid {}: {} events, exit code {}",
        report.outcome.root_pid,
        report.events.len(),
        report.outcome.root_exit.exit_code()
    );
    Ok(report)
}

/// Run [`trace_binary`] on its own OS thread.
pub fn spawn_trace(bytes: Vec<u8>, config: SandboxConfig) -> JoinHandle<Result<TraceReport>> {
    thread::spawn(move || trace_binary(&bytes, &config))
}

/// Helper role: trace only the root of `command` and write one protocol
/// frame per event on standard output.
pub fn run_helper(command: Command) -> Result<TraceOutcome> {
    let tracer = Tracer::spawn_command(command, TracerOptions::helper())?;
    let stdout = io::stdout();
    let mut sink = protocol::LineSink::new(stdout.lock());
    tracer.run(&mut sink)
}
