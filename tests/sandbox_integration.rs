//! Sandboxed runs through the supervisor/proxy/payload chain.
//!
//! Needs unprivileged user namespaces; skipped otherwise.

mod common;

use bintrace::{run_benchmark, run_benchmark_with_trace, BinTraceError, SandboxConfig, ValidationError};
use std::time::Duration;

macro_rules! require_sandbox {
    () => {
        if !common::sandbox_available() {
            println!("user namespaces unavailable on this host, skipping");
            return;
        }
    };
}

fn quick_config() -> SandboxConfig {
    SandboxConfig {
        max_execution_time: Duration::from_secs(10),
        ..SandboxConfig::default()
    }
}

#[test]
fn test_exit_code_is_preserved() {
    require_sandbox!();
    let result = run_benchmark(&common::exit_with(7), &quick_config()).unwrap();
    assert_eq!(result.exit_code, 7, "{:?}", result.error_message);
    assert!(!result.success);
    assert!(result.error_message.is_none());
    assert!(result.syscalls.is_none());
}

#[test]
fn test_clean_exit_is_success() {
    require_sandbox!();
    let result = run_benchmark(&common::write_then_exit(), &quick_config()).unwrap();
    assert_eq!(result.exit_code, 0, "{:?}", result.error_message);
    assert!(result.success);
}

#[test]
fn test_deadline_reports_timeout() {
    require_sandbox!();
    let config = SandboxConfig {
        max_execution_time: Duration::from_secs(1),
        ..SandboxConfig::default()
    };
    let result = run_benchmark(&common::sleep_for(5), &config).unwrap();

    assert_eq!(result.exit_code, 124);
    assert!(!result.success);
    assert_eq!(result.error_message.as_deref(), Some("execution timeout"));
    assert!(result.runtime_ms >= 1000, "runtime {}ms", result.runtime_ms);
    assert!(result.runtime_ms < 2500, "runtime {}ms", result.runtime_ms);
}

#[test]
fn test_traced_run_collects_syscalls() {
    require_sandbox!();
    if !common::ptrace_available() {
        println!("ptrace unavailable on this host, skipping");
        return;
    }
    let result = run_benchmark_with_trace(&common::write_then_exit(), &quick_config()).unwrap();
    assert_eq!(result.exit_code, 0, "{:?}", result.error_message);

    let syscalls = result.syscalls.unwrap();
    assert_eq!(syscalls.len(), 2, "{:?}", syscalls);
    assert_eq!(syscalls[0].name, "write");
    assert!(syscalls[0].is_entry());
    assert_eq!(syscalls[1].ret, Some(3));
    assert_eq!(syscalls[0].pid, syscalls[1].pid);

    // Correlation ids only exist when a sandbox group was created.
    assert_eq!(result.sandbox_group.is_some(), result.invocation_id.is_some());
}

#[test]
fn test_traced_deadline_reports_timeout() {
    require_sandbox!();
    if !common::ptrace_available() {
        println!("ptrace unavailable on this host, skipping");
        return;
    }
    let config = SandboxConfig {
        max_execution_time: Duration::from_secs(1),
        ..SandboxConfig::default()
    };
    let result = run_benchmark_with_trace(&common::sleep_for(5), &config).unwrap();

    assert_eq!(result.exit_code, 124);
    assert!(!result.success);
    assert_eq!(result.error_message.as_deref(), Some("execution timeout"));
    assert!(result.runtime_ms >= 1000, "runtime {}ms", result.runtime_ms);
    assert!(result.runtime_ms < 2500, "runtime {}ms", result.runtime_ms);
    assert!(result.syscalls.is_some());
}

#[test]
fn test_invalid_input_never_launches() {
    let err = run_benchmark(b"\x7fEL", &quick_config()).unwrap_err();
    assert!(matches!(
        err,
        BinTraceError::Validation(ValidationError::TooSmall { size: 3 })
    ));
    let err = run_benchmark_with_trace(b"#!/bin/sh\n", &quick_config()).unwrap_err();
    assert!(matches!(err, BinTraceError::Validation(ValidationError::BadMagic)));
}

#[test]
fn test_staging_directory_is_removed() {
    require_sandbox!();
    let config = SandboxConfig {
        temp_dir_prefix: format!("bintrace-cleanup-{}", std::process::id()),
        ..quick_config()
    };
    run_benchmark(&common::exit_with(0), &config).unwrap();

    let leftovers = std::fs::read_dir(std::env::temp_dir())
        .unwrap()
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with(&config.temp_dir_prefix)
        })
        .count();
    assert_eq!(leftovers, 0);
}
