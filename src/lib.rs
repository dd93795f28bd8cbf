//! bintrace: static analysis, syscall tracing and sandboxed execution of
//! untrusted ELF binaries
//!
//! # Architecture
//!
//! ## Binary Inspection ([`binary`])
//! - [`binary::validate`]: Admission checks run before anything else touches the bytes
//! - [`binary::analyze`]: Header, section, segment, symbol and dependency extraction
//! - [`binary::names`]: Symbolic names for ELF constants
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::syscalls`]: x86_64 syscall name table
//! - [`kernel::memory`]: Cross-process memory peeks
//! - [`kernel::namespace`]: User, mount, UTS, IPC, network and PID namespaces
//! - [`kernel::cgroup`]: cgroup v2 resource governance
//!
//! ## Tracing ([`trace`])
//! - [`trace::tracer`]: ptrace control loop with entry/exit pairing
//! - [`trace::decode`]: Pointer-argument decoder registry
//! - [`trace::protocol`]: Helper line protocol
//!
//! ## Execution ([`core`], [`exec`])
//! - [`core::supervisor`]: Supervisor/proxy/payload lifecycle
//! - [`exec::executor`]: Benchmark runs and exit classification
//!
//! ## Support
//! - [`safety::staging`]: Private, auto-removed staging of submitted binaries
//! - [`observability::audit`]: Structured audit events
//! - [`inspect`]: `/proc` inspection of live processes
//! - [`config`]: Errors, sandbox configuration and its validation
//!
//! Nothing here runs the submitted binary before [`binary::validate_binary`]
//! has accepted it.

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
compile_error!("bintrace supports Linux x86_64 only");

// ELF inspection
pub mod binary;

// Kernel Primitives
pub mod kernel;

// Syscall tracing
pub mod trace;

// Sandbox process model
pub mod core;

// Execution Control
pub mod exec;

// Safety & Cleanup
pub mod safety;

// Observability
pub mod observability;

// Process inspection
pub mod inspect;

// Configuration
pub mod config;

// CLI entrypoint wiring for the bintrace binary.
pub mod cli;

pub use binary::{analyze, analyze_binary, validate_binary, BinaryInfo};
pub use config::types::{BinTraceError, Result, SandboxConfig, ValidationError};
pub use exec::{run_benchmark, run_benchmark_with_trace, BenchResult};
pub use trace::{spawn_trace, trace_binary, SyscallEvent, TraceReport};
