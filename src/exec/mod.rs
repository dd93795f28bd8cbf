//! Sandboxed execution entry points

pub mod executor;

pub use executor::{run_benchmark, run_benchmark_with_trace, BenchResult, SandboxExecutor};
