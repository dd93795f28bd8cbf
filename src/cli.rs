use crate::config::types::{parse_cpu_quota, parse_size, SandboxConfig};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about = "Inspect, trace and benchmark untrusted ELF binaries", long_about = None)]
struct Cli {
    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pretty: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Default)]
struct LimitArgs {
    /// JSON sandbox configuration file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Wall clock deadline in seconds
    #[arg(long)]
    time: Option<u64>,
    /// Memory ceiling, e.g. 32M
    #[arg(long)]
    mem: Option<String>,
    /// CPU quota in percent of one CPU, e.g. 10%
    #[arg(long)]
    cpu: Option<String>,
    /// Maximum number of tasks
    #[arg(long)]
    tasks: Option<u32>,
    /// Fail instead of degrading when resource ceilings cannot be enforced
    #[arg(long)]
    strict: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that a file is a well-formed ELF binary
    Validate {
        file: PathBuf,
        /// Size ceiling, e.g. 50M
        #[arg(long)]
        max_size: Option<String>,
    },
    /// Describe the static structure of an ELF binary
    Analyze { file: PathBuf },
    /// Run a binary under ptrace and print its syscalls
    Trace {
        file: PathBuf,
        /// Trace only the initial process
        #[arg(long)]
        no_follow_forks: bool,
        /// Only report these syscalls (repeatable)
        #[arg(long = "syscall", value_name = "NAME")]
        syscalls: Vec<String>,
        #[command(flatten)]
        limits: LimitArgs,
    },
    /// Run a binary in the sandbox and report timing and exit status
    Bench {
        file: PathBuf,
        /// Record syscalls through the tracing helper
        #[arg(long)]
        trace: bool,
        #[command(flatten)]
        limits: LimitArgs,
    },
    /// Show /proc details of a running process
    Inspect {
        pid: i32,
        /// Include open file descriptors
        #[arg(long)]
        files: bool,
        /// Include TCP sockets of the process's network namespace
        #[arg(long)]
        tcp: bool,
    },
    /// Trace a staged payload and write protocol frames on stdout
    #[command(hide = true)]
    TraceHelper { file: PathBuf },
}

extern "C" fn signal_handler(sig: i32) {
    // Only async-signal-safe calls here.
    let msg = b"bintrace: signal received, exiting\n";
    unsafe {
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
        libc::_exit(128 + sig);
    }
}

fn setup_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGTERM, signal_handler as usize);
        libc::signal(libc::SIGINT, signal_handler as usize);
    }
}

fn emit<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    let text = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{}", text);
    Ok(())
}

fn read_input(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn build_config(limits: &LimitArgs) -> Result<SandboxConfig> {
    let mut config = match &limits.config {
        Some(path) => SandboxConfig::from_json_file(path)?,
        None => SandboxConfig::default(),
    };

    if let Some(seconds) = limits.time {
        config.max_execution_time = Duration::from_secs(seconds);
    }
    if let Some(mem) = &limits.mem {
        config.max_memory = parse_size(mem)?;
    }
    if let Some(cpu) = &limits.cpu {
        config.max_cpu_quota = parse_cpu_quota(cpu)?;
    }
    if let Some(tasks) = limits.tasks {
        config.max_tasks = tasks;
    }
    if limits.strict {
        config.strict_limits = true;
    }
    Ok(config)
}

#[derive(Serialize)]
struct ValidationReport {
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub fn run() -> Result<()> {
    setup_signal_handlers();
    env_logger::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Validate { file, max_size } => {
            let bytes = read_input(&file)?;
            let ceiling = max_size.as_deref().map(parse_size).transpose()?;
            let report = match crate::binary::validate_binary(&bytes, ceiling) {
                Ok(()) => ValidationReport {
                    valid: true,
                    error: None,
                },
                Err(e) => ValidationReport {
                    valid: false,
                    error: Some(e.to_string()),
                },
            };
            emit(&report, cli.pretty)?;
            if !report.valid {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Analyze { file } => {
            let bytes = read_input(&file)?;
            let info = crate::binary::analyze_binary(&bytes, None)?;
            emit(&info, cli.pretty)
        }
        Commands::Trace {
            file,
            no_follow_forks,
            syscalls,
            limits,
        } => {
            let mut config = build_config(&limits)?;
            if no_follow_forks {
                config.follow_forks = false;
            }
            let filter = crate::trace::resolve_syscall_names(&syscalls)?;
            let bytes = read_input(&file)?;
            let mut report = crate::trace::spawn_trace(bytes, config)
                .join()
                .map_err(|_| anyhow::anyhow!("tracer thread panicked"))??;
            report.retain_syscalls(&filter);
            emit(&report, cli.pretty)
        }
        Commands::Bench {
            file,
            trace,
            limits,
        } => {
            let config = build_config(&limits)?;
            let bytes = read_input(&file)?;
            let result = if trace {
                crate::exec::run_benchmark_with_trace(&bytes, &config)?
            } else {
                crate::exec::run_benchmark(&bytes, &config)?
            };
            emit(&result, cli.pretty)
        }
        Commands::Inspect { pid, files, tcp } => {
            let mut report = serde_json::json!({
                "process": crate::inspect::proc_info(pid)?,
            });
            if files {
                report["open_files"] = serde_json::to_value(crate::inspect::open_files(pid)?)?;
            }
            if tcp {
                report["tcp"] = serde_json::to_value(crate::inspect::tcp_connections(pid)?)?;
            }
            emit(&report, cli.pretty)
        }
        Commands::TraceHelper { file } => {
            let mut command = std::process::Command::new(&file);
            command
                .env_clear()
                .env("PATH", crate::trace::tracer::PAYLOAD_PATH)
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null());
            let outcome = crate::trace::run_helper(command)?;
            std::process::exit(outcome.root_exit.exit_code())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_limit_overrides() {
        let limits = LimitArgs {
            time: Some(2),
            mem: Some("64M".to_string()),
            cpu: Some("50%".to_string()),
            tasks: Some(3),
            strict: true,
            ..LimitArgs::default()
        };
        let config = build_config(&limits).unwrap();
        assert_eq!(config.max_execution_time, Duration::from_secs(2));
        assert_eq!(config.max_memory, 64 * 1024 * 1024);
        assert_eq!(config.max_cpu_quota, 50);
        assert_eq!(config.max_tasks, 3);
        assert!(config.strict_limits);
    }

    #[test]
    fn test_bench_flags_parse() {
        let cli = Cli::try_parse_from(["bintrace", "bench", "a.out", "--trace", "--mem", "16M"]).unwrap();
        match cli.command {
            Commands::Bench { trace, limits, .. } => {
                assert!(trace);
                assert_eq!(limits.mem.as_deref(), Some("16M"));
            }
            _ => panic!("expected bench"),
        }
    }

    #[test]
    fn test_trace_syscall_filter_parses() {
        let cli = Cli::try_parse_from([
            "bintrace", "trace", "a.out", "--syscall", "write", "--syscall", "execve",
        ])
        .unwrap();
        match cli.command {
            Commands::Trace { syscalls, no_follow_forks, .. } => {
                assert_eq!(syscalls, vec!["write", "execve"]);
                assert!(!no_follow_forks);
                assert_eq!(crate::trace::resolve_syscall_names(&syscalls).unwrap(), vec![1, 59]);
            }
            _ => panic!("expected trace"),
        }
    }

}
