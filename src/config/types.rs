/// Core types shared across bintrace: error taxonomy and sandbox configuration
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default ceiling for submitted binaries (50MB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// Reasons a candidate buffer is refused admission
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("empty file")]
    Empty,

    #[error("file too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },

    #[error("file too small to be a valid binary")]
    TooSmall { size: u64 },

    #[error("not a valid ELF binary")]
    BadMagic,

    #[error("invalid ELF file: {0}")]
    Malformed(String),
}

/// Custom error types for bintrace
#[derive(Error, Debug)]
pub enum BinTraceError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("ELF parse error: {0}")]
    Parse(String),

    #[error("Launch error: {0}")]
    Launch(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Namespace isolation error: {0}")]
    Namespace(String),

    #[error("Trace error: {0}")]
    Trace(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BinTraceError>;

impl From<nix::errno::Errno> for BinTraceError {
    fn from(err: nix::errno::Errno) -> Self {
        BinTraceError::Launch(err.to_string())
    }
}

pub(crate) fn to_launch_error(prefix: &str, err: impl std::fmt::Display) -> BinTraceError {
    BinTraceError::Launch(format!("{prefix}: {err}"))
}

/// Sandbox configuration for benchmark and traced runs
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Wall-clock kill deadline, in seconds in JSON
    #[serde(with = "duration_secs")]
    pub max_execution_time: Duration,
    /// Memory ceiling in bytes
    pub max_memory: u64,
    /// CPU quota as a percentage of one CPU
    pub max_cpu_quota: u32,
    /// Maximum number of tasks in the sandbox group
    pub max_tasks: u32,
    /// Ceiling for submitted binaries in bytes
    pub max_file_size: u64,
    /// Prefix for staging directories
    pub temp_dir_prefix: String,
    /// Parent cgroup under which sandbox groups are created
    pub cgroup_root: PathBuf,
    /// Fail the launch when resource ceilings cannot be enforced
    pub strict_limits: bool,
    /// Follow fork/vfork/clone children when tracing outside the sandbox
    pub follow_forks: bool,
    /// Hostname set inside the UTS namespace
    pub hostname: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_execution_time: Duration::from_secs(30),
            max_memory: 32 * 1024 * 1024, // 32MB
            max_cpu_quota: 10,            // 10% of one CPU
            max_tasks: 10,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            temp_dir_prefix: "bintracebench-sandbox".to_string(),
            cgroup_root: PathBuf::from("/sys/fs/cgroup/bintrace"),
            strict_limits: false, // permissive: warn and continue without a governor
            follow_forks: true,
            hostname: "bintrace-sandbox".to_string(),
        }
    }
}

impl SandboxConfig {
    /// Load a JSON configuration file; missing fields take their defaults.
    pub fn from_json_file(path: &std::path::Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data).map_err(|e| {
            BinTraceError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }
}

/// `Duration` as a JSON number of seconds; fractions are allowed.
mod duration_secs {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        if value.subsec_nanos() == 0 {
            serializer.serialize_u64(value.as_secs())
        } else {
            serializer.serialize_f64(value.as_secs_f64())
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|e| D::Error::custom(format!("invalid duration {}: {}", secs, e)))
    }
}

/// Parse a human size such as "32M", "512K", "1G" or a plain byte count.
pub fn parse_size(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(BinTraceError::Config("empty size".to_string()));
    }

    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| BinTraceError::Config(format!("invalid size: {}", input)))?;

    let multiplier: u64 = match suffix.to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        _ => return Err(BinTraceError::Config(format!("invalid size suffix: {}", input))),
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| BinTraceError::Config(format!("size overflows: {}", input)))
}

/// Parse a CPU quota such as "10%" or "10" into a percentage.
pub fn parse_cpu_quota(input: &str) -> Result<u32> {
    input
        .trim()
        .trim_end_matches('%')
        .trim()
        .parse::<u32>()
        .map_err(|_| BinTraceError::Config(format!("invalid CPU quota: {}", input)))
}
