// Sandbox configuration validation
// Errors are fatal before anything is staged; warnings are logged and execution continues

use crate::config::types::{BinTraceError, Result, SandboxConfig};
use std::time::Duration;

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Validate a sandbox configuration, failing fast with every error found.
pub fn validate_config(config: &SandboxConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    validate_limits(config, &mut result);
    validate_paths(config, &mut result);

    if !result.is_valid() {
        return Err(BinTraceError::Config(format!(
            "config validation failed:\n{}",
            result.errors.join("\n")
        )));
    }

    for warning in &result.warnings {
        log::warn!("Config warning: {}", warning);
    }

    Ok(result)
}

fn validate_limits(config: &SandboxConfig, result: &mut ValidationResult) {
    if config.max_execution_time.is_zero() {
        result.add_error("max_execution_time must be positive".to_string());
    } else if config.max_execution_time > Duration::from_secs(600) {
        result.add_warning(format!(
            "max_execution_time {:?} is very long for an untrusted binary",
            config.max_execution_time
        ));
    }

    if config.max_file_size == 0 {
        result.add_error("max_file_size must be positive".to_string());
    }

    if config.max_tasks == 0 {
        result.add_error("max_tasks must be positive".to_string());
    }

    if config.max_memory == 0 {
        result.add_error("max_memory cannot be zero".to_string());
    } else if config.max_memory < 1024 * 1024 {
        result.add_warning(format!(
            "max_memory {} is very low (< 1MB), the payload may be OOM-killed at exec",
            config.max_memory
        ));
    }

    if config.max_cpu_quota == 0 {
        result.add_error("max_cpu_quota cannot be zero".to_string());
    }
}

fn validate_paths(config: &SandboxConfig, result: &mut ValidationResult) {
    if config.temp_dir_prefix.is_empty() {
        result.add_error("temp_dir_prefix cannot be empty".to_string());
    } else if config.temp_dir_prefix.contains('/') {
        result.add_error(format!(
            "temp_dir_prefix '{}' must not contain a path separator",
            config.temp_dir_prefix
        ));
    }

    if !config.cgroup_root.is_absolute() {
        result.add_error(format!(
            "cgroup_root '{}' must be an absolute path",
            config.cgroup_root.display()
        ));
    }

    if config.hostname.is_empty() || config.hostname.len() > 64 {
        result.add_error("hostname must be 1-64 bytes".to_string());
    }
}
