//! Cgroup backend abstraction.

use crate::config::types::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Ceilings applied to one sandbox group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_bytes: u64,
    /// Percentage of one CPU; values above 100 span several CPUs
    pub cpu_quota_percent: u32,
    pub max_tasks: u32,
}

/// Usage read back from a sandbox group after the payload finished
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_peak_bytes: Option<u64>,
    pub cpu_usage_usec: Option<u64>,
    pub oom_kills: u64,
}

pub trait CgroupBackend: Send + Sync {
    fn backend_name(&self) -> &str;
    fn create(&self, group: &str) -> Result<()>;
    fn remove(&self, group: &str) -> Result<()>;
    fn attach_process(&self, group: &str, pid: u32) -> Result<()>;
    fn set_memory_limit(&self, group: &str, limit_bytes: u64) -> Result<()>;
    fn set_process_limit(&self, group: &str, limit: u32) -> Result<()>;
    fn set_cpu_quota(&self, group: &str, percent: u32) -> Result<()>;
    fn kill_all(&self, group: &str) -> Result<()>;
    fn collect_usage(&self, group: &str) -> Result<ResourceUsage>;
    fn get_cgroup_path(&self, group: &str) -> PathBuf;

    fn apply_limits(&self, group: &str, limits: &ResourceLimits) -> Result<()> {
        self.set_memory_limit(group, limits.memory_bytes)?;
        self.set_cpu_quota(group, limits.cpu_quota_percent)?;
        self.set_process_limit(group, limits.max_tasks)?;
        Ok(())
    }
}

/// Whether the unified (v2) hierarchy is mounted at `/sys/fs/cgroup`.
pub fn detect_cgroup_v2() -> bool {
    Path::new("/sys/fs/cgroup/cgroup.controllers").exists()
}

/// Select a backend rooted at `root`, or `None` when no supported hierarchy exists.
pub fn create_cgroup_backend(root: &Path) -> Option<Box<dyn CgroupBackend>> {
    if detect_cgroup_v2() {
        log::debug!("Using cgroup v2 backend rooted at {}", root.display());
        Some(Box::new(crate::kernel::cgroup::v2::CgroupV2::new(root)))
    } else {
        log::warn!("No cgroup v2 hierarchy available, continuing without resource limits");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_cgroup_v2() {
        let _ = detect_cgroup_v2();
    }

    #[test]
    fn test_backend_selection_matches_detection() {
        let backend = create_cgroup_backend(Path::new("/sys/fs/cgroup/bintrace-test"));
        assert_eq!(backend.is_some(), detect_cgroup_v2());
    }
}
