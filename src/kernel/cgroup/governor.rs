//! Per-run resource governor.
//!
//! Owns one sandbox group for the lifetime of a traced run and removes it
//! when dropped.

use crate::config::types::{BinTraceError, Result, SandboxConfig};
use crate::kernel::cgroup::backend::{create_cgroup_backend, CgroupBackend, ResourceLimits, ResourceUsage};
use crate::observability::audit::events;
use crate::trace::protocol::format_status_line;
use uuid::Uuid;

pub struct ResourceGovernor {
    backend: Box<dyn CgroupBackend>,
    group: String,
    invocation_id: String,
}

impl ResourceGovernor {
    /// Create and limit a fresh sandbox group.
    ///
    /// Returns `Ok(None)` when ceilings cannot be enforced and
    /// `strict_limits` is off.
    pub fn establish(config: &SandboxConfig) -> Result<Option<Self>> {
        let limits = ResourceLimits {
            memory_bytes: config.max_memory,
            cpu_quota_percent: config.max_cpu_quota,
            max_tasks: config.max_tasks,
        };

        let backend = match create_cgroup_backend(&config.cgroup_root) {
            Some(backend) => backend,
            None => return degrade(config, "no cgroup v2 hierarchy available".to_string()),
        };

        let group = format!("bintrace-{}.scope", Uuid::new_v4().simple());
        if let Err(e) = backend.create(&group) {
            return degrade(config, e.to_string());
        }
        if let Err(e) = backend.apply_limits(&group, &limits) {
            let _ = backend.remove(&group);
            return degrade(config, e.to_string());
        }

        log::info!(
            "Sandbox group {} ({}) limits: memory={}B cpu={}% tasks={}",
            backend.get_cgroup_path(&group).display(),
            backend.backend_name(),
            limits.memory_bytes,
            limits.cpu_quota_percent,
            limits.max_tasks
        );

        Ok(Some(Self {
            backend,
            group,
            invocation_id: Uuid::new_v4().simple().to_string(),
        }))
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    /// First line of the helper protocol identifying this group.
    pub fn status_line(&self) -> String {
        format_status_line(&self.group, &self.invocation_id)
    }

    pub fn attach(&self, pid: u32) -> Result<()> {
        self.backend.attach_process(&self.group, pid)
    }

    pub fn kill_all(&self) {
        if let Err(e) = self.backend.kill_all(&self.group) {
            log::warn!("Failed to kill sandbox group {}: {}", self.group, e);
        }
    }

    pub fn usage(&self) -> Option<ResourceUsage> {
        match self.backend.collect_usage(&self.group) {
            Ok(usage) => Some(usage),
            Err(e) => {
                log::warn!("Failed to collect usage for {}: {}", self.group, e);
                None
            }
        }
    }
}

impl Drop for ResourceGovernor {
    fn drop(&mut self) {
        if let Err(e) = self.backend.remove(&self.group) {
            log::warn!("{}", e);
            events::cleanup_failure(self.group.clone(), e.to_string());
        }
    }
}

fn degrade(config: &SandboxConfig, reason: String) -> Result<Option<ResourceGovernor>> {
    if config.strict_limits {
        return Err(BinTraceError::Cgroup(reason));
    }
    log::warn!("Resource ceilings not enforced: {}", reason);
    events::control_degraded("resource_governor".to_string(), reason);
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwritable_root_degrades_in_permissive_mode() {
        let config = SandboxConfig {
            cgroup_root: "/proc/bintrace-no-such-cgroup".into(),
            ..SandboxConfig::default()
        };
        assert!(ResourceGovernor::establish(&config).unwrap().is_none());
    }

    #[test]
    fn test_unwritable_root_fails_in_strict_mode() {
        let config = SandboxConfig {
            cgroup_root: "/proc/bintrace-no-such-cgroup".into(),
            strict_limits: true,
            ..SandboxConfig::default()
        };
        assert!(matches!(
            ResourceGovernor::establish(&config),
            Err(BinTraceError::Cgroup(_))
        ));
    }
}
