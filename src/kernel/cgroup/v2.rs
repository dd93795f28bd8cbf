/// Cgroup v2 backend implementation
/// Groups live under a configurable root; each limit is a single control file write
use crate::config::types::{BinTraceError, Result};
use crate::kernel::cgroup::backend::{CgroupBackend, ResourceUsage};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Period used for `cpu.max`, in microseconds
pub const CPU_PERIOD_USEC: u64 = 100_000;

const CONTROLLERS: &str = "+memory +cpu +pids";

/// Cgroup v2 backend
pub struct CgroupV2 {
    base_path: PathBuf,
}

impl CgroupV2 {
    pub fn new(base_path: &Path) -> Self {
        Self {
            base_path: base_path.to_path_buf(),
        }
    }

    fn instance_path(&self, group: &str) -> PathBuf {
        self.base_path.join(group)
    }

    fn write_control(&self, group: &str, file: &str, value: &str) -> Result<()> {
        let path = self.instance_path(group).join(file);
        fs::write(&path, value)
            .map_err(|e| BinTraceError::Cgroup(format!("Failed to write {}: {}", path.display(), e)))
    }

    fn read_control(&self, group: &str, file: &str) -> Result<String> {
        let path = self.instance_path(group).join(file);
        fs::read_to_string(&path)
            .map_err(|e| BinTraceError::Cgroup(format!("Failed to read {}: {}", path.display(), e)))
    }

    // Child groups only expose memory/cpu/pids files once the parent delegates them.
    fn ensure_controllers(&self) {
        let control = self.base_path.join("cgroup.subtree_control");
        if let Err(e) = fs::write(&control, CONTROLLERS) {
            log::warn!(
                "Failed to enable controllers in {}: {}",
                control.display(),
                e
            );
        }
    }
}

/// `cpu.max` content for a quota expressed as a percentage of one CPU.
pub fn cpu_max_value(percent: u32) -> String {
    let quota = CPU_PERIOD_USEC * percent as u64 / 100;
    format!("{} {}", quota.max(1000), CPU_PERIOD_USEC)
}

/// Extract `usage_usec` from `cpu.stat`.
pub fn parse_cpu_usage(cpu_stat: &str) -> Option<u64> {
    cpu_stat.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("usage_usec"), Some(value)) => value.parse().ok(),
            _ => None,
        }
    })
}

/// Extract the `oom_kill` counter from `memory.events`.
pub fn parse_oom_kills(memory_events: &str) -> u64 {
    memory_events
        .lines()
        .find_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("oom_kill"), Some(value)) => value.parse().ok(),
                _ => None,
            }
        })
        .unwrap_or(0)
}

impl CgroupBackend for CgroupV2 {
    fn backend_name(&self) -> &str {
        "cgroup_v2"
    }

    fn create(&self, group: &str) -> Result<()> {
        fs::create_dir_all(&self.base_path).map_err(|e| {
            BinTraceError::Cgroup(format!(
                "Failed to create cgroup root {}: {}",
                self.base_path.display(),
                e
            ))
        })?;
        self.ensure_controllers();

        let path = self.instance_path(group);
        fs::create_dir(&path)
            .map_err(|e| BinTraceError::Cgroup(format!("Failed to create cgroup: {}", e)))?;

        // Kill the whole group together when one task hits the memory ceiling.
        if path.join("memory.oom.group").exists() {
            if let Err(e) = self.write_control(group, "memory.oom.group", "1") {
                log::warn!("{}", e);
            }
        }
        Ok(())
    }

    fn remove(&self, group: &str) -> Result<()> {
        let path = self.instance_path(group);
        let mut last_err = None;

        // rmdir returns EBUSY until the last task has been reaped.
        for _ in 0..20 {
            if !path.exists() {
                return Ok(());
            }
            match fs::remove_dir(&path) {
                Ok(()) => return Ok(()),
                Err(e) => last_err = Some(e),
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        Err(BinTraceError::Cgroup(format!(
            "Failed to remove cgroup {}: {}",
            path.display(),
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn attach_process(&self, group: &str, pid: u32) -> Result<()> {
        self.write_control(group, "cgroup.procs", &pid.to_string())
    }

    fn set_memory_limit(&self, group: &str, limit_bytes: u64) -> Result<()> {
        self.write_control(group, "memory.max", &limit_bytes.to_string())?;
        if self.instance_path(group).join("memory.swap.max").exists() {
            self.write_control(group, "memory.swap.max", "0")?;
        }
        Ok(())
    }

    fn set_process_limit(&self, group: &str, limit: u32) -> Result<()> {
        self.write_control(group, "pids.max", &limit.to_string())
    }

    fn set_cpu_quota(&self, group: &str, percent: u32) -> Result<()> {
        self.write_control(group, "cpu.max", &cpu_max_value(percent))
    }

    fn kill_all(&self, group: &str) -> Result<()> {
        if self.instance_path(group).join("cgroup.kill").exists() {
            return self.write_control(group, "cgroup.kill", "1");
        }

        // Kernels before 5.14 have no cgroup.kill.
        let procs = self.read_control(group, "cgroup.procs")?;
        for pid in procs.lines().filter_map(|line| line.trim().parse::<i32>().ok()) {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGKILL,
            );
        }
        Ok(())
    }

    fn collect_usage(&self, group: &str) -> Result<ResourceUsage> {
        let memory_peak_bytes = self
            .read_control(group, "memory.peak")
            .or_else(|_| self.read_control(group, "memory.current"))
            .ok()
            .and_then(|content| content.trim().parse::<u64>().ok());

        let cpu_usage_usec = self
            .read_control(group, "cpu.stat")
            .ok()
            .and_then(|content| parse_cpu_usage(&content));

        let oom_kills = self
            .read_control(group, "memory.events")
            .map(|content| parse_oom_kills(&content))
            .unwrap_or(0);

        Ok(ResourceUsage {
            memory_peak_bytes,
            cpu_usage_usec,
            oom_kills,
        })
    }

    fn get_cgroup_path(&self, group: &str) -> PathBuf {
        self.instance_path(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_path() {
        let cgroup = CgroupV2::new(Path::new("/tmp/test_cgroup_v2"));
        assert_eq!(
            cgroup.get_cgroup_path("bintrace-1"),
            PathBuf::from("/tmp/test_cgroup_v2/bintrace-1")
        );
    }

    #[test]
    fn test_cpu_max_value() {
        assert_eq!(cpu_max_value(10), "10000 100000");
        assert_eq!(cpu_max_value(250), "250000 100000");
        // Never below the kernel's 1ms minimum quota.
        assert_eq!(cpu_max_value(0), "1000 100000");
    }

    #[test]
    fn test_parse_usage_files() {
        let cpu_stat = "usage_usec 48213\nuser_usec 40000\nsystem_usec 8213\n";
        assert_eq!(parse_cpu_usage(cpu_stat), Some(48213));
        assert_eq!(parse_cpu_usage(""), None);

        let events = "low 0\nhigh 0\nmax 3\noom 1\noom_kill 1\n";
        assert_eq!(parse_oom_kills(events), 1);
    }

    #[test]
    fn test_limits_written_to_plain_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let cgroup = CgroupV2::new(tmp.path());
        cgroup.create("group-a").unwrap();
        cgroup.set_memory_limit("group-a", 1024).unwrap();
        cgroup.set_cpu_quota("group-a", 10).unwrap();
        cgroup.set_process_limit("group-a", 4).unwrap();

        let dir = tmp.path().join("group-a");
        assert_eq!(fs::read_to_string(dir.join("memory.max")).unwrap(), "1024");
        assert_eq!(fs::read_to_string(dir.join("cpu.max")).unwrap(), "10000 100000");
        assert_eq!(fs::read_to_string(dir.join("pids.max")).unwrap(), "4");

        let usage = cgroup.collect_usage("group-a").unwrap();
        assert_eq!(usage.memory_peak_bytes, None);
        assert_eq!(usage.oom_kills, 0);
    }
}
