/// Namespace isolation for sandboxed payloads
/// Unshares user, mount, UTS, IPC, network and PID namespaces with the invoker mapped to root
use crate::config::types::{BinTraceError, Result};

use nix::sched::{unshare, CloneFlags};
use nix::unistd::{getgid, getuid, sethostname, Gid, Uid};
use std::fs;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

/// Namespace isolation controller
#[derive(Debug, Clone)]
pub struct NamespaceIsolation {
    enable_user_namespace: bool,
    enable_mount_namespace: bool,
    enable_uts_namespace: bool,
    enable_ipc_namespace: bool,
    enable_network_namespace: bool,
    enable_pid_namespace: bool,
    hostname: String,
    outer_uid: Uid,
    outer_gid: Gid,
}

impl NamespaceIsolation {
    /// Every namespace enabled, invoker mapped to root inside the user namespace.
    pub fn for_sandbox(hostname: &str) -> Self {
        Self {
            enable_user_namespace: true,
            enable_mount_namespace: true,
            enable_uts_namespace: true,
            enable_ipc_namespace: true,
            enable_network_namespace: true,
            enable_pid_namespace: true,
            hostname: hostname.to_string(),
            outer_uid: getuid(),
            outer_gid: getgid(),
        }
    }

    fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        if self.enable_user_namespace {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        if self.enable_mount_namespace {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.enable_uts_namespace {
            flags |= CloneFlags::CLONE_NEWUTS;
        }
        if self.enable_ipc_namespace {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        if self.enable_network_namespace {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.enable_pid_namespace {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        flags
    }

    /// Unshare the configured namespaces for the calling process.
    ///
    /// Must run in a single-threaded process. With the PID namespace enabled
    /// only children forked afterwards enter it; the caller stays outside.
    pub fn apply_isolation(&self) -> Result<()> {
        let flags = self.clone_flags();
        if flags.is_empty() {
            return Ok(());
        }

        unshare(flags).map_err(|e| {
            BinTraceError::Namespace(format!("Failed to unshare namespaces: {}", e))
        })?;

        if self.enable_user_namespace {
            map_root_user(self.outer_uid, self.outer_gid)?;
        }

        if self.enable_mount_namespace {
            if let Err(e) = harden_mount_propagation() {
                log::warn!("{}", e);
            }
        }

        if self.enable_uts_namespace {
            if let Err(e) = sethostname(&self.hostname) {
                log::warn!("Failed to set hostname in UTS namespace: {}", e);
            }
        }

        if self.enable_network_namespace {
            if let Err(e) = bring_up_loopback() {
                log::warn!("{}", e);
            }
        }

        log::debug!(
            "Applied namespace isolation: {:?}",
            self.get_enabled_namespaces()
        );
        Ok(())
    }

    /// Get enabled namespaces as a string
    pub fn get_enabled_namespaces(&self) -> Vec<String> {
        let mut namespaces = Vec::new();
        if self.enable_user_namespace {
            namespaces.push("User".to_string());
        }
        if self.enable_mount_namespace {
            namespaces.push("Mount".to_string());
        }
        if self.enable_uts_namespace {
            namespaces.push("UTS".to_string());
        }
        if self.enable_ipc_namespace {
            namespaces.push("IPC".to_string());
        }
        if self.enable_network_namespace {
            namespaces.push("Network".to_string());
        }
        if self.enable_pid_namespace {
            namespaces.push("PID".to_string());
        }
        namespaces
    }
}

/// Map `uid`/`gid` of the parent namespace to root in the caller's new user namespace.
///
/// An unprivileged writer may map only its own ids, and only after
/// `setgroups` has been denied.
pub fn map_root_user(uid: Uid, gid: Gid) -> Result<()> {
    let write = |path: &str, content: String| {
        fs::write(path, content.as_bytes())
            .map_err(|e| BinTraceError::Namespace(format!("Failed to write {}: {}", path, e)))
    };

    write("/proc/self/setgroups", "deny".to_string())?;
    write("/proc/self/uid_map", uid_map_line(uid.as_raw()))?;
    write("/proc/self/gid_map", uid_map_line(gid.as_raw()))?;
    Ok(())
}

fn uid_map_line(outer: u32) -> String {
    format!("0 {} 1\n", outer)
}

/// Make `/` private and recursive so mounts never propagate back to the host.
pub fn harden_mount_propagation() -> Result<()> {
    use nix::mount::{mount, MsFlags};

    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| {
        BinTraceError::Namespace(format!(
            "Failed to set mount propagation to MS_PRIVATE|MS_REC on /: {}",
            e
        ))
    })
}

fn bring_up_loopback() -> Result<()> {
    let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if raw < 0 {
        return Err(BinTraceError::Namespace(format!(
            "Failed to open socket for loopback setup: {}",
            std::io::Error::last_os_error()
        )));
    }
    // SAFETY: `raw` is a freshly created descriptor we exclusively own.
    let sock = unsafe { OwnedFd::from_raw_fd(raw) };

    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (slot, byte) in ifr.ifr_name.iter_mut().zip(b"lo\0") {
        *slot = *byte as libc::c_char;
    }

    if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFFLAGS as _, &mut ifr) } != 0 {
        return Err(BinTraceError::Namespace(format!(
            "Failed to query loopback flags: {}",
            std::io::Error::last_os_error()
        )));
    }

    let flags = unsafe { ifr.ifr_ifru.ifru_flags } as libc::c_int | libc::IFF_UP;
    ifr.ifr_ifru.ifru_flags = flags as libc::c_short;

    if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFFLAGS as _, &ifr) } != 0 {
        return Err(BinTraceError::Namespace(format!(
            "Failed to bring up loopback interface: {}",
            std::io::Error::last_os_error()
        )));
    }

    log::debug!("Enabled loopback interface inside network namespace");
    Ok(())
}

/// Check whether this host lets an unprivileged process create a user
/// namespace. Forks a throwaway child so the caller is never moved.
pub fn user_namespaces_available() -> bool {
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult};

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            let code = match unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWPID) {
                Ok(()) => 0,
                Err(_) => 1,
            };
            unsafe { libc::_exit(code) }
        }
        Ok(ForkResult::Parent { child }) => {
            matches!(waitpid(child, None), Ok(WaitStatus::Exited(_, 0)))
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_enables_every_namespace() {
        let ns = NamespaceIsolation::for_sandbox("box");
        assert_eq!(
            ns.get_enabled_namespaces(),
            vec!["User", "Mount", "UTS", "IPC", "Network", "PID"]
        );
        assert!(ns.clone_flags().contains(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWPID));
    }

    #[test]
    fn test_uid_map_line_format() {
        assert_eq!(uid_map_line(1000), "0 1000 1\n");
    }

    #[test]
    fn test_user_namespace_check_does_not_panic() {
        let _ = user_namespaces_available();
    }
}
