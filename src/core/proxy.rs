use crate::config::types::{to_launch_error, BinTraceError, Result};
use crate::core::fd_closure::close_inherited_fds;
use crate::core::types::{PayloadMode, ProxyStatus, SandboxLaunchRequest};
use crate::kernel::namespace::NamespaceIsolation;
use crate::trace::tracer::{spawn_payload, RootExit, PAYLOAD_PATH};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{dup2, setpgid, Pid};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::FromRawFd;
use std::os::unix::io::RawFd;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

fn read_json_from_fd<T: DeserializeOwned>(fd: RawFd) -> Result<T> {
    let mut file = unsafe { File::from_raw_fd(fd) };
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    serde_json::from_slice(&data)
        .map_err(|e| BinTraceError::Launch(format!("failed to decode json on fd {fd}: {e}")))
}

fn write_json_to_fd<T: Serialize>(fd: RawFd, value: &T) -> Result<()> {
    let mut file = unsafe { File::from_raw_fd(fd) };
    let payload = serde_json::to_vec(value)
        .map_err(|e| BinTraceError::Launch(format!("failed to encode json for fd {fd}: {e}")))?;
    file.write_all(&payload)?;
    file.flush()?;
    Ok(())
}

pub fn write_request_to_fd(fd: RawFd, req: &SandboxLaunchRequest) -> Result<()> {
    write_json_to_fd(fd, req)
}

pub fn read_proxy_status_from_fd(fd: RawFd) -> Result<ProxyStatus> {
    read_json_from_fd(fd)
}

fn setup_parent_death_signal() -> Result<()> {
    if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) } != 0 {
        return Err(to_launch_error(
            "prctl(PR_SET_PDEATHSIG)",
            std::io::Error::last_os_error(),
        ));
    }
    Ok(())
}

fn payload_command(req: &SandboxLaunchRequest) -> Command {
    let mut command = Command::new(&req.binary);
    command
        .env_clear()
        .env("PATH", PAYLOAD_PATH)
        .current_dir("/")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    // SAFETY: prctl is async-signal-safe.
    unsafe {
        command.pre_exec(|| {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    command
}

fn wait_for_payload_and_reap(payload_pid: Pid) -> Result<(Option<i32>, Option<i32>)> {
    let mut payload_exit: Option<i32> = None;
    let mut payload_signal: Option<i32> = None;

    loop {
        match waitpid(payload_pid, None) {
            Ok(WaitStatus::Exited(_, code)) => {
                payload_exit = Some(code);
                break;
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                payload_signal = Some(sig as i32);
                break;
            }
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(to_launch_error("waitpid(payload)", e)),
        }
    }

    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => break,
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(e) => return Err(to_launch_error("waitpid(reap)", e)),
        }
    }

    Ok((payload_exit, payload_signal))
}

fn run_direct(req: &SandboxLaunchRequest) -> Result<ProxyStatus> {
    // This child is the PID namespace's init; see `TracerOptions::helper`.
    let child = spawn_payload(&mut payload_command(req), 1)?;
    let payload_pid = Pid::from_raw(child.id() as i32);
    let (exit_code, term_signal) = wait_for_payload_and_reap(payload_pid)?;

    Ok(ProxyStatus {
        payload_pid: Some(payload_pid.as_raw()),
        exit_code,
        term_signal,
        ..ProxyStatus::default()
    })
}

fn run_traced(req: &SandboxLaunchRequest, output_fd: RawFd) -> Result<ProxyStatus> {
    // The helper protocol travels on stdout.
    dup2(output_fd, libc::STDOUT_FILENO).map_err(|e| to_launch_error("dup2(stdout)", e))?;
    let _ = nix::unistd::close(output_fd);

    let outcome = crate::trace::run_helper(payload_command(req))?;
    let (exit_code, term_signal) = match outcome.root_exit {
        RootExit::Exited(code) => (Some(code), None),
        RootExit::Signaled(signal) => (None, Some(signal)),
        RootExit::Lost => (None, None),
    };

    Ok(ProxyStatus {
        payload_pid: Some(outcome.root_pid),
        exit_code,
        term_signal,
        internal_error: None,
        trace_truncated: outcome.truncated,
        events_emitted: outcome.events_emitted,
    })
}

fn run_proxy(req: SandboxLaunchRequest, output_fd: Option<RawFd>) -> Result<ProxyStatus> {
    NamespaceIsolation::for_sandbox(&req.hostname).apply_isolation()?;

    match (req.mode, output_fd) {
        (PayloadMode::Direct, _) => run_direct(&req),
        (PayloadMode::Traced, Some(fd)) => run_traced(&req, fd),
        (PayloadMode::Traced, None) => Err(BinTraceError::Launch(
            "traced launch without an output pipe".to_string(),
        )),
    }
}

/// Proxy entrypoint executed in the forked child.
///
/// The proxy stays in the host PID namespace; its payload becomes PID 1 of
/// the new one.
pub fn run_proxy_main_from_fds(
    launch_fd: RawFd,
    status_fd: RawFd,
    output_fd: Option<RawFd>,
) -> ! {
    let mut keep = vec![launch_fd, status_fd];
    keep.extend(output_fd);

    let prepared = setpgid(Pid::from_raw(0), Pid::from_raw(0))
        .map_err(|e| to_launch_error("setpgid", e))
        .and_then(|_| setup_parent_death_signal())
        .and_then(|_| close_inherited_fds(&keep));

    let outcome = match prepared
        .and_then(|_| read_json_from_fd::<SandboxLaunchRequest>(launch_fd))
        .and_then(|req| run_proxy(req, output_fd))
    {
        Ok(status) => status,
        Err(err) => ProxyStatus {
            internal_error: Some(err.to_string()),
            ..ProxyStatus::default()
        },
    };

    let _ = write_json_to_fd(status_fd, &outcome);
    let _ = std::io::stdout().flush();
    let code = outcome
        .exit_code
        .unwrap_or(if outcome.internal_error.is_some() { 126 } else { 0 });
    // No atexit handlers in a child forked from a threaded host.
    unsafe { libc::_exit(code) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::OFlag;
    use nix::unistd::pipe2;
    use std::os::fd::IntoRawFd;

    #[test]
    fn test_json_travels_over_pipe() {
        let (read, write) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let status = ProxyStatus {
            payload_pid: Some(42),
            exit_code: Some(3),
            events_emitted: 10,
            ..ProxyStatus::default()
        };
        write_json_to_fd(write.into_raw_fd(), &status).unwrap();
        assert_eq!(read_proxy_status_from_fd(read.into_raw_fd()).unwrap(), status);
    }

    #[test]
    fn test_garbage_status_is_launch_error() {
        let (read, write) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let mut file = File::from(write);
        file.write_all(b"not json").unwrap();
        drop(file);
        assert!(matches!(
            read_proxy_status_from_fd(read.into_raw_fd()),
            Err(BinTraceError::Launch(_))
        ));
    }

    #[test]
    fn test_payload_environment_is_cleared() {
        let req = SandboxLaunchRequest {
            run_id: "r".to_string(),
            binary: "/bin/true".into(),
            mode: PayloadMode::Direct,
            hostname: "box".to_string(),
        };
        let command = payload_command(&req);
        let envs: Vec<_> = command.get_envs().collect();
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].0, "PATH");
    }
}
