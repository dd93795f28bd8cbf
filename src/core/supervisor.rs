use crate::config::types::{to_launch_error, Result};
use crate::core::proxy::{read_proxy_status_from_fd, run_proxy_main_from_fds, write_request_to_fd};
use crate::core::types::{KillReport, LaunchOutcome, PayloadMode, SandboxLaunchRequest};
use crate::kernel::cgroup::governor::ResourceGovernor;
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, pipe2, ForkResult, Pid};
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::os::fd::{IntoRawFd, OwnedFd};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const TERM_GRACE: Duration = Duration::from_millis(50);

fn signal_group(proxy_pid: Pid, signal: Signal, report: &mut KillReport) {
    match killpg(proxy_pid, signal) {
        Ok(()) => report.group_signals.push(signal.as_str().to_string()),
        Err(e) => {
            // The proxy may not have called setpgid yet.
            let _ = kill(proxy_pid, signal);
            report.fallbacks.push(format!("{}: {}", signal.as_str(), e));
        }
    }
}

fn terminate_proxy_group(proxy_pid: Pid) -> KillReport {
    let mut report = KillReport::default();
    let start = Instant::now();

    signal_group(proxy_pid, Signal::SIGTERM, &mut report);
    std::thread::sleep(TERM_GRACE);
    signal_group(proxy_pid, Signal::SIGKILL, &mut report);

    report.escalation_ms = start.elapsed().as_millis() as u64;
    report
}

fn read_lines_async(fd: OwnedFd) -> thread::JoinHandle<Vec<(String, DateTime<Utc>)>> {
    thread::spawn(move || {
        let reader = BufReader::new(File::from(fd));
        let mut lines = Vec::new();
        for line in reader.lines() {
            match line {
                Ok(line) => lines.push((line, Utc::now())),
                Err(e) => {
                    log::debug!("trace pipe read stopped: {}", e);
                    break;
                }
            }
        }
        lines
    })
}

/// Launch request using supervisor -> proxy -> payload model.
///
/// The deadline covers everything after the fork. With a governor the
/// proxy joins the sandbox group before it starts the payload.
pub fn launch_with_supervisor(
    req: &SandboxLaunchRequest,
    deadline: Duration,
    governor: Option<&ResourceGovernor>,
) -> Result<LaunchOutcome> {
    let (launch_read, launch_write) =
        pipe2(OFlag::O_CLOEXEC).map_err(|e| to_launch_error("pipe(launch)", e))?;
    let (status_read, status_write) =
        pipe2(OFlag::O_CLOEXEC).map_err(|e| to_launch_error("pipe(status)", e))?;
    let output = match req.mode {
        PayloadMode::Traced => {
            Some(pipe2(OFlag::O_CLOEXEC).map_err(|e| to_launch_error("pipe(output)", e))?)
        }
        PayloadMode::Direct => None,
    };

    let (output_read, output_write) = match output {
        Some((read, write)) => (Some(read), Some(write)),
        None => (None, None),
    };

    let proxy_pid = match unsafe { fork() }.map_err(|e| to_launch_error("fork(proxy)", e))? {
        ForkResult::Child => {
            // Parent ends must go, or the reads below never see EOF.
            drop(launch_write);
            drop(status_read);
            drop(output_read);
            run_proxy_main_from_fds(
                launch_read.into_raw_fd(),
                status_write.into_raw_fd(),
                output_write.map(IntoRawFd::into_raw_fd),
            )
        }
        ForkResult::Parent { child } => child,
    };

    drop(launch_read);
    drop(status_write);

    if let Some(governor) = governor {
        if let Err(e) = governor.attach(proxy_pid.as_raw() as u32) {
            let _ = terminate_proxy_group(proxy_pid);
            let _ = waitpid(proxy_pid, None);
            return Err(e);
        }
    }

    // The status line goes first so it precedes every frame.
    if let Some(write) = output_write {
        let mut file = File::from(write);
        if let Some(governor) = governor {
            if let Err(e) = writeln!(file, "{}", governor.status_line()) {
                log::warn!("Failed to write status line: {}", e);
            }
        }
    }
    let reader = output_read.map(read_lines_async);

    let started = Instant::now();
    if let Err(e) = write_request_to_fd(launch_write.into_raw_fd(), req) {
        let _ = terminate_proxy_group(proxy_pid);
        let _ = waitpid(proxy_pid, None);
        return Err(e);
    }

    let mut timed_out = false;
    let mut kill_report: Option<KillReport> = None;

    loop {
        match waitpid(proxy_pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                if !timed_out && started.elapsed() > deadline {
                    timed_out = true;
                    log::info!(
                        "Deadline of {}ms exceeded, killing proxy group {}",
                        deadline.as_millis(),
                        proxy_pid
                    );
                    let report = terminate_proxy_group(proxy_pid);
                    log::debug!("Proxy group {} escalation: {}", proxy_pid, report.summary());
                    kill_report = Some(report);
                    if let Some(governor) = governor {
                        governor.kill_all();
                    }
                } else {
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
            Ok(WaitStatus::Exited(_, _)) | Ok(WaitStatus::Signaled(_, _, _)) => break,
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(to_launch_error("waitpid(proxy)", e)),
        }
    }
    let elapsed = started.elapsed();

    let status = match read_proxy_status_from_fd(status_read.into_raw_fd()) {
        Ok(status) => Some(status),
        Err(e) => {
            if !timed_out {
                log::warn!("Proxy {} left no status: {}", proxy_pid, e);
            }
            None
        }
    };

    let lines = match reader {
        Some(handle) => handle.join().unwrap_or_default(),
        None => Vec::new(),
    };

    let usage = governor.and_then(ResourceGovernor::usage);

    Ok(LaunchOutcome {
        proxy_pid: proxy_pid.as_raw(),
        timed_out,
        elapsed,
        status,
        lines,
        kill_report,
        usage,
    })
}
