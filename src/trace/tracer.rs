//! ptrace control loop.
//!
//! A `Tracer` must be driven from the thread that spawned it: ptrace
//! requests are only accepted from the tracing thread, and waits use
//! `__WNOTHREAD` so concurrent tracers in one process never see each
//! other's children.

use crate::config::types::{BinTraceError, Result};
use crate::kernel::memory::PtraceMemory;
use crate::kernel::syscalls::syscall_name;
use crate::trace::decode::{decode_args, DecodeLimits};
use crate::trace::types::{SyscallEvent, SyscallState};
use crate::trace::EventSink;
use chrono::Utc;
use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::io;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

pub const PAYLOAD_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

pub const SPAWN_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy)]
pub struct TracerOptions {
    /// Trace children created with fork, vfork and clone
    pub follow_forks: bool,
    pub limits: DecodeLimits,
    /// Spawns tried while the staged binary reports ETXTBSY
    pub spawn_attempts: u32,
}

impl Default for TracerOptions {
    fn default() -> Self {
        Self {
            follow_forks: true,
            limits: DecodeLimits::default(),
            spawn_attempts: SPAWN_ATTEMPTS,
        }
    }
}

impl TracerOptions {
    /// Options for the sandbox helper: the root payload only, one spawn.
    ///
    /// Inside a fresh PID namespace the first child is its init. If that
    /// exec fails the namespace is gone and every later fork returns
    /// ENOMEM, so a retry could only hide the real error.
    pub fn helper() -> Self {
        Self {
            follow_forks: false,
            spawn_attempts: 1,
            ..Self::default()
        }
    }

    fn ptrace_options(&self) -> Options {
        let mut options = Options::PTRACE_O_TRACESYSGOOD
            | Options::PTRACE_O_EXITKILL
            | Options::PTRACE_O_TRACEEXEC;
        if self.follow_forks {
            options |= Options::PTRACE_O_TRACEFORK
                | Options::PTRACE_O_TRACEVFORK
                | Options::PTRACE_O_TRACECLONE;
        }
        options
    }
}

/// How the root tracee ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RootExit {
    Exited(i32),
    Signaled(i32),
    /// Control was lost before an exit status was observed
    Lost,
}

impl RootExit {
    /// Shell-style code: signals map to 128 + signal number.
    pub fn exit_code(&self) -> i32 {
        match self {
            RootExit::Exited(code) => *code,
            RootExit::Signaled(signal) => 128 + signal,
            RootExit::Lost => -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceOutcome {
    pub root_pid: i32,
    pub root_exit: RootExit,
    pub truncated: bool,
    /// Entries whose exit stop never arrived
    pub discarded_entries: u64,
    pub events_emitted: u64,
}

pub struct Tracer {
    root: Pid,
    options: TracerOptions,
}

impl Tracer {
    /// Start `path` under trace with a cleared environment and null stdio.
    pub fn spawn(path: &Path, options: TracerOptions) -> Result<Self> {
        let mut command = Command::new(path);
        command
            .env_clear()
            .env("PATH", PAYLOAD_PATH)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        Self::spawn_command(command, options)
    }

    /// Start a prepared command under trace. The child is stopped at its
    /// first instruction when this returns.
    pub fn spawn_command(mut command: Command, options: TracerOptions) -> Result<Self> {
        // SAFETY: traceme is a single async-signal-safe syscall.
        unsafe {
            command.pre_exec(|| ptrace::traceme().map_err(io::Error::from));
        }

        let child = spawn_payload(&mut command, options.spawn_attempts)?;
        let root = Pid::from_raw(child.id() as i32);

        match waitpid(root, Some(WaitPidFlag::__WALL)) {
            Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => {}
            Ok(status) => {
                let _ = kill(root, Signal::SIGKILL);
                let _ = waitpid(root, Some(WaitPidFlag::__WALL));
                return Err(BinTraceError::Launch(format!(
                    "traced child did not stop at exec: {:?}",
                    status
                )));
            }
            Err(e) => return Err(BinTraceError::Launch(format!("waitpid(tracee): {}", e))),
        }

        if let Err(e) = ptrace::setoptions(root, options.ptrace_options()) {
            let _ = kill(root, Signal::SIGKILL);
            let _ = waitpid(root, Some(WaitPidFlag::__WALL));
            return Err(BinTraceError::Launch(format!("ptrace(SETOPTIONS): {}", e)));
        }

        log::debug!("tracing pid {} (follow_forks={})", root, options.follow_forks);
        Ok(Self { root, options })
    }

    pub fn root_pid(&self) -> i32 {
        self.root.as_raw()
    }

    /// Drive the tracee until every traced process is gone.
    ///
    /// Each syscall's entry is held until its exit stop, so the sink always
    /// receives the pair back to back. Entries still pending when a process
    /// exits are dropped.
    pub fn run(self, sink: &mut dyn EventSink) -> Result<TraceOutcome> {
        let mut states: HashMap<Pid, SyscallState> = HashMap::new();
        let mut awaiting_stop: HashSet<Pid> = HashSet::new();
        states.insert(self.root, SyscallState::AwaitingEntry);

        let mut outcome = TraceOutcome {
            root_pid: self.root.as_raw(),
            root_exit: RootExit::Lost,
            truncated: false,
            discarded_entries: 0,
            events_emitted: 0,
        };

        let wait_target = if self.options.follow_forks {
            Pid::from_raw(-1)
        } else {
            self.root
        };
        let wait_flags = WaitPidFlag::__WALL | WaitPidFlag::__WNOTHREAD;

        resume(self.root, None);

        loop {
            let status = match waitpid(wait_target, Some(wait_flags)) {
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break,
                Err(e) => {
                    log::warn!("waitpid during trace failed: {}", e);
                    break;
                }
            };

            match status {
                WaitStatus::PtraceSyscall(pid) => {
                    if let Err(e) = self.on_syscall_stop(pid, &mut states, sink, &mut outcome) {
                        abandon(&states);
                        return Err(BinTraceError::Trace(format!("event sink failed: {}", e)));
                    }
                    resume(pid, None);
                }
                WaitStatus::PtraceEvent(pid, _, event) => {
                    if is_fork_event(event) {
                        match ptrace::getevent(pid) {
                            Ok(raw) => {
                                let child = Pid::from_raw(raw as i32);
                                // The child's first stop may already have been seen.
                                if !states.contains_key(&child) {
                                    states.insert(child, SyscallState::AwaitingEntry);
                                    awaiting_stop.insert(child);
                                }
                                log::debug!("pid {} created traced child {}", pid, child);
                            }
                            Err(e) => log::debug!("GETEVENTMSG for {} failed: {}", pid, e),
                        }
                    }
                    resume(pid, None);
                }
                WaitStatus::Stopped(pid, signal) => {
                    if signal == Signal::SIGSTOP && awaiting_stop.remove(&pid) {
                        resume(pid, None);
                    } else if signal == Signal::SIGSTOP && !states.contains_key(&pid) {
                        states.insert(pid, SyscallState::AwaitingEntry);
                        resume(pid, None);
                    } else {
                        resume(pid, Some(signal));
                    }
                }
                WaitStatus::Exited(pid, code) => {
                    self.on_exit(pid, &mut states, &mut outcome, RootExit::Exited(code));
                    if pid == self.root && !self.options.follow_forks {
                        break;
                    }
                }
                WaitStatus::Signaled(pid, signal, _) => {
                    self.on_exit(pid, &mut states, &mut outcome, RootExit::Signaled(signal as i32));
                    if pid == self.root && !self.options.follow_forks {
                        break;
                    }
                }
                _ => {}
            }
        }

        outcome.truncated = outcome.root_exit == RootExit::Lost;
        if outcome.truncated {
            log::warn!(
                "trace of pid {} ended without an exit status after {} events",
                self.root,
                outcome.events_emitted
            );
        }
        Ok(outcome)
    }

    fn on_syscall_stop(
        &self,
        pid: Pid,
        states: &mut HashMap<Pid, SyscallState>,
        sink: &mut dyn EventSink,
        outcome: &mut TraceOutcome,
    ) -> io::Result<()> {
        let regs = match ptrace::getregs(pid) {
            Ok(regs) => regs,
            Err(e) => {
                log::debug!("GETREGS for {} failed: {}", pid, e);
                return Ok(());
            }
        };

        let state = states.entry(pid).or_default();
        match std::mem::take(state) {
            SyscallState::AwaitingEntry => {
                let number = regs.orig_rax;
                let registers = [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9];
                let args = decode_args(
                    &syscall_name(number),
                    registers,
                    &PtraceMemory::new(pid),
                    &self.options.limits,
                );
                *state = SyscallState::AwaitingExit {
                    pending: SyscallEvent::entry(pid.as_raw(), number, args, Utc::now()),
                };
            }
            SyscallState::AwaitingExit { pending } => {
                let exit = SyscallEvent::exit(pid.as_raw(), pending.number, regs.rax as i64, Utc::now());
                sink.record(pending)?;
                sink.record(exit)?;
                outcome.events_emitted += 2;
            }
        }
        Ok(())
    }

    fn on_exit(
        &self,
        pid: Pid,
        states: &mut HashMap<Pid, SyscallState>,
        outcome: &mut TraceOutcome,
        exit: RootExit,
    ) {
        if let Some(SyscallState::AwaitingExit { pending }) = states.remove(&pid) {
            log::debug!("pid {} exited inside {}", pid, pending.name);
            outcome.discarded_entries += 1;
        }
        if pid == self.root {
            outcome.root_exit = exit;
        }
    }
}

fn is_fork_event(event: i32) -> bool {
    event == libc::PTRACE_EVENT_FORK
        || event == libc::PTRACE_EVENT_VFORK
        || event == libc::PTRACE_EVENT_CLONE
}

// ESRCH means the tracee died between the stop and the resume.
fn resume(pid: Pid, signal: Option<Signal>) {
    match ptrace::syscall(pid, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => log::debug!("PTRACE_SYSCALL for {} failed: {}", pid, e),
    }
}

fn abandon(states: &HashMap<Pid, SyscallState>) {
    for pid in states.keys() {
        let _ = kill(*pid, Signal::SIGKILL);
    }
    for pid in states.keys() {
        let _ = waitpid(*pid, Some(WaitPidFlag::__WALL));
    }
}

/// Spawn `command`, retrying ETXTBSY up to `attempts` times in total.
///
/// A sibling forked by another thread may still hold a writable fd on a
/// freshly staged binary for a moment.
pub(crate) fn spawn_payload(command: &mut Command, attempts: u32) -> Result<std::process::Child> {
    let mut attempt = 1;
    loop {
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) && attempt < attempts => {
                attempt += 1;
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => return Err(BinTraceError::Launch(format!("spawn payload: {}", e))),
        }
    }
}
