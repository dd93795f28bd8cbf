/// File descriptor closure for the freshly forked proxy
/// Prefer close_range over the gaps between kept descriptors, fall back to
/// iterating /proc/self/fd
use crate::config::types::{BinTraceError, Result};
use nix::unistd::close;
use std::fs;
use std::os::fd::RawFd;

/// Close every descriptor above stderr that is not in `keep`.
pub fn close_inherited_fds(keep: &[RawFd]) -> Result<()> {
    let mut keep: Vec<RawFd> = keep.iter().copied().filter(|fd| *fd > 2).collect();
    keep.sort_unstable();
    keep.dedup();

    let ranges = closable_ranges(&keep);
    if ranges.iter().all(|(first, last)| try_close_range(*first, *last)) {
        return Ok(());
    }

    close_fds_via_proc(&keep)
}

/// Inclusive descriptor ranges starting at 3 that skip every kept fd.
fn closable_ranges(keep: &[RawFd]) -> Vec<(u32, u32)> {
    let mut ranges = Vec::new();
    let mut start: u32 = 3;
    for fd in keep {
        let fd = *fd as u32;
        if fd > start {
            ranges.push((start, fd - 1));
        }
        start = start.max(fd + 1);
    }
    ranges.push((start, u32::MAX));
    ranges
}

fn try_close_range(first: u32, last: u32) -> bool {
    // Linux 5.9+
    let result = unsafe { libc::syscall(libc::SYS_close_range, first, last, 0) };
    result == 0
}

fn close_fds_via_proc(keep: &[RawFd]) -> Result<()> {
    let fds = get_open_fds()?;
    let mut failed = Vec::new();

    for fd in fds.into_iter().filter(|fd| *fd > 2 && !keep.contains(fd)) {
        // The directory handle used for listing is already gone.
        match close(fd) {
            Ok(()) | Err(nix::errno::Errno::EBADF) => {}
            Err(e) => failed.push(format!("fd {}: {}", fd, e)),
        }
    }

    if !failed.is_empty() {
        return Err(BinTraceError::Launch(format!(
            "Failed to close {} FD(s): {}",
            failed.len(),
            failed.join(", ")
        )));
    }
    Ok(())
}

/// Open descriptors of the calling process, sorted
pub fn get_open_fds() -> Result<Vec<RawFd>> {
    let fd_dir = "/proc/self/fd";
    let entries = fs::read_dir(fd_dir)
        .map_err(|e| BinTraceError::Launch(format!("Failed to read {}: {}", fd_dir, e)))?;

    let mut fds: Vec<RawFd> = entries
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter_map(|name| name.parse().ok())
        .collect();
    fds.sort_unstable();
    Ok(fds)
}
