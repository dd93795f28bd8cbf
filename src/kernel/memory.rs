//! Cross-process memory reads.
//!
//! Reads are only meaningful while the target is in a ptrace stop. A fault
//! part way through a read truncates the result instead of failing it.

use nix::sys::ptrace;
use nix::unistd::Pid;

const WORD: u64 = std::mem::size_of::<libc::c_long>() as u64;

/// A read-only view of another process's address space.
pub trait ProcessMemory {
    /// Read up to `len` bytes starting at `addr`. The result is shorter than
    /// `len` when the range runs into unmapped memory.
    fn peek(&self, addr: u64, len: usize) -> Vec<u8>;
}

/// Word-granular `PTRACE_PEEKDATA` reader for a stopped tracee.
#[derive(Debug, Clone, Copy)]
pub struct PtraceMemory {
    pid: Pid,
}

impl PtraceMemory {
    pub fn new(pid: Pid) -> Self {
        Self { pid }
    }
}

impl ProcessMemory for PtraceMemory {
    fn peek(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        let mut offset = (addr % WORD) as usize;
        let mut word_addr = addr - offset as u64;

        while out.len() < len {
            let word = match ptrace::read(self.pid, word_addr as ptrace::AddressType) {
                Ok(word) => word,
                Err(err) => {
                    log::debug!(
                        "peek pid={} at 0x{:x} stopped after {} bytes: {}",
                        self.pid,
                        word_addr,
                        out.len(),
                        err
                    );
                    break;
                }
            };
            let bytes = word.to_ne_bytes();
            let take = (bytes.len() - offset).min(len - out.len());
            out.extend_from_slice(&bytes[offset..offset + take]);
            offset = 0;
            word_addr = match word_addr.checked_add(WORD) {
                Some(next) => next,
                None => break,
            };
        }

        out
    }
}

/// In-memory address space used by decoder tests.
#[cfg(test)]
pub(crate) struct FakeMemory {
    regions: Vec<(u64, Vec<u8>)>,
}

#[cfg(test)]
impl FakeMemory {
    pub(crate) fn new() -> Self {
        Self { regions: Vec::new() }
    }

    pub(crate) fn map(mut self, base: u64, bytes: &[u8]) -> Self {
        self.regions.push((base, bytes.to_vec()));
        self
    }
}

#[cfg(test)]
impl ProcessMemory for FakeMemory {
    fn peek(&self, addr: u64, len: usize) -> Vec<u8> {
        for (base, bytes) in &self.regions {
            let end = base + bytes.len() as u64;
            if addr >= *base && addr < end {
                let start = (addr - base) as usize;
                let stop = (start + len).min(bytes.len());
                return bytes[start..stop].to_vec();
            }
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_memory_truncates_at_region_end() {
        let mem = FakeMemory::new().map(0x1000, b"abcdef");
        assert_eq!(mem.peek(0x1002, 16), b"cdef".to_vec());
        assert!(mem.peek(0x2000, 4).is_empty());
    }

    #[test]
    fn test_ptrace_peek_of_untraced_pid_is_empty() {
        // Not a tracee of ours, so every PEEKDATA fails with ESRCH.
        let mem = PtraceMemory::new(Pid::from_raw(1));
        assert!(mem.peek(0x1000, 8).is_empty());
    }
}
