//! Best-effort decoding of pointer arguments.
//!
//! Decoders are keyed by syscall name. Each one rewrites the raw argument
//! snapshot in place; a pointer that cannot be read leaves the raw value.

use crate::kernel::memory::ProcessMemory;
use crate::trace::types::{SyscallArg, ARG_REGISTERS};
use once_cell::sync::Lazy;
use std::collections::HashMap;

pub const MAX_STRING_LEN: usize = 256;
pub const MAX_ARRAY_LEN: usize = 16;

const CHUNK: usize = 64;
const POINTER: usize = std::mem::size_of::<u64>();

/// Upper bounds applied to every out-of-process read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeLimits {
    pub max_string_len: usize,
    pub max_array_len: usize,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            max_string_len: MAX_STRING_LEN,
            max_array_len: MAX_ARRAY_LEN,
        }
    }
}

pub type Decoder = fn(&dyn ProcessMemory, &mut [SyscallArg], &DecodeLimits);

static DECODERS: Lazy<HashMap<&'static str, Decoder>> = Lazy::new(|| {
    let mut registry: HashMap<&'static str, Decoder> = HashMap::new();
    for name in [
        "open", "creat", "stat", "lstat", "access", "truncate", "chdir", "mkdir", "rmdir",
        "unlink", "readlink",
    ] {
        registry.insert(name, decode_path_first);
    }
    for name in ["openat", "newfstatat", "mkdirat", "unlinkat", "faccessat"] {
        registry.insert(name, decode_path_second);
    }
    registry.insert("execve", decode_execve);
    registry.insert("execveat", decode_execveat);
    registry
});

/// Decoder registered for `name`, if any.
pub fn decoder_for(name: &str) -> Option<Decoder> {
    DECODERS.get(name).copied()
}

/// Snapshot the six argument registers and apply the decoder for `name`.
pub fn decode_args(
    name: &str,
    registers: [u64; 6],
    memory: &dyn ProcessMemory,
    limits: &DecodeLimits,
) -> Vec<SyscallArg> {
    let mut args: Vec<SyscallArg> = ARG_REGISTERS
        .iter()
        .zip(registers)
        .map(|(register, value)| SyscallArg::Raw {
            register: *register,
            value,
        })
        .collect();

    if let Some(decoder) = decoder_for(name) {
        decoder(memory, &mut args, limits);
    }
    args
}

/// Read a NUL-terminated string of at most `max_len` bytes.
///
/// Returns `None` for a NULL pointer or when not even the first byte is
/// readable. A string that hits the limit or a fault is returned truncated.
pub fn read_c_string(memory: &dyn ProcessMemory, addr: u64, max_len: usize) -> Option<String> {
    if addr == 0 {
        return None;
    }

    let mut bytes = Vec::new();
    let mut cursor = addr;
    while bytes.len() < max_len {
        let want = CHUNK.min(max_len - bytes.len());
        let chunk = memory.peek(cursor, want);
        if chunk.is_empty() {
            break;
        }
        if let Some(nul) = chunk.iter().position(|b| *b == 0) {
            bytes.extend_from_slice(&chunk[..nul]);
            return Some(String::from_utf8_lossy(&bytes).into_owned());
        }
        bytes.extend_from_slice(&chunk);
        if chunk.len() < want {
            break;
        }
        cursor = cursor.checked_add(chunk.len() as u64)?;
    }

    if bytes.is_empty() && memory.peek(addr, 1).is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// Read a NULL-terminated array of pointers, stopping at `max_len` entries.
pub fn read_pointer_array(memory: &dyn ProcessMemory, addr: u64, max_len: usize) -> Vec<u64> {
    let mut pointers = Vec::new();
    if addr == 0 {
        return pointers;
    }

    for index in 0..max_len as u64 {
        let slot = match addr.checked_add(index * POINTER as u64) {
            Some(slot) => slot,
            None => break,
        };
        let raw = memory.peek(slot, POINTER);
        let Ok(word) = <[u8; POINTER]>::try_from(raw.as_slice()) else {
            break;
        };
        let pointer = u64::from_ne_bytes(word);
        if pointer == 0 {
            break;
        }
        pointers.push(pointer);
    }
    pointers
}

/// Read an argv-style array. Unreadable entries are skipped.
pub fn read_string_array(
    memory: &dyn ProcessMemory,
    addr: u64,
    limits: &DecodeLimits,
) -> Option<Vec<String>> {
    if addr == 0 {
        return None;
    }
    let values = read_pointer_array(memory, addr, limits.max_array_len)
        .into_iter()
        .filter_map(|pointer| read_c_string(memory, pointer, limits.max_string_len))
        .collect();
    Some(values)
}

fn decode_string_at(
    memory: &dyn ProcessMemory,
    args: &mut [SyscallArg],
    index: usize,
    limits: &DecodeLimits,
) {
    let Some(SyscallArg::Raw { register, value }) = args.get(index).cloned() else {
        return;
    };
    if let Some(text) = read_c_string(memory, value, limits.max_string_len) {
        args[index] = SyscallArg::Str {
            register,
            value: text,
            addr: value,
        };
    }
}

fn decode_array_at(
    memory: &dyn ProcessMemory,
    args: &mut [SyscallArg],
    index: usize,
    limits: &DecodeLimits,
) {
    let Some(SyscallArg::Raw { register, value }) = args.get(index).cloned() else {
        return;
    };
    if let Some(values) = read_string_array(memory, value, limits) {
        args[index] = SyscallArg::StrArray {
            register,
            values,
            addr: value,
        };
    }
}

fn decode_path_first(memory: &dyn ProcessMemory, args: &mut [SyscallArg], limits: &DecodeLimits) {
    decode_string_at(memory, args, 0, limits);
}

// First argument is a directory fd.
fn decode_path_second(memory: &dyn ProcessMemory, args: &mut [SyscallArg], limits: &DecodeLimits) {
    decode_string_at(memory, args, 1, limits);
}

fn decode_execve(memory: &dyn ProcessMemory, args: &mut [SyscallArg], limits: &DecodeLimits) {
    decode_string_at(memory, args, 0, limits);
    decode_array_at(memory, args, 1, limits);
}

fn decode_execveat(memory: &dyn ProcessMemory, args: &mut [SyscallArg], limits: &DecodeLimits) {
    decode_string_at(memory, args, 1, limits);
    decode_array_at(memory, args, 2, limits);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::memory::FakeMemory;
    use crate::trace::types::Register;

    fn pointer_table(pointers: &[u64]) -> Vec<u8> {
        pointers.iter().flat_map(|p| p.to_ne_bytes()).collect()
    }

    #[test]
    fn test_read_c_string_stops_at_nul() {
        let mem = FakeMemory::new().map(0x1000, b"/etc/passwd\0garbage");
        assert_eq!(
            read_c_string(&mem, 0x1000, MAX_STRING_LEN).as_deref(),
            Some("/etc/passwd")
        );
    }

    #[test]
    fn test_read_c_string_null_and_unmapped() {
        let mem = FakeMemory::new();
        assert_eq!(read_c_string(&mem, 0, MAX_STRING_LEN), None);
        assert_eq!(read_c_string(&mem, 0xdead0000, MAX_STRING_LEN), None);
    }

    #[test]
    fn test_read_c_string_bounded() {
        let long = vec![b'a'; 1000];
        let mem = FakeMemory::new().map(0x1000, &long);
        let text = read_c_string(&mem, 0x1000, MAX_STRING_LEN).unwrap();
        assert_eq!(text.len(), MAX_STRING_LEN);
    }

    #[test]
    fn test_read_c_string_truncated_by_fault() {
        // No terminator before the mapping ends.
        let mem = FakeMemory::new().map(0x1000, b"partial");
        assert_eq!(
            read_c_string(&mem, 0x1000, MAX_STRING_LEN).as_deref(),
            Some("partial")
        );
    }

    #[test]
    fn test_pointer_array_bounded() {
        let table = pointer_table(&[0x2000; 40]);
        let mem = FakeMemory::new().map(0x1000, &table);
        assert_eq!(read_pointer_array(&mem, 0x1000, MAX_ARRAY_LEN).len(), MAX_ARRAY_LEN);
    }

    #[test]
    fn test_execve_decodes_path_and_argv() {
        let table = pointer_table(&[0x2000, 0x3000, 0]);
        let mem = FakeMemory::new()
            .map(0x1000, &table)
            .map(0x2000, b"/bin/true\0")
            .map(0x3000, b"--version\0")
            .map(0x4000, b"/bin/true\0");

        let args = decode_args(
            "execve",
            [0x4000, 0x1000, 0, 0, 0, 0],
            &mem,
            &DecodeLimits::default(),
        );
        assert_eq!(args.len(), 6);
        assert_eq!(args[0].as_str(), Some("/bin/true"));
        assert_eq!(
            args[1].as_str_array(),
            Some(&["/bin/true".to_string(), "--version".to_string()][..])
        );
        assert_eq!(args[1].raw_value(), Some(0x1000));
        assert_eq!(
            args[2],
            SyscallArg::Raw {
                register: Register::Rdx,
                value: 0
            }
        );
    }

    #[test]
    fn test_openat_decodes_second_argument() {
        let mem = FakeMemory::new().map(0x5000, b"/tmp/x\0");
        let dirfd = (-100i64) as u64;
        let args = decode_args(
            "openat",
            [dirfd, 0x5000, 0, 0, 0, 0],
            &mem,
            &DecodeLimits::default(),
        );
        assert_eq!(args[0].raw_value(), Some(dirfd));
        assert_eq!(args[1].as_str(), Some("/tmp/x"));
    }

    #[test]
    fn test_bad_pointer_keeps_raw_value() {
        let mem = FakeMemory::new();
        let args = decode_args("open", [0xbad, 0, 0, 0, 0, 0], &mem, &DecodeLimits::default());
        assert_eq!(
            args[0],
            SyscallArg::Raw {
                register: Register::Rdi,
                value: 0xbad
            }
        );
    }

    #[test]
    fn test_unregistered_syscall_stays_raw() {
        assert!(decoder_for("write").is_none());
        let mem = FakeMemory::new();
        let args = decode_args("write", [1, 2, 3, 4, 5, 6], &mem, &DecodeLimits::default());
        assert!(args.iter().all(|arg| matches!(arg, SyscallArg::Raw { .. })));
    }
}
