//! Syscall event records and per-process tracing state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which side of a syscall an event describes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Entry,
    Exit,
}

/// x86_64 syscall argument registers, in argument order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Register {
    Rdi,
    Rsi,
    Rdx,
    R10,
    R8,
    R9,
}

pub const ARG_REGISTERS: [Register; 6] = [
    Register::Rdi,
    Register::Rsi,
    Register::Rdx,
    Register::R10,
    Register::R8,
    Register::R9,
];

/// One argument snapshot. Decoded variants keep the raw pointer value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyscallArg {
    Raw {
        register: Register,
        value: u64,
    },
    Str {
        register: Register,
        value: String,
        addr: u64,
    },
    StrArray {
        register: Register,
        values: Vec<String>,
        addr: u64,
    },
    /// Token recovered from the helper line protocol that is not a number
    Token { value: String },
}

impl SyscallArg {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SyscallArg::Str { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn as_str_array(&self) -> Option<&[String]> {
        match self {
            SyscallArg::StrArray { values, .. } => Some(values),
            _ => None,
        }
    }

    /// Register value behind this argument, decoded or not.
    pub fn raw_value(&self) -> Option<u64> {
        match self {
            SyscallArg::Raw { value, .. } => Some(*value),
            SyscallArg::Str { addr, .. } | SyscallArg::StrArray { addr, .. } => Some(*addr),
            SyscallArg::Token { .. } => None,
        }
    }
}

/// A single syscall entry or exit observed in a traced process
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyscallEvent {
    pub pid: i32,
    pub name: String,
    pub number: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<SyscallArg>,
    /// Set on exit events only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ret: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub event: EventKind,
}

impl SyscallEvent {
    pub fn entry(pid: i32, number: u64, args: Vec<SyscallArg>, timestamp: DateTime<Utc>) -> Self {
        Self {
            pid,
            name: crate::kernel::syscalls::syscall_name(number),
            number,
            args,
            ret: None,
            timestamp,
            event: EventKind::Entry,
        }
    }

    pub fn exit(pid: i32, number: u64, ret: i64, timestamp: DateTime<Utc>) -> Self {
        Self {
            pid,
            name: crate::kernel::syscalls::syscall_name(number),
            number,
            args: Vec::new(),
            ret: Some(ret),
            timestamp,
            event: EventKind::Exit,
        }
    }

    pub fn is_entry(&self) -> bool {
        self.event == EventKind::Entry
    }
}

/// Where a traced process is in its entry/exit stop sequence
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyscallState {
    AwaitingEntry,
    /// Entry seen; held back until its exit stop so the pair is emitted adjacently
    AwaitingExit { pending: SyscallEvent },
}

impl Default for SyscallState {
    fn default() -> Self {
        SyscallState::AwaitingEntry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_has_no_return_value() {
        let event = SyscallEvent::entry(10, 1, Vec::new(), Utc::now());
        assert_eq!(event.name, "write");
        assert!(event.ret.is_none());
        assert!(event.is_entry());
    }

    #[test]
    fn test_exit_carries_return_value() {
        let event = SyscallEvent::exit(10, 9999, -2, Utc::now());
        assert_eq!(event.name, "syscall_9999");
        assert_eq!(event.ret, Some(-2));
        assert_eq!(event.event, EventKind::Exit);
    }

    #[test]
    fn test_serialized_shape() {
        let event = SyscallEvent::entry(
            7,
            59,
            vec![SyscallArg::Str {
                register: Register::Rdi,
                value: "/bin/true".to_string(),
                addr: 0x4000,
            }],
            Utc::now(),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "entry");
        assert_eq!(value["args"][0]["kind"], "str");
        assert_eq!(value["args"][0]["register"], "rdi");
        assert!(value.get("ret").is_none());
    }
}
