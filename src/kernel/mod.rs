//! Thin wrappers around Linux kernel primitives.
//!
//! Most `unsafe` code is concentrated here.
//! Dependency direction: syscalls -> memory -> namespace -> cgroup

pub mod cgroup;
pub mod memory;
pub mod namespace;
pub mod syscalls;
