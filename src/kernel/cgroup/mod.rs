//! Cgroup resource governance
//!
//! cgroup v2 backend plus the per-run governor built on it.

pub mod backend;
pub mod governor;
pub mod v2;

pub use backend::{CgroupBackend, ResourceLimits, ResourceUsage};
pub use governor::ResourceGovernor;
pub use v2::CgroupV2;
