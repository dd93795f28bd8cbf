//! Safety and cleanup
//!
//! Staged artifacts are removed on every exit path.

pub mod staging;

pub use staging::{stage_binary, StagedBinary};
