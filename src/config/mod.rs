//! Configuration and error taxonomy
//!
//! Sandbox configuration, its validation, and the crate-wide error types.

pub mod types;
pub mod validator;
