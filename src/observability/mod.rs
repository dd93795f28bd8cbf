//! Structured audit events
pub mod audit;
