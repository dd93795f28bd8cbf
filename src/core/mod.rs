//! Sandbox process model.
//!
//! The supervisor forks a proxy, the proxy unshares namespaces and starts
//! the payload, and the pair talks over JSON pipes.

pub mod fd_closure;
pub mod proxy;
pub mod supervisor;
pub mod types;
