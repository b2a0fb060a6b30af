//! Control Plane Module
//!
//! Wires one host together: the [`context::HostContext`] holding the local
//! managers, and the API server exposing them.

pub mod api;
pub mod context;

pub use api::*;
pub use context::HostContext;
