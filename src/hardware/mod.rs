//! Hardware Module
//!
//! Storage and fabric providers behind the subsystem managers: sysfs and
//! nvme-cli backed discovery, plus an in-memory inventory for simulation.

pub mod discovery;
pub mod simulated;

pub use discovery::*;
pub use simulated::*;

