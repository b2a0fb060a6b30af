//! Hardware Discovery Module
//!
//! Discovers NVMe controllers and fabric interfaces on Linux systems.

pub mod fabric;
pub mod nvme;
pub mod scanner;

pub use fabric::*;
pub use nvme::*;
pub use scanner::*;
