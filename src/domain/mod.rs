//! Domain layer - Core types, the engine state machine and port definitions
//!
//! This module defines the core traits (ports) that adapters implement,
//! following hexagonal architecture principles.

pub mod ports;
pub mod ranks;
pub mod state;

pub use ports::*;
pub use ranks::*;
pub use state::*;
