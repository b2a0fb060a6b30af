//! Engine layer - rank registry, engine handles and engine process adapters
//!
//! The registry is the single source of truth for rank lifecycle state.
//! Engine handles drive the processes and record every outcome in it.

pub mod events;
pub mod handle;
pub mod mock;
pub mod process;
pub mod registry;

pub use events::RankEvent;
pub use handle::{EngineHandle, HandleConfig};
pub use mock::MockEngine;
pub use process::{EngineSpec, ExitNotice, ProcessEngine};
pub use registry::{RankEntry, RankRegistry, RegistryStatsSnapshot};
