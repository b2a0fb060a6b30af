//! Fanout layer - per-target locking, deadline dispatch and the rank coordinator
//!
//! The dispatch core is generic over the target key so the subsystem
//! managers fan device operations out the same way ranks are handled.

pub mod coordinator;
pub mod dispatch;
pub mod locks;

pub use coordinator::{CoordinatorConfig, RankCoordinator};
pub use dispatch::Dispatcher;
pub use locks::{KeyedLocks, TargetGuard};
