//! Engine Control Plane
//!
//! Per-host management of storage engine processes ("ranks") and the local
//! hardware they run on, plus a leader-side layer that relays operations to
//! every host and merges the answers into one result per rank.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                          Leader (Host Aggregator)                            │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │ System Service  │  │  Pool Service   │  │  Membership / Leadership    │  │
//! │  └────────┬────────┘  └─────────────────┘  └─────────────────────────────┘  │
//! │           │   per-host requests (HTTP or in-process), merged per rank       │
//! ├───────────┼─────────────────────────────────────────────────────────────────┤
//! │           ▼                    Host Context                                  │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │ Rank Coordinator│  │    Storage /    │  │   SMD / Network managers    │  │
//! │  │  (rank fanout)  │  │    Firmware     │  │                             │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           │         per-target try-locks, one deadline   │                  │
//! │  ┌────────┴────────┐  ┌────────┴────────────────────────┴───────────────┐  │
//! │  │  Rank Registry  │  │      Hardware providers (sysfs / simulated)     │  │
//! │  │ + Engine Handles│  │                                                  │  │
//! │  └─────────────────┘  └──────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`fanout`]: Parallel per-target dispatch, try-locks and the rank coordinator
//! - [`engine`]: Rank registry, engine handles and engine process adapters
//! - [`subsystem`]: Storage, firmware, network and SMD managers
//! - [`hardware`]: NVMe and fabric discovery, simulated inventory
//! - [`cluster`]: Host aggregator, membership, leadership, system and pools
//! - [`controlplane`]: Host context and REST API
//! - [`config`]: YAML configuration
//! - [`domain`]: Core types and ports
//! - [`metrics`]: Prometheus collectors
//! - [`error`]: Error types and handling

pub mod cluster;
pub mod config;
pub mod controlplane;
pub mod domain;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod hardware;
pub mod metrics;
pub mod subsystem;

// Re-export commonly used types
pub use cluster::{
    HostAggregator, HttpEventSink, HttpTransport, LocalTransport, Membership, StaticLeader,
    SystemService,
};

pub use config::ControlConfig;

pub use controlplane::{ApiServer, ApiServerConfig, HostContext, RestRouter};

pub use domain::{
    EngineState, FailureKind, FanoutRequest, FanoutResult, Outcome, Rank, RankFanoutResult,
    RankOp, RankSet,
};

pub use engine::{RankEvent, RankRegistry};

pub use error::{Error, Result};

pub use fanout::{Dispatcher, KeyedLocks, RankCoordinator};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
