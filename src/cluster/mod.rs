//! Cluster layer - leader-side operations across many hosts
//!
//! The [`aggregator::HostAggregator`] relays requests to hosts and folds the
//! answers; [`system::SystemService`] and [`pool::PoolService`] build the
//! cluster surface on top of it.

pub mod aggregator;
pub mod leader;
pub mod membership;
pub mod pool;
pub mod system;
pub mod transport;

pub use aggregator::{merge_ranks, HostAggregate, HostAggregator};
pub use leader::{LeaderInfo, LeaderResolver, StaticLeader};
pub use membership::{HostMember, JoinRequest, JoinResponse, Membership};
pub use pool::{PoolService, PoolSummary};
pub use system::{ClusterEvent, EventSink, SystemService};
pub use transport::{
    HostEndpoint, HostEndpointRef, HostRequest, HostResponse, HostTransport, HostTransportRef,
    HttpEventSink, HttpTransport, LocalTransport,
};
