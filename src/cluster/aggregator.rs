//! Host Aggregator
//!
//! Dispatches a request to many hosts concurrently and collects exactly one
//! outcome per host. An unreachable or late host becomes a host-level
//! failure; it never fails the call.

use super::transport::{HostEndpointRef, HostRequest, HostResponse, HostTransportRef};
use crate::domain::{FailureKind, FanoutResult, Outcome, Rank, RankFanoutResult, RankSet};
use crate::error::{Error, Result};
use crate::metrics;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// One outcome per host, ascending by host
pub type HostAggregate = FanoutResult<String, HostResponse>;

pub struct HostAggregator {
    transport: HostTransportRef,
    /// Served in-process instead of over the transport
    local: Option<(String, HostEndpointRef)>,
    host_timeout: Duration,
}

impl HostAggregator {
    pub fn new(transport: HostTransportRef, host_timeout: Duration) -> Self {
        Self {
            transport,
            local: None,
            host_timeout,
        }
    }

    pub fn with_local(mut self, host: impl Into<String>, endpoint: HostEndpointRef) -> Self {
        self.local = Some((host.into(), endpoint));
        self
    }

    pub fn host_timeout(&self) -> Duration {
        self.host_timeout
    }

    async fn dispatch_one(&self, host: &str, request: &HostRequest) -> Result<HostResponse> {
        match &self.local {
            Some((local, endpoint)) if local == host => endpoint.handle(request.clone()).await,
            _ => self.transport.dispatch(host, request).await,
        }
    }

    /// Send each host its request and wait for each at most the host timeout,
    /// stretched to cover a longer deadline carried by the request
    pub async fn cluster_fanout(&self, requests: BTreeMap<String, HostRequest>) -> HostAggregate {
        let started = Instant::now();
        let timer = metrics::FANOUT_DURATION
            .with_label_values(&["hosts"])
            .start_timer();

        let pending = requests.into_iter().map(|(host, request)| async move {
            let bound = request.host_bound(self.host_timeout);
            let result = match tokio::time::timeout(bound, self.dispatch_one(&host, &request)).await
            {
                Ok(result) => result,
                Err(_) => Err(Error::TransportFailure {
                    host: host.clone(),
                    reason: format!("no response within {:?}", bound),
                }),
            };

            if let Err(e) = &result {
                warn!(host = %host, request = request.name(), error = %e, "Host dispatch failed");
            }
            let outcome = host_outcome(result);
            metrics::record_outcome("hosts", &outcome);
            (host, outcome)
        });

        let outcomes: BTreeMap<String, Outcome<HostResponse>> =
            join_all(pending).await.into_iter().collect();
        timer.observe_duration();

        let aggregate = FanoutResult::from_map(outcomes);
        info!(
            hosts = aggregate.len(),
            failed = aggregate.failed_targets().len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Cluster fanout complete"
        );
        aggregate
    }

    /// Send the same request to every host
    pub async fn broadcast(
        &self,
        hosts: impl IntoIterator<Item = String>,
        request: &HostRequest,
    ) -> HostAggregate {
        let requests = hosts
            .into_iter()
            .map(|host| (host, request.clone()))
            .collect();
        self.cluster_fanout(requests).await
    }
}

/// Whatever stopped a host from answering is reported as a transport failure
fn host_outcome(result: Result<HostResponse>) -> Outcome<HostResponse> {
    match result {
        Ok(response) => Outcome::success(response),
        Err(e) => Outcome::failure(FailureKind::TransportFailure, e.to_string()),
    }
}

/// Fold per-host rank results into one cluster-wide rank result.
///
/// `requested` maps each host to the ranks it was asked about. A failed host
/// contributes its host-level failure to each of those ranks. Only requested
/// ranks are taken from a host's answer, and any it left out fail with
/// `TransportFailure`.
pub fn merge_ranks(
    aggregate: HostAggregate,
    requested: &BTreeMap<String, RankSet>,
) -> RankFanoutResult {
    let mut merged = BTreeMap::new();

    for (host, outcome) in aggregate.into_map() {
        let ranks = requested.get(&host).cloned().unwrap_or_default();
        match outcome {
            Outcome::Success {
                payload: Some(HostResponse::Ranks(result)),
            } => {
                let mut answered = result.into_map();
                for rank in ranks.iter() {
                    let outcome = answered.remove(&rank).unwrap_or_else(|| {
                        Outcome::failure(
                            FailureKind::TransportFailure,
                            format!("rank {} missing from host {} response", rank, host),
                        )
                    });
                    merged.insert(rank, outcome);
                }
                if !answered.is_empty() {
                    warn!(host = %host, extra = answered.len(), "Host answered for unrequested ranks");
                }
            }
            Outcome::Success { .. } => {
                let message = format!("host {} returned no rank results", host);
                for rank in ranks.iter() {
                    merged.insert(rank, Outcome::failure(FailureKind::TransportFailure, &message));
                }
            }
            Outcome::Failure { kind, message } => {
                for rank in ranks.iter() {
                    merged.insert(rank, Outcome::failure(kind, message.clone()));
                }
            }
        }
    }

    FanoutResult::from_map(merged)
}

/// Add `NotFound` outcomes for ranks no host owns
pub fn with_unknown_ranks(
    result: RankFanoutResult,
    unknown: impl IntoIterator<Item = Rank>,
) -> RankFanoutResult {
    let mut map = result.into_map();
    for rank in unknown {
        let err = Error::RankNotFound { rank };
        map.insert(rank, Outcome::from_error(&err));
    }
    FanoutResult::from_map(map)
}
