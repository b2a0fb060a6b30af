//! Host-to-host transport
//!
//! The aggregator reaches every host through [`HostTransport`]. Each host
//! serves the same [`HostRequest`]s through a [`HostEndpoint`], either over
//! HTTP (`POST /v1/host/dispatch`) or in-process.

use super::system::{ClusterEvent, EventSink};
use crate::domain::{FanoutRequest, RankFanoutResult};
use crate::error::{Error, Result};
use crate::subsystem::{
    NetworkScanRequest, NetworkScanResponse, SmdQueryRequest, SmdQueryResponse,
    StorageScanRequest, StorageScanResponse,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Path every host serves dispatched requests on
pub const DISPATCH_PATH: &str = "/v1/host/dispatch";

/// Path the leader receives cluster events on
pub const EVENT_PATH: &str = "/v1/system/event";

/// Slack on top of a request deadline for the host to answer
pub const HOST_DEADLINE_MARGIN: Duration = Duration::from_secs(1);

/// Request relayed to one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum HostRequest {
    Ranks(FanoutRequest),
    StorageScan(StorageScanRequest),
    NetworkScan(NetworkScanRequest),
    SmdQuery(SmdQueryRequest),
}

impl HostRequest {
    pub fn name(&self) -> &'static str {
        match self {
            HostRequest::Ranks(request) => request.op.name(),
            HostRequest::StorageScan(_) => "storage_scan",
            HostRequest::NetworkScan(_) => "network_scan",
            HostRequest::SmdQuery(_) => "smd_query",
        }
    }

    /// Deadline the request carries for its own targets, if any
    pub fn deadline(&self) -> Option<Duration> {
        match self {
            HostRequest::Ranks(request) => request.timeout(),
            _ => None,
        }
    }

    /// How long to wait for a host: at least `host_timeout`, and long enough
    /// for the host to report per-target timeouts itself
    pub fn host_bound(&self, host_timeout: Duration) -> Duration {
        match self.deadline() {
            Some(deadline) => host_timeout.max(deadline + HOST_DEADLINE_MARGIN),
            None => host_timeout,
        }
    }
}

/// A host's answer to a [`HostRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum HostResponse {
    Ranks(RankFanoutResult),
    StorageScan(StorageScanResponse),
    NetworkScan(NetworkScanResponse),
    SmdQuery(SmdQueryResponse),
}

/// Serves host requests on one host
#[async_trait]
pub trait HostEndpoint: Send + Sync {
    async fn handle(&self, request: HostRequest) -> Result<HostResponse>;
}

/// Carries a host request to the named host
#[async_trait]
pub trait HostTransport: Send + Sync {
    async fn dispatch(&self, host: &str, request: &HostRequest) -> Result<HostResponse>;
}

pub type HostEndpointRef = Arc<dyn HostEndpoint>;
pub type HostTransportRef = Arc<dyn HostTransport>;

/// JSON over HTTP to each host's dispatch endpoint
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    scheme: String,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            scheme: "http".to_string(),
            timeout,
        })
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    fn url(&self, host: &str, path: &str) -> String {
        format!("{}://{}{}", self.scheme, host, path)
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        host: &str,
        path: &str,
        body: &T,
        timeout: Duration,
    ) -> Result<reqwest::Response> {
        let unreachable = |reason: String| Error::TransportFailure {
            host: host.to_string(),
            reason,
        };

        let response = self
            .client
            .post(self.url(host, path))
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let reason = match response.json::<RemoteError>().await {
                Ok(body) => format!("{}: {}", status, body.message),
                Err(_) => status.to_string(),
            };
            return Err(unreachable(reason));
        }
        Ok(response)
    }
}

#[derive(Deserialize)]
struct RemoteError {
    message: String,
}

#[async_trait]
impl HostTransport for HttpTransport {
    async fn dispatch(&self, host: &str, request: &HostRequest) -> Result<HostResponse> {
        debug!(host, request = request.name(), "Dispatching to host");
        let timeout = request.host_bound(self.timeout);
        self.post(host, DISPATCH_PATH, request, timeout)
            .await?
            .json::<HostResponse>()
            .await
            .map_err(|e| Error::TransportFailure {
                host: host.to_string(),
                reason: format!("invalid response: {}", e),
            })
    }
}

/// Delivers cluster events to the leader over HTTP
#[derive(Debug, Clone)]
pub struct HttpEventSink {
    transport: HttpTransport,
    leader: String,
}

impl HttpEventSink {
    pub fn new(transport: HttpTransport, leader: impl Into<String>) -> Self {
        Self {
            transport,
            leader: leader.into(),
        }
    }
}

#[async_trait]
impl EventSink for HttpEventSink {
    async fn send(&self, event: ClusterEvent) -> Result<()> {
        self.transport
            .post(&self.leader, EVENT_PATH, &event, self.transport.timeout)
            .await?;
        Ok(())
    }
}

/// In-process transport over registered endpoints
#[derive(Default)]
pub struct LocalTransport {
    endpoints: RwLock<BTreeMap<String, HostEndpointRef>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, host: impl Into<String>, endpoint: HostEndpointRef) {
        self.endpoints.write().insert(host.into(), endpoint);
    }

    /// Drop a host so it becomes unreachable
    pub fn remove(&self, host: &str) -> bool {
        self.endpoints.write().remove(host).is_some()
    }
}

#[async_trait]
impl HostTransport for LocalTransport {
    async fn dispatch(&self, host: &str, request: &HostRequest) -> Result<HostResponse> {
        let endpoint = self.endpoints.read().get(host).cloned();
        match endpoint {
            Some(endpoint) => endpoint.handle(request.clone()).await,
            None => Err(Error::TransportFailure {
                host: host.to_string(),
                reason: "no route to host".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FailureKind, RankOp};

    struct Echo;

    #[async_trait]
    impl HostEndpoint for Echo {
        async fn handle(&self, request: HostRequest) -> Result<HostResponse> {
            match request {
                HostRequest::NetworkScan(_) => Ok(HostResponse::NetworkScan(NetworkScanResponse {
                    interfaces: vec![],
                    numa_nodes: 0,
                })),
                other => Err(Error::InvalidRequest(other.name().to_string())),
            }
        }
    }

    #[test]
    fn test_request_wire_format() {
        let request = HostRequest::Ranks(FanoutRequest::new("0-1".parse().unwrap(), RankOp::Query));
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["kind"], "ranks");
        assert_eq!(json["body"]["ranks"], "0-1");
        assert_eq!(json["body"]["op"]["op"], "query");

        let back: HostRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn test_host_bound_follows_request_deadline() {
        let host_timeout = Duration::from_secs(2);
        let plain = HostRequest::Ranks(FanoutRequest::new("0".parse().unwrap(), RankOp::Query));
        assert_eq!(plain.host_bound(host_timeout), host_timeout);

        let short = HostRequest::Ranks(
            FanoutRequest::new("0".parse().unwrap(), RankOp::Query)
                .with_timeout(Duration::from_millis(100)),
        );
        assert_eq!(short.host_bound(host_timeout), host_timeout);

        let long = HostRequest::Ranks(
            FanoutRequest::new("0".parse().unwrap(), RankOp::Query)
                .with_timeout(Duration::from_secs(10)),
        );
        assert_eq!(long.host_bound(host_timeout), Duration::from_secs(10) + HOST_DEADLINE_MARGIN);

        let scan = HostRequest::NetworkScan(NetworkScanRequest::default());
        assert_eq!(scan.host_bound(host_timeout), host_timeout);
    }

    #[test]
    fn test_http_url() {
        let transport = HttpTransport::new(Duration::from_secs(1)).unwrap();
        assert_eq!(
            transport.url("10.0.0.2:8090", DISPATCH_PATH),
            "http://10.0.0.2:8090/v1/host/dispatch"
        );
    }

    #[tokio::test]
    async fn test_local_transport_routes() {
        let transport = LocalTransport::new();
        transport.register("a", Arc::new(Echo));

        let request = HostRequest::NetworkScan(NetworkScanRequest::default());
        assert!(transport.dispatch("a", &request).await.is_ok());

        let err = transport.dispatch("b", &request).await.unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::TransportFailure);

        assert!(transport.remove("a"));
        assert!(transport.dispatch("a", &request).await.is_err());
    }
}
