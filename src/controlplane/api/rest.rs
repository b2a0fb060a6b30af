//! REST API Handlers
//!
//! JSON over HTTP for the host surface (storage, network, firmware, SMD,
//! ranks), the host dispatch endpoint used by the aggregator, and the
//! leader's system and pool surface.
//!
//! Request bodies that fail to parse are answered with 400. Failures of
//! individual ranks or devices are not HTTP errors: they come back with 200
//! inside the per-target result.

use crate::cluster::pool::{
    AclRequest, ConnectRequest, ContSetOwnerRequest, ContainerCreateRequest, DeleteAclRequest,
    GetPropRequest, PoolCreateRequest, PoolDestroyRequest, PoolEvictRequest, PoolRanksRequest,
};
use crate::cluster::system::{
    SystemCleanupRequest, SystemQueryRequest, SystemStartRequest, SystemStopRequest,
};
use crate::cluster::{ClusterEvent, HostEndpoint, HostRequest, JoinRequest, SystemService};
use crate::controlplane::HostContext;
use crate::domain::{EngineState, FanoutRequest, LogMasks, RankOp, RankSet};
use crate::error::{Error, Result};
use crate::subsystem::{
    AddDeviceRequest, FirmwareQueryRequest, FirmwareUpdateRequest, FormatRequest,
    NetworkScanRequest, RebindRequest, SmdManageRequest, SmdQueryRequest, StorageScanRequest,
};
use axum::{
    body::Bytes,
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Body of the rank lifecycle routes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RankTargetRequest {
    /// Target ranks; empty means every local rank
    #[serde(default)]
    pub ranks: RankSet,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMasksRequest {
    #[serde(default)]
    pub ranks: RankSet,
    #[serde(flatten)]
    pub masks: LogMasks,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectLogRequest {
    #[serde(default)]
    pub ranks: RankSet,
    #[serde(default = "default_log_lines")]
    pub max_lines: usize,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_log_lines() -> usize {
    100
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PropsQuery {
    /// Comma-separated property names
    #[serde(default)]
    pub names: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictResponse {
    pub evicted: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeResponse {
    pub layout_version: u32,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    host: Arc<HostContext>,
    system: Arc<SystemService>,
}

impl RestRouter {
    pub fn new(host: Arc<HostContext>, system: Arc<SystemService>) -> Self {
        Self { host, system }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            host: self.host,
            system: self.system,
        };

        Router::new()
            // Storage
            .route("/v1/storage/scan", post(storage_scan))
            .route("/v1/storage/format", post(storage_format))
            .route("/v1/storage/nvme/rebind", post(storage_rebind))
            .route("/v1/storage/nvme/add-device", post(storage_add_device))
            // Network and firmware
            .route("/v1/network/scan", post(network_scan))
            .route("/v1/firmware/query", post(firmware_query))
            .route("/v1/firmware/update", post(firmware_update))
            // SMD
            .route("/v1/smd/query", post(smd_query))
            .route("/v1/smd/manage", post(smd_manage))
            // Ranks
            .route("/v1/ranks/prep-shutdown", post(ranks_prep_shutdown))
            .route("/v1/ranks/stop", post(ranks_stop))
            .route("/v1/ranks/reset-format", post(ranks_reset_format))
            .route("/v1/ranks/start", post(ranks_start))
            .route("/v1/ranks/query", post(ranks_query))
            .route("/v1/ranks/log-masks", post(ranks_log_masks))
            .route("/v1/ranks/collect-log", post(ranks_collect_log))
            // Aggregator transport
            .route("/v1/host/dispatch", post(host_dispatch))
            // System
            .route("/v1/system/join", post(system_join))
            .route("/v1/system/query", post(system_query))
            .route("/v1/system/stop", post(system_stop))
            .route("/v1/system/start", post(system_start))
            .route("/v1/system/erase", post(system_erase))
            .route("/v1/system/cleanup", post(system_cleanup))
            .route("/v1/system/event", post(system_event))
            .route("/v1/system/leader", get(system_leader))
            .route("/v1/system/attach-info", get(system_attach_info))
            // Pools
            .route("/v1/pools", get(list_pools).post(create_pool))
            .route("/v1/pools/:id", get(query_pool).delete(destroy_pool))
            .route("/v1/pools/:id/evict", post(evict_pool))
            .route("/v1/pools/:id/exclude", post(exclude_ranks))
            .route("/v1/pools/:id/drain", post(drain_ranks))
            .route("/v1/pools/:id/reintegrate", post(reintegrate_ranks))
            .route("/v1/pools/:id/extend", post(extend_pool))
            .route("/v1/pools/:id/upgrade", post(upgrade_pool))
            .route("/v1/pools/:id/connect", post(connect_pool))
            .route("/v1/pools/:id/props", get(get_props).post(set_props))
            .route(
                "/v1/pools/:id/acl",
                get(get_acl).put(overwrite_acl).post(update_acl),
            )
            .route("/v1/pools/:id/acl/:principal", delete(delete_acl))
            .route(
                "/v1/pools/:id/containers",
                get(list_containers).post(create_container),
            )
            .route(
                "/v1/pools/:id/containers/:container/owner",
                post(set_container_owner),
            )
            // Probes
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    host: Arc<HostContext>,
    system: Arc<SystemService>,
}

// =============================================================================
// Response helpers
// =============================================================================

/// Parse a JSON body; an empty body reads as `{}`
fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    let body = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}".as_slice()
    } else {
        body
    };
    serde_json::from_slice(body).map_err(|e| Error::InvalidRequest(e.to_string()))
}

fn respond<T: Serialize>(result: Result<T>) -> Response {
    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(e) => error_response(e),
    }
}

fn status_for(err: &Error) -> StatusCode {
    if err.is_request_error() {
        return StatusCode::BAD_REQUEST;
    }
    match err {
        Error::RankNotFound { .. }
        | Error::DeviceNotFound { .. }
        | Error::HostNotFound { .. }
        | Error::PoolNotFound { .. }
        | Error::ContainerNotFound { .. } => StatusCode::NOT_FOUND,
        Error::RankAlreadyRegistered { .. }
        | Error::RankBusy { .. }
        | Error::DeviceBusy { .. }
        | Error::InvalidTransition { .. }
        | Error::PoolExists { .. }
        | Error::SystemRefused(_) => StatusCode::CONFLICT,
        Error::NotLeader { .. } => StatusCode::MISDIRECTED_REQUEST,
        Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        Error::TransportFailure { .. } => StatusCode::BAD_GATEWAY,
        Error::JsonParse(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_code(err: &Error) -> &'static str {
    match err {
        Error::Internal(_) => "internal",
        Error::Configuration(_) => "configuration",
        Error::InvalidRequest(_) | Error::JsonParse(_) => "invalid_request",
        Error::InvalidRankSet { .. } => "invalid_rank_set",
        Error::MissingParameter(_) => "missing_parameter",
        Error::ConfirmationRequired { .. } => "confirmation_required",
        Error::RankNotFound { .. } => "rank_not_found",
        Error::RankAlreadyRegistered { .. } => "rank_already_registered",
        Error::RankBusy { .. } => "rank_busy",
        Error::InvalidTransition { .. } => "invalid_state",
        Error::EngineFailure { .. } => "engine_failure",
        Error::Timeout { .. } => "timeout",
        Error::DeviceNotFound { .. } => "device_not_found",
        Error::DeviceBusy { .. } => "device_busy",
        Error::DeviceFailure { .. } | Error::NvmeCommand { .. } => "device_failure",
        Error::HardwareDiscovery(_) => "hardware_discovery",
        Error::TransportFailure { .. } | Error::Http(_) => "transport_failure",
        Error::NotLeader { .. } => "not_leader",
        Error::HostNotFound { .. } => "host_not_found",
        Error::PoolNotFound { .. } => "pool_not_found",
        Error::PoolExists { .. } => "pool_exists",
        Error::ContainerNotFound { .. } => "container_not_found",
        Error::SystemRefused(_) => "system_refused",
        Error::YamlParse(_) | Error::Io(_) => "internal",
    }
}

fn error_response(err: Error) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        error!(error = %err, "Request failed");
    } else {
        debug!(error = %err, %status, "Request rejected");
    }

    let details = match &err {
        Error::NotLeader { leader } => Some(leader.clone()),
        _ => None,
    };
    (
        status,
        Json(ApiErrorResponse {
            error: error_code(&err).into(),
            message: err.to_string(),
            details,
        }),
    )
        .into_response()
}

// =============================================================================
// Host handlers
// =============================================================================

async fn storage_scan(State(state): State<AppState>, body: Bytes) -> Response {
    let result = match parse_body::<StorageScanRequest>(&body) {
        Ok(request) => state.host.storage().scan(&request).await,
        Err(e) => Err(e),
    };
    respond(result)
}

async fn storage_format(State(state): State<AppState>, body: Bytes) -> Response {
    let request: FormatRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(e) => return error_response(e),
    };
    info!(devices = request.devices.len(), dry_run = request.flags.dry_run, "Storage format");
    respond(state.host.storage().format(request).await)
}

async fn storage_rebind(State(state): State<AppState>, body: Bytes) -> Response {
    match parse_body::<RebindRequest>(&body) {
        Ok(request) => respond(state.host.storage().rebind(request).await),
        Err(e) => error_response(e),
    }
}

async fn storage_add_device(State(state): State<AppState>, body: Bytes) -> Response {
    match parse_body::<AddDeviceRequest>(&body) {
        Ok(request) => respond(state.host.storage().add_device(request).await),
        Err(e) => error_response(e),
    }
}

async fn network_scan(State(state): State<AppState>, body: Bytes) -> Response {
    match parse_body::<NetworkScanRequest>(&body) {
        Ok(request) => respond(state.host.network().scan(&request).await),
        Err(e) => error_response(e),
    }
}

async fn firmware_query(State(state): State<AppState>, body: Bytes) -> Response {
    match parse_body::<FirmwareQueryRequest>(&body) {
        Ok(request) => respond(state.host.firmware().query(request).await),
        Err(e) => error_response(e),
    }
}

async fn firmware_update(State(state): State<AppState>, body: Bytes) -> Response {
    match parse_body::<FirmwareUpdateRequest>(&body) {
        Ok(request) => respond(state.host.firmware().update(request).await),
        Err(e) => error_response(e),
    }
}

async fn smd_query(State(state): State<AppState>, body: Bytes) -> Response {
    respond(parse_body::<SmdQueryRequest>(&body).map(|request| state.host.smd().query(&request)))
}

async fn smd_manage(State(state): State<AppState>, body: Bytes) -> Response {
    match parse_body::<SmdManageRequest>(&body) {
        Ok(request) => respond(state.host.smd().manage(request).await),
        Err(e) => error_response(e),
    }
}

// =============================================================================
// Rank handlers
// =============================================================================

async fn run_rank_op(state: &AppState, body: &[u8], op: RankOp) -> Response {
    let request: RankTargetRequest = match parse_body(body) {
        Ok(request) => request,
        Err(e) => return error_response(e),
    };
    let fanout = FanoutRequest {
        ranks: request.ranks,
        op,
        force: request.force,
        timeout_ms: request.timeout_ms,
    };
    respond(state.host.coordinator().fanout(fanout).await)
}

async fn ranks_prep_shutdown(State(state): State<AppState>, body: Bytes) -> Response {
    run_rank_op(&state, &body, RankOp::PrepShutdown).await
}

async fn ranks_stop(State(state): State<AppState>, body: Bytes) -> Response {
    run_rank_op(&state, &body, RankOp::Stop).await
}

async fn ranks_reset_format(State(state): State<AppState>, body: Bytes) -> Response {
    run_rank_op(&state, &body, RankOp::ResetFormat).await
}

async fn ranks_start(State(state): State<AppState>, body: Bytes) -> Response {
    run_rank_op(&state, &body, RankOp::Start).await
}

async fn ranks_query(State(state): State<AppState>, body: Bytes) -> Response {
    run_rank_op(&state, &body, RankOp::Query).await
}

async fn ranks_log_masks(State(state): State<AppState>, body: Bytes) -> Response {
    let request: LogMasksRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(e) => return error_response(e),
    };
    let mut fanout = FanoutRequest::new(request.ranks, RankOp::SetLogMasks(request.masks));
    fanout.timeout_ms = request.timeout_ms;
    respond(state.host.coordinator().fanout(fanout).await)
}

async fn ranks_collect_log(State(state): State<AppState>, body: Bytes) -> Response {
    let request: CollectLogRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(e) => return error_response(e),
    };
    let op = RankOp::CollectLog {
        max_lines: request.max_lines,
    };
    let mut fanout = FanoutRequest::new(request.ranks, op);
    fanout.timeout_ms = request.timeout_ms;
    respond(state.host.coordinator().fanout(fanout).await)
}

/// Requests relayed by the leader's aggregator
async fn host_dispatch(State(state): State<AppState>, body: Bytes) -> Response {
    let request: HostRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(e) => return error_response(e),
    };
    debug!(request = request.name(), "Host dispatch");
    respond(state.host.handle(request).await)
}

// =============================================================================
// System handlers
// =============================================================================

async fn system_join(State(state): State<AppState>, body: Bytes) -> Response {
    respond(parse_body::<JoinRequest>(&body).and_then(|request| state.system.join(request)))
}

async fn system_query(State(state): State<AppState>, body: Bytes) -> Response {
    match parse_body::<SystemQueryRequest>(&body) {
        Ok(request) => respond(state.system.query(&request).await),
        Err(e) => error_response(e),
    }
}

async fn system_stop(State(state): State<AppState>, body: Bytes) -> Response {
    match parse_body::<SystemStopRequest>(&body) {
        Ok(request) => respond(state.system.stop(request).await),
        Err(e) => error_response(e),
    }
}

async fn system_start(State(state): State<AppState>, body: Bytes) -> Response {
    match parse_body::<SystemStartRequest>(&body) {
        Ok(request) => respond(state.system.start(request).await),
        Err(e) => error_response(e),
    }
}

async fn system_erase(State(state): State<AppState>) -> Response {
    respond(state.system.erase().await)
}

async fn system_cleanup(State(state): State<AppState>, body: Bytes) -> Response {
    respond(
        parse_body::<SystemCleanupRequest>(&body)
            .and_then(|request| state.system.cleanup(&request)),
    )
}

async fn system_event(State(state): State<AppState>, body: Bytes) -> Response {
    match parse_body::<ClusterEvent>(&body).and_then(|event| state.system.event(event)) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn system_leader(State(state): State<AppState>) -> Response {
    (StatusCode::OK, Json(state.system.leader())).into_response()
}

async fn system_attach_info(State(state): State<AppState>) -> Response {
    respond(state.system.attach_info())
}

// =============================================================================
// Pool handlers
// =============================================================================

async fn list_pools(State(state): State<AppState>) -> Response {
    respond(state.system.pools().list_pools())
}

async fn create_pool(State(state): State<AppState>, body: Bytes) -> Response {
    let request: PoolCreateRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(e) => return error_response(e),
    };
    info!(label = %request.label, "Creating pool");
    match state.system.create_pool(request).await {
        Ok(summary) => (StatusCode::CREATED, Json(summary)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn query_pool(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(state.system.pools().query(&id))
}

async fn destroy_pool(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(request): Query<PoolDestroyRequest>,
) -> Response {
    respond(state.system.pools().destroy(&id, &request))
}

async fn evict_pool(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    respond(
        parse_body::<PoolEvictRequest>(&body)
            .and_then(|request| state.system.pools().evict(&id, &request))
            .map(|evicted| EvictResponse { evicted }),
    )
}

async fn exclude_ranks(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    respond(
        parse_body::<PoolRanksRequest>(&body)
            .and_then(|request| state.system.pools().exclude(&id, &request)),
    )
}

async fn drain_ranks(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    respond(
        parse_body::<PoolRanksRequest>(&body)
            .and_then(|request| state.system.pools().drain(&id, &request)),
    )
}

async fn reintegrate_ranks(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    respond(
        parse_body::<PoolRanksRequest>(&body)
            .and_then(|request| state.system.pools().reintegrate(&id, &request)),
    )
}

async fn extend_pool(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    match parse_body::<PoolRanksRequest>(&body) {
        Ok(request) => respond(state.system.extend_pool(&id, &request).await),
        Err(e) => error_response(e),
    }
}

async fn upgrade_pool(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(
        state
            .system
            .pools()
            .upgrade(&id)
            .map(|layout_version| UpgradeResponse { layout_version }),
    )
}

async fn connect_pool(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    respond(
        parse_body::<ConnectRequest>(&body)
            .and_then(|request| state.system.pools().connect(&id, &request)),
    )
}

async fn get_props(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PropsQuery>,
) -> Response {
    let names = query
        .names
        .map(|names| {
            names
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    respond(state.system.pools().get_prop(&id, &GetPropRequest { names }))
}

async fn set_props(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let result = parse_body::<BTreeMap<String, String>>(&body)
        .and_then(|props| state.system.pools().set_prop(&id, props));
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_acl(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(state.system.pools().get_acl(&id))
}

async fn overwrite_acl(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    respond(
        parse_body::<AclRequest>(&body)
            .and_then(|request| state.system.pools().overwrite_acl(&id, request)),
    )
}

async fn update_acl(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    respond(
        parse_body::<AclRequest>(&body)
            .and_then(|request| state.system.pools().update_acl(&id, request)),
    )
}

async fn delete_acl(
    State(state): State<AppState>,
    Path((id, principal)): Path<(String, String)>,
) -> Response {
    let request = DeleteAclRequest { principal };
    respond(state.system.pools().delete_acl(&id, &request))
}

async fn list_containers(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(state.system.pools().list_containers(&id))
}

async fn create_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    match parse_body::<ContainerCreateRequest>(&body)
        .and_then(|request| state.system.pools().create_container(&id, request))
    {
        Ok(container) => (StatusCode::CREATED, Json(container)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn set_container_owner(
    State(state): State<AppState>,
    Path((id, container)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    respond(
        parse_body::<ContSetOwnerRequest>(&body)
            .and_then(|request| state.system.pools().cont_set_owner(&id, &container, request)),
    )
}

// =============================================================================
// Probes
// =============================================================================

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let errored = state.host.ranks_in(EngineState::Errored);
    if errored.is_empty() {
        (StatusCode::OK, "ready".to_string())
    } else {
        let ranks: RankSet = errored.into_iter().collect();
        (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("ranks errored: {}", ranks),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{HostAggregator, LocalTransport, Membership, StaticLeader};
    use crate::config::ControlConfig;
    use crate::domain::RankFanoutResult;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    const HOST: &str = "127.0.0.1:8090";

    fn app_with_leader(leader: StaticLeader) -> Router {
        let mut config = ControlConfig::default();
        config.simulation.enabled = true;
        let host = HostContext::from_config(&config).unwrap();

        let membership = Arc::new(Membership::new());
        membership
            .join(JoinRequest {
                host: HOST.into(),
                ranks: "0-1".parse().unwrap(),
            })
            .unwrap();
        let aggregator = HostAggregator::new(Arc::new(LocalTransport::new()), Duration::from_secs(5))
            .with_local(HOST, host.clone());
        let system = Arc::new(SystemService::new(membership, aggregator, Arc::new(leader)));
        RestRouter::new(host, system).build()
    }

    fn app() -> Router {
        app_with_leader(StaticLeader::solo(HOST))
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json<T: DeserializeOwned>(response: Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            status_for(&Error::MissingParameter("image_path".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&Error::PoolNotFound { pool: "p".into() }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&Error::NotLeader { leader: "b".into() }),
            StatusCode::MISDIRECTED_REQUEST
        );
        assert_eq!(status_for(&Error::Internal("x".into())), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_empty_body_reads_as_defaults() {
        let request: RankTargetRequest = parse_body(b"").unwrap();
        assert!(request.ranks.is_empty());
        assert!(!request.force);
        assert!(parse_body::<PoolRanksRequest>(b"not json").is_err());
    }

    #[tokio::test]
    async fn test_health() {
        let response = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_rank_start_and_query() {
        let app = app();
        let response = app
            .clone()
            .oneshot(post_json("/v1/ranks/start", r#"{"ranks": "0-1"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let result: RankFanoutResult = body_json(response).await;
        assert!(result.all_succeeded());

        let response = app.oneshot(post_json("/v1/ranks/query", "")).await.unwrap();
        let result: RankFanoutResult = body_json(response).await;
        assert_eq!(result.len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_rank_set_is_bad_request() {
        let response = app()
            .oneshot(post_json("/v1/ranks/stop", r#"{"ranks": "3-1"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let error: ApiErrorResponse = body_json(response).await;
        assert_eq!(error.error, "invalid_request");
    }

    #[tokio::test]
    async fn test_unknown_rank_is_per_target_failure() {
        let response = app()
            .oneshot(post_json("/v1/ranks/query", r#"{"ranks": "7"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let result: RankFanoutResult = body_json(response).await;
        assert_eq!(result.failed_targets().len(), 1);
    }

    #[tokio::test]
    async fn test_format_requires_confirmation() {
        let response = app()
            .oneshot(post_json("/v1/storage/format", r#"{"devices": []}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let error: ApiErrorResponse = body_json(response).await;
        assert_eq!(error.error, "confirmation_required");
    }

    #[tokio::test]
    async fn test_pool_lifecycle() {
        let app = app();
        app.clone()
            .oneshot(post_json("/v1/system/start", "{}"))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(post_json("/v1/pools", r#"{"label": "tank"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .clone()
            .oneshot(post_json("/v1/pools/tank/containers", r#"{"label": "c1"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .clone()
            .oneshot(Request::get("/v1/pools").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let pools: Vec<crate::cluster::PoolSummary> = body_json(response).await;
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].containers, 1);

        let response = app
            .oneshot(
                Request::delete("/v1/pools/missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_follower_refuses_system_query() {
        let app = app_with_leader(StaticLeader::new(HOST, vec!["10.0.0.9:8090".into()]));
        let response = app
            .oneshot(post_json("/v1/system/query", "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::MISDIRECTED_REQUEST);
        let error: ApiErrorResponse = body_json(response).await;
        assert_eq!(error.details.as_deref(), Some("10.0.0.9:8090"));
    }

    #[tokio::test]
    async fn test_host_dispatch_endpoint() {
        let request = HostRequest::Ranks(FanoutRequest::all(RankOp::Query));
        let response = app()
            .oneshot(post_json(
                "/v1/host/dispatch",
                &serde_json::to_string(&request).unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response: crate::cluster::HostResponse = body_json(response).await;
        assert!(matches!(response, crate::cluster::HostResponse::Ranks(r) if r.len() == 2));
    }
}
