//! HTTP API
//!
//! Routes under `/api/v0`:
//! - Hosts: list, create (explicit or from the peer address), get, delete,
//!   credentials, status
//! - Clusters: list, create, get, delete, host membership
//! - Cluster operations: restart, upgrade, deploy
//! - Networks: list, create, get, delete
//! - Status: store, investigator and watcher health

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::model::{ClusterCommand, ClusterType, Record};
use crate::service::{
    HostCreation, HostListUpdate, HostRequest, HostService, NetworkRequest, ServiceError,
};

/// Shared state for the API handlers
#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<HostService>,
}

impl ApiState {
    pub fn new(service: HostService) -> Self {
        Self {
            service: Arc::new(service),
        }
    }
}

/// Create the API router
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        // Status
        .route("/api/v0/status", get(system_status))
        // Hosts
        .route("/api/v0/hosts", get(list_hosts))
        .route("/api/v0/host", axum::routing::put(create_implicit_host))
        .route(
            "/api/v0/host/{address}",
            get(get_host).put(create_host).delete(delete_host),
        )
        .route("/api/v0/host/{address}/creds", get(host_creds))
        .route("/api/v0/host/{address}/status", get(host_status))
        // Clusters
        .route("/api/v0/clusters", get(list_clusters))
        .route(
            "/api/v0/cluster/{name}",
            get(get_cluster).put(create_cluster).delete(delete_cluster),
        )
        .route(
            "/api/v0/cluster/{name}/hosts",
            get(cluster_hosts).put(replace_cluster_hosts),
        )
        .route(
            "/api/v0/cluster/{name}/hosts/{address}",
            get(cluster_member)
                .put(add_cluster_host)
                .delete(remove_cluster_host),
        )
        // Cluster operations
        .route(
            "/api/v0/cluster/{name}/{command}",
            get(get_cluster_operation).put(start_cluster_operation),
        )
        // Networks
        .route("/api/v0/networks", get(list_networks))
        .route(
            "/api/v0/network/{name}",
            get(get_network).put(create_network).delete(delete_network),
        )
        // Health check
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Errors
// ============================================================================

impl ServiceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Validation(_) | ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::Store(_)
            | ServiceError::Investigator(_)
            | ServiceError::ContainerManager(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        debug!("Request failed with {}: {}", status, self);
        let body = match &self {
            ServiceError::Validation(v) => json!({
                "error": self.to_string(),
                "fields": v.fields(),
            }),
            _ => json!({ "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

fn bad_request(rejection: JsonRejection) -> ServiceError {
    ServiceError::BadRequest(rejection.body_text())
}

// ============================================================================
// Health & Status
// ============================================================================

async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

async fn system_status(State(state): State<ApiState>) -> impl IntoResponse {
    let status = state.service.system_status().await;
    let code = if status.store.is_ok() && status.investigator.is_ok() && status.watcher.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status))
}

// ============================================================================
// Hosts
// ============================================================================

async fn list_hosts(State(state): State<ApiState>) -> Result<Json<Vec<Value>>, ServiceError> {
    let hosts = state.service.list_hosts().await?;
    Ok(Json(hosts.iter().map(|h| h.to_json(false)).collect()))
}

async fn get_host(
    State(state): State<ApiState>,
    Path(address): Path<String>,
) -> Result<Json<Value>, ServiceError> {
    Ok(Json(state.service.get_host(&address).await?.to_json(false)))
}

async fn create_host(
    State(state): State<ApiState>,
    Path(address): Path<String>,
    body: Result<Json<HostRequest>, JsonRejection>,
) -> Result<Response, ServiceError> {
    let Json(request) = body.map_err(bad_request)?;
    submit_host(&state, &address, request).await
}

/// Create a host whose address is the peer address of the request
async fn create_implicit_host(
    State(state): State<ApiState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Result<Json<HostRequest>, JsonRejection>,
) -> Result<Response, ServiceError> {
    let Json(request) = body.map_err(bad_request)?;
    let address = peer.ip().to_string();
    info!("Implicit host registration from {}", address);
    submit_host(&state, &address, request).await
}

async fn submit_host(
    state: &ApiState,
    address: &str,
    request: HostRequest,
) -> Result<Response, ServiceError> {
    let response = match state.service.create_host(address, request).await? {
        HostCreation::Existing(host) => (StatusCode::OK, Json(host.to_json(false))),
        HostCreation::Submitted(host) => (StatusCode::CREATED, Json(host.to_json(false))),
    };
    Ok(response.into_response())
}

async fn delete_host(
    State(state): State<ApiState>,
    Path(address): Path<String>,
) -> Result<Json<Value>, ServiceError> {
    state.service.delete_host(&address).await?;
    Ok(Json(json!({})))
}

async fn host_creds(
    State(state): State<ApiState>,
    Path(address): Path<String>,
) -> Result<Json<Value>, ServiceError> {
    Ok(Json(state.service.host_creds(&address).await?))
}

#[derive(Debug, Default, Deserialize)]
struct StatusParams {
    #[serde(default)]
    raw: bool,
}

async fn host_status(
    State(state): State<ApiState>,
    Path(address): Path<String>,
    Query(params): Query<StatusParams>,
) -> Result<Response, ServiceError> {
    let (code, body) = state.service.host_status(&address, params.raw).await?;
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    Ok((status, Json(body)).into_response())
}

// ============================================================================
// Clusters
// ============================================================================

async fn list_clusters(State(state): State<ApiState>) -> Result<Json<Vec<String>>, ServiceError> {
    Ok(Json(state.service.list_clusters().await?))
}

async fn get_cluster(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Response, ServiceError> {
    Ok(Json(state.service.get_cluster(&name).await?).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct ClusterRequest {
    #[serde(rename = "type", default)]
    cluster_type: ClusterType,

    #[serde(default)]
    network: Option<String>,
}

async fn create_cluster(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    body: Option<Json<ClusterRequest>>,
) -> Result<Response, ServiceError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let cluster = state
        .service
        .create_cluster(&name, request.cluster_type, request.network.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(cluster.to_json(false))).into_response())
}

async fn delete_cluster(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ServiceError> {
    state.service.delete_cluster(&name).await?;
    Ok(Json(json!({})))
}

async fn cluster_hosts(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<Vec<String>>, ServiceError> {
    Ok(Json(state.service.cluster_hosts(&name).await?))
}

async fn replace_cluster_hosts(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    body: Result<Json<HostListUpdate>, JsonRejection>,
) -> Result<Json<Value>, ServiceError> {
    let Json(update) = body.map_err(bad_request)?;
    state.service.replace_cluster_hosts(&name, update).await?;
    Ok(Json(json!({})))
}

async fn cluster_member(
    State(state): State<ApiState>,
    Path((name, address)): Path<(String, String)>,
) -> Result<Json<Value>, ServiceError> {
    state.service.cluster_member(&name, &address).await?;
    Ok(Json(json!({})))
}

async fn add_cluster_host(
    State(state): State<ApiState>,
    Path((name, address)): Path<(String, String)>,
) -> Result<Json<Value>, ServiceError> {
    state.service.add_cluster_host(&name, &address).await?;
    Ok(Json(json!({})))
}

async fn remove_cluster_host(
    State(state): State<ApiState>,
    Path((name, address)): Path<(String, String)>,
) -> Result<Json<Value>, ServiceError> {
    state.service.remove_cluster_host(&name, &address).await?;
    Ok(Json(json!({})))
}

// ============================================================================
// Networks
// ============================================================================

async fn list_networks(State(state): State<ApiState>) -> Result<Json<Vec<String>>, ServiceError> {
    Ok(Json(state.service.list_networks().await?))
}

async fn get_network(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ServiceError> {
    Ok(Json(state.service.get_network(&name).await?.to_json(false)))
}

async fn create_network(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    body: Result<Json<NetworkRequest>, JsonRejection>,
) -> Result<Response, ServiceError> {
    let Json(request) = body.map_err(bad_request)?;
    let network = state.service.create_network(&name, request).await?;
    Ok((StatusCode::CREATED, Json(network.to_json(false))).into_response())
}

async fn delete_network(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ServiceError> {
    state.service.delete_network(&name).await?;
    Ok(Json(json!({})))
}

// ============================================================================
// Cluster operations
// ============================================================================

fn parse_command(command: &str) -> Result<ClusterCommand, ServiceError> {
    command.parse().map_err(ServiceError::NotFound)
}

#[derive(Debug, Default, Deserialize)]
struct OperationRequest {
    #[serde(default)]
    version: Option<String>,
}

async fn start_cluster_operation(
    State(state): State<ApiState>,
    Path((name, command)): Path<(String, String)>,
    body: Option<Json<OperationRequest>>,
) -> Result<Response, ServiceError> {
    let command = parse_command(&command)?;
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let operation = state
        .service
        .start_cluster_operation(&name, command, request.version)
        .await?;
    Ok((StatusCode::CREATED, Json(operation)).into_response())
}

async fn get_cluster_operation(
    State(state): State<ApiState>,
    Path((name, command)): Path<(String, String)>,
) -> Result<Response, ServiceError> {
    let command = parse_command(&command)?;
    let operation = state.service.get_cluster_operation(&name, command).await?;
    Ok(Json(operation).into_response())
}
