use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::FleetError;
use crate::fleet::{FleetManager, Heartbeat, NodeFilter, RegisterNode};
use crate::registry::NodeSummary;
use crate::routing::{RouteOutcome, TaskCompletion, TaskRequest};

const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    code: &'static str,
    error: String,
}

/// HTTP status for an error code.
fn status_for(error: &FleetError) -> StatusCode {
    match error {
        FleetError::InvalidRegistration(_) | FleetError::Config(_) => StatusCode::BAD_REQUEST,
        FleetError::NodeUnknown(_) => StatusCode::NOT_FOUND,
        FleetError::InvalidTransition { .. } => StatusCode::CONFLICT,
        FleetError::NoEligibleNodes { .. } => StatusCode::SERVICE_UNAVAILABLE,
        FleetError::DispatchFailed { .. } | FleetError::Transport(_) | FleetError::Http(_) => {
            StatusCode::BAD_GATEWAY
        }
    }
}

struct ApiError(FleetError);

impl From<FleetError> for ApiError {
    fn from(error: FleetError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            status_for(&self.0),
            Json(ErrorResponse {
                success: false,
                code: self.0.code(),
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

#[derive(Serialize)]
struct NodeListResponse {
    nodes: Vec<NodeSummary>,
    total: usize,
}

#[derive(Serialize)]
struct RemoveNodeResponse {
    success: bool,
    node: NodeSummary,
}

#[derive(Serialize)]
struct CompletionResponse {
    success: bool,
    recorded: bool,
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

/// Routes of the cluster API, without a listener.
pub fn router(fleet: Arc<FleetManager>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/cluster/state", get(cluster_state_handler))
        .route("/api/cluster/nodes", get(list_nodes_handler))
        .route("/api/cluster/nodes/register", post(register_handler))
        .route("/api/cluster/nodes/heartbeat", post(heartbeat_handler))
        .route(
            "/api/cluster/nodes/{node_id}",
            get(get_node_handler).delete(remove_node_handler),
        )
        .route("/api/cluster/tasks/route", post(route_task_handler))
        .route("/api/cluster/tasks/complete", post(complete_task_handler))
        .route("/api/cluster/tasks/history", get(history_handler))
        .route(
            "/api/cluster/capabilities/{task_type}",
            get(capabilities_handler),
        )
        .layer(cors)
        .with_state(fleet)
}

/// Serve the API on `addr` until `shutdown` is cancelled.
pub async fn run_api(
    addr: SocketAddr,
    fleet: Arc<FleetManager>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = router(fleet);

    tracing::info!(addr = %addr, "Starting cluster API server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind cluster API server");
            return Err(e);
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .inspect_err(|e| tracing::error!(error = %e, "Cluster API server failed"))
}

async fn cluster_state_handler(State(fleet): State<Arc<FleetManager>>) -> impl IntoResponse {
    Json(fleet.cluster_state().await)
}

async fn list_nodes_handler(
    State(fleet): State<Arc<FleetManager>>,
    Query(filter): Query<NodeFilter>,
) -> impl IntoResponse {
    let nodes = fleet.list_nodes(&filter).await;
    Json(NodeListResponse {
        total: nodes.len(),
        nodes,
    })
}

async fn register_handler(
    State(fleet): State<Arc<FleetManager>>,
    Json(request): Json<RegisterNode>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(fleet.register(request).await?))
}

async fn heartbeat_handler(
    State(fleet): State<Arc<FleetManager>>,
    Json(heartbeat): Json<Heartbeat>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(fleet.heartbeat(heartbeat).await?))
}

async fn get_node_handler(
    State(fleet): State<Arc<FleetManager>>,
    Path(node_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    fleet
        .get_node(&node_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError(FleetError::NodeUnknown(node_id)))
}

async fn remove_node_handler(
    State(fleet): State<Arc<FleetManager>>,
    Path(node_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let node = fleet.remove_node(&node_id).await?;
    Ok(Json(RemoveNodeResponse {
        success: true,
        node,
    }))
}

async fn route_task_handler(
    State(fleet): State<Arc<FleetManager>>,
    Json(mut task): Json<TaskRequest>,
) -> impl IntoResponse {
    task.ensure_id();
    let task_id = task.id.clone();
    let result = fleet.route_task(task).await;
    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err(e) => status_for(e),
    };
    (status, Json(RouteOutcome::from_result(&task_id, &result)))
}

async fn complete_task_handler(
    State(fleet): State<Arc<FleetManager>>,
    Json(completion): Json<TaskCompletion>,
) -> Result<impl IntoResponse, ApiError> {
    let recorded = fleet.report_completion(completion).await?;
    Ok(Json(CompletionResponse {
        success: true,
        recorded,
    }))
}

async fn history_handler(
    State(fleet): State<Arc<FleetManager>>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    Json(fleet.task_history(limit).await)
}

async fn capabilities_handler(
    State(fleet): State<Arc<FleetManager>>,
    Path(task_type): Path<String>,
) -> impl IntoResponse {
    Json(fleet.can_handle_task(&task_type).await)
}
