use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json,
    Router,
};
use orchestrator::{JobLog, UpdateOrchestrator};
use state_store::{events::DockerLogEvent, ClusterState};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;

use crate::{
    http_objects::{
        ContainerResponse,
        DockerEventRequest,
        HeartbeatRequest,
        JobResponse,
        NodeResponse,
        UpdateJobRequest,
    },
    node_manager::NodeManager,
};

#[derive(OpenApi)]
#[openapi(
    paths(list_nodes, heartbeat, list_containers, ingest_docker_event, run_update_job),
    components(schemas(
        crate::http_objects::NodeResponse,
        crate::http_objects::NodeHealthReport,
        crate::http_objects::HeartbeatRequest,
        crate::http_objects::ContainerResponse,
        crate::http_objects::DockerEventRequest,
        crate::http_objects::UpdateStrategyRequest,
        crate::http_objects::UpdateJobRequest,
        crate::http_objects::JobResponse,
    ))
)]
struct ApiDoc;

#[derive(Clone)]
pub struct RouteState {
    pub cluster_state: Arc<ClusterState>,
    pub node_manager: Arc<NodeManager>,
    pub orchestrator: Arc<UpdateOrchestrator>,
}

pub struct ApiError(anyhow::Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", self.0)).into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

pub fn create_routes(route_state: RouteState) -> Router {
    Router::new()
        .route("/nodes", get(list_nodes))
        .route("/nodes/{name}/heartbeat", post(heartbeat))
        .route("/containers", get(list_containers))
        .route("/events/docker", post(ingest_docker_event))
        .route("/jobs/update", post(run_update_job))
        .route(
            "/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        )
        .with_state(route_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[utoipa::path(get, path = "/nodes", responses((status = 200, body = Vec<NodeResponse>)))]
async fn list_nodes(State(state): State<RouteState>) -> Result<Json<Vec<NodeResponse>>, ApiError> {
    let nodes = state.cluster_state.nodes.list_nodes().await?;
    Ok(Json(nodes.into_iter().map(NodeResponse::from).collect()))
}

#[utoipa::path(
    post,
    path = "/nodes/{name}/heartbeat",
    request_body = HeartbeatRequest,
    responses((status = 200))
)]
async fn heartbeat(
    State(state): State<RouteState>,
    Path(name): Path<String>,
    Json(request): Json<HeartbeatRequest>,
) -> Result<StatusCode, ApiError> {
    let (ttl_secs, update) = request.into_update();
    state.node_manager.heartbeat(&name, ttl_secs, update).await?;
    Ok(StatusCode::OK)
}

#[utoipa::path(get, path = "/containers", responses((status = 200, body = Vec<ContainerResponse>)))]
async fn list_containers(
    State(state): State<RouteState>,
) -> Result<Json<Vec<ContainerResponse>>, ApiError> {
    let containers = state.cluster_state.containers.list();
    Ok(Json(
        containers.into_iter().map(ContainerResponse::from).collect(),
    ))
}

#[utoipa::path(
    post,
    path = "/events/docker",
    request_body = DockerEventRequest,
    responses((status = 202))
)]
async fn ingest_docker_event(
    State(state): State<RouteState>,
    Json(request): Json<DockerEventRequest>,
) -> StatusCode {
    state.cluster_state.bus.publish_docker_log(DockerLogEvent {
        node: request.node,
        container_id: request.container_id,
        status: request.status,
    });
    StatusCode::ACCEPTED
}

#[utoipa::path(
    post,
    path = "/jobs/update",
    request_body = UpdateJobRequest,
    responses((status = 200, body = JobResponse))
)]
async fn run_update_job(
    State(state): State<RouteState>,
    Json(request): Json<UpdateJobRequest>,
) -> Result<Json<JobResponse>, ApiError> {
    let params = request.into_params();
    let log = JobLog::new();
    let result = state.orchestrator.run(&params, &log).await;
    Ok(Json(JobResponse {
        job_id: log.id().to_string(),
        success: result.is_ok(),
        log: log.entries(),
    }))
}
