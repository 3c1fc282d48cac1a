use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::env;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

use crate::error::ControlError;
use crate::orchestrator::Orchestrator;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(orch: Orchestrator) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/decide", post(api_decide))
        .route("/api/decisions", get(api_decisions))
        .route("/api/query", post(api_query))
        .route("/api/stage", post(api_stage))
        .route("/api/kill-switch", post(api_kill))
        .route("/api/kill-switch/reset", post(api_kill_reset))
        .with_state(orch)
}

/// Maps domain errors onto HTTP status codes.
struct ApiError(ControlError);

impl From<ControlError> for ApiError {
    fn from(e: ControlError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ControlError::SafetyViolation(_) => StatusCode::CONFLICT,
            ControlError::MalformedData(_) => StatusCode::BAD_REQUEST,
            ControlError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ControlError::HardwareUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ControlError::Other(_) => StatusCode::BAD_GATEWAY,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[derive(Deserialize)]
struct DecisionsParams {
    #[serde(default = "default_decision_limit")]
    limit: u32,
}

fn default_decision_limit() -> u32 {
    20
}

#[derive(Deserialize)]
struct QueryBody {
    query: String,
    #[serde(default)]
    context: Option<String>,
}

#[derive(Deserialize)]
struct StageBody {
    stage: String,
}

#[derive(Deserialize)]
struct KillBody {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct ResetBody {
    token: String,
}

async fn api_status(State(orch): State<Orchestrator>) -> impl IntoResponse {
    Json(orch.get_status().await)
}

async fn api_decide(State(orch): State<Orchestrator>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(orch.force_ai_decision().await?))
}

async fn api_decisions(
    State(orch): State<Orchestrator>,
    Query(params): Query<DecisionsParams>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(orch.recent_decisions(params.limit.min(200)).await?))
}

async fn api_query(
    State(orch): State<Orchestrator>,
    Json(body): Json<QueryBody>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(orch.handle_interactive_query(&body.query, body.context).await?))
}

async fn api_stage(
    State(orch): State<Orchestrator>,
    Json(body): Json<StageBody>,
) -> Result<impl IntoResponse, ApiError> {
    orch.set_growth_stage(&body.stage).await?;
    Ok(Json(json!({ "growth_stage": orch.guardian().growth_stage() })))
}

async fn api_kill(State(orch): State<Orchestrator>, Json(body): Json<KillBody>) -> impl IntoResponse {
    let reason = body.reason.unwrap_or_else(|| "operator request".into());
    orch.activate_kill_switch(&reason).await;
    Json(json!({ "kill_switch": true, "reason": reason }))
}

async fn api_kill_reset(State(orch): State<Orchestrator>, Json(body): Json<ResetBody>) -> Response {
    if orch.reset_kill_switch(&body.token).await {
        Json(json!({ "kill_switch": false })).into_response()
    } else {
        (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "confirmation token rejected" })),
        )
            .into_response()
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(orch: Orchestrator) -> Result<()> {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "http api listening");

    axum::serve(listener, router(orch))
        .await
        .context("web server error")
}
