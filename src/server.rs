use crate::error::IngestError;
use crate::http::parse_response;
use crate::loader::GraphLoader;
use crate::settings::Settings;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub loader: Arc<GraphLoader>,
}

#[derive(Debug, Deserialize)]
pub struct AnalyzePayload {
    pub request: String,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AnalyzeResponse {
    pub status: &'static str,
    pub nodes_created: usize,
    pub relationships_created: usize,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
pub struct ApiError(IngestError);

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            IngestError::Parse(_) | IngestError::Mapping(_) => StatusCode::BAD_REQUEST,
            IngestError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            IngestError::RuleLoad(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/analyze", post(analyze))
        .route("/stats", get(stats))
        .route("/clear", post(clear))
        .with_state(state)
}

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Receive one intercepted request/response pair from the proxy
/// extension and load the request into the graph.
pub async fn analyze(
    State(state): State<AppState>,
    Json(payload): Json<AnalyzePayload>,
) -> Result<Json<AnalyzeResponse>, ApiError> {
    // The response is validated when present; only requests feed the
    // rule pipeline.
    if let Some(raw_response) = &payload.response {
        if let Err(e) = parse_response(raw_response) {
            log::warn!("Discarding unparsable response: {e}");
        }
    }

    let timestamp = payload.timestamp.as_deref().unwrap_or("");
    let result = state.loader.ingest(&payload.request, timestamp).await?;

    Ok(Json(AnalyzeResponse {
        status: "loaded",
        nodes_created: result.nodes_created,
        relationships_created: result.relationships_created,
    }))
}

pub async fn stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let stats = state.loader.statistics().await?;
    Ok(Json(stats))
}

pub async fn clear(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    state.loader.clear_graph().await?;
    Ok(Json(serde_json::json!({ "status": "cleared" })))
}

pub async fn run(settings: &Settings, loader: Arc<GraphLoader>) -> anyhow::Result<()> {
    let app = router(AppState { loader });
    let addr = settings.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("Listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("Shutting down");
        })
        .await?;
    Ok(())
}
