//! HTTP surface
//!
//! `POST` a [`ToolRequest`] to run a tool buffered (`/run`), streamed as SSE
//! (`/run/stream`), or streamed together with its event channel
//! (`/run/stream-events`).

mod error;
mod sse;

pub use error::ApiError;
pub use sse::sse_response;

use axum::{
    extract::{rejection::JsonRejection, State},
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::app::ServerConfig;
use crate::subprocess::{ProcessError, ToolRequest, ToolRequestBuilder, ToolRunner};

/// API server running tools through a [`ToolRunner`]
pub struct ApiServer {
    runner: Arc<dyn ToolRunner>,
    config: ServerConfig,
}

/// Shared API state
struct ApiState {
    runner: Arc<dyn ToolRunner>,
    config: ServerConfig,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct RunResponse {
    stdout: String,
}

impl ApiServer {
    pub fn new(runner: Arc<dyn ToolRunner>, config: ServerConfig) -> Self {
        Self { runner, config }
    }

    /// Bind the configured address and serve until the process exits.
    pub async fn start(self) -> crate::Result<()> {
        let listener = TcpListener::bind(self.config.listen).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> crate::Result<()> {
        info!("Starting toolstream API server on {}", listener.local_addr()?);

        let app = self.build_router();
        axum::serve(listener, app).await?;

        Ok(())
    }

    pub fn build_router(self) -> Router {
        let shared_state = Arc::new(ApiState {
            runner: self.runner,
            config: self.config,
        });

        Router::new()
            .route("/healthz", get(health_check))
            .route("/run", post(run_tool))
            .route("/run/stream", post(run_tool_stream))
            .route("/run/stream-events", post(run_tool_stream_events))
            .layer(TraceLayer::new_for_http())
            .with_state(shared_state)
    }
}

impl ApiState {
    /// Validate a request body against the server policy and fill defaults.
    fn prepare(
        &self,
        payload: Result<Json<ToolRequest>, JsonRejection>,
    ) -> Result<ToolRequest, ApiError> {
        let Json(request) = payload?;

        if !self.config.allows(&request.program) {
            warn!("Rejected request for disallowed program {:?}", request.program);
            return Err(ApiError::forbidden_program(&request.program));
        }

        Ok(ToolRequestBuilder::from(request)
            .default_timeout(self.config.default_timeout)
            .build())
    }
}

// API Handlers

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn run_tool(
    State(state): State<Arc<ApiState>>,
    payload: Result<Json<ToolRequest>, JsonRejection>,
) -> Result<Json<RunResponse>, ApiError> {
    let request = state.prepare(payload)?;
    let output = state.runner.run(request).await.map_err(|e| {
        warn!("Failed to execute tool: {}", e);
        ApiError::execution(e)
    })?;

    if !output.status.success() {
        let err = ProcessError::ExitCode {
            code: output.status.code().unwrap_or(-1),
            stderr: output.stderr,
        };
        warn!("Failed to execute tool: {}", err);
        return Err(ApiError::execution(err));
    }

    Ok(Json(RunResponse {
        stdout: output.stdout,
    }))
}

async fn run_tool_stream(
    State(state): State<Arc<ApiState>>,
    payload: Result<Json<ToolRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let request = state.prepare(payload)?;
    let execution = state
        .runner
        .stream(request)
        .await
        .map_err(ApiError::execution)?;

    Ok(sse_response(&state.config.streaming, execution))
}

async fn run_tool_stream_events(
    State(state): State<Arc<ApiState>>,
    payload: Result<Json<ToolRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let request = state.prepare(payload)?;
    let execution = state
        .runner
        .stream_with_events(request)
        .await
        .map_err(ApiError::execution)?;

    Ok(sse_response(&state.config.streaming, execution))
}
