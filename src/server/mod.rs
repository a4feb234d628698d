//! HTTP service for drawing and document analysis.
//!
//! | Route | Input | Output |
//! |-------|-------|--------|
//! | `GET /health` | | `{status, version}` |
//! | `POST /api/analyze-drawing` | multipart `file`, `model`, `fileType`, `gridSize`, `pageNumber` | `{result: CombinedGridResult}` |
//! | `POST /api/construction/analyze` | multipart `file` | `text/markdown` |
//! | `POST /api/construction/gemini-analyze` | `{content, systemPrompt}` | `text/event-stream`, one event per fragment |
//! | `POST /api/construction/pipeline` | multipart `file`, `systemPrompt` | `text/event-stream` of named pipeline events |
//!
//! Failures are `{"error": "…"}` with the status from
//! [`AnalysisError::status_code`](crate::error::AnalysisError::status_code).

mod handlers;

use crate::config::AnalysisConfig;
use crate::document::{DocumentBackend, HttpBackend};
use crate::pipeline::llm::VisionModel;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub use handlers::*;

/// State shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Defaults for every request; per-request form fields override a copy.
    pub config: Arc<AnalysisConfig>,
    /// Fixed vision model. When `None`, one is resolved per request from
    /// `config` and the form's `model` field.
    pub vision: Option<Arc<dyn VisionModel>>,
    /// Converter and structured-analysis collaborators.
    pub backend: Arc<dyn DocumentBackend>,
}

impl AppState {
    pub fn new(config: AnalysisConfig) -> Self {
        let backend: Arc<dyn DocumentBackend> = Arc::new(HttpBackend::new(config.clone()));
        Self {
            config: Arc::new(config),
            vision: None,
            backend,
        }
    }

    /// Use one vision model for every grid request.
    pub fn with_vision_model(mut self, model: Arc<dyn VisionModel>) -> Self {
        self.vision = Some(model);
        self
    }

    /// Replace the document collaborators.
    pub fn with_backend(mut self, backend: Arc<dyn DocumentBackend>) -> Self {
        self.backend = backend;
        self
    }
}

/// Build the router with all endpoints.
pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config.max_upload_bytes;
    Router::new()
        .route("/health", get(health_check))
        .route("/api/analyze-drawing", post(analyze_drawing))
        .route("/api/construction/analyze", post(construction_analyze))
        .route("/api/construction/gemini-analyze", post(gemini_analyze))
        .route("/api/construction/pipeline", post(construction_pipeline))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `addr` and serve until the process exits.
pub async fn start_server(addr: &str, state: AppState) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, build_router(state)).await
}
