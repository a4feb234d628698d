//! HTTP request handlers.

use crate::config::MAX_GRID_SIZE;
use crate::document::analyze_document_stream_with;
use crate::error::AnalysisError;
use crate::events::PipelineEvent;
use crate::grid;
use crate::pipeline::input::SourceDocument;
use crate::pipeline::llm::{self, VisionModel};
use crate::pipeline::markdown::MarkdownOutput;
use crate::prompts::DEFAULT_ANALYSIS_DIRECTIVE;
use axum::{
    body::Body,
    extract::{
        multipart::MultipartRejection,
        rejection::JsonRejection,
        Multipart, State,
    },
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::AppState;

const DEFAULT_GRID_SIZE: u32 = 2;

// ── Error response ───────────────────────────────────────────────────────────

/// `{"error": "…"}` with a status reflecting the failure class.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<AnalysisError> for ApiError {
    fn from(e: AnalysisError) -> Self {
        let status =
            StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!("Request failed: {}", e);
        } else {
            warn!("Request rejected: {}", e);
        }
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<axum::extract::multipart::MultipartError> for ApiError {
    fn from(e: axum::extract::multipart::MultipartError) -> Self {
        Self {
            status: e.status(),
            message: e.body_text(),
        }
    }
}

/// Body extractors reject with plain text; keep the `{error}` shape instead.
impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        warn!("Rejected JSON body: {}", e.body_text());
        Self {
            status: e.status(),
            message: e.body_text(),
        }
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(e: MultipartRejection) -> Self {
        warn!("Rejected multipart body: {}", e.body_text());
        Self {
            status: e.status(),
            message: e.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

// ── Form parsing ─────────────────────────────────────────────────────────────

/// An uploaded file part.
struct Upload {
    name: String,
    bytes: Vec<u8>,
    content_type: Option<String>,
}

/// Multipart body: the `file` part plus every text field by name.
struct UploadForm {
    file: Option<Upload>,
    fields: HashMap<String, String>,
}

impl UploadForm {
    async fn read(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut form = UploadForm {
            file: None,
            fields: HashMap::new(),
        };
        while let Some(field) = multipart.next_field().await? {
            let name = field.name().unwrap_or_default().to_string();
            if name == "file" {
                let file_name = field.file_name().unwrap_or("upload").to_string();
                let content_type = field.content_type().map(str::to_string);
                let bytes = field.bytes().await?;
                if !bytes.is_empty() {
                    form.file = Some(Upload {
                        name: file_name,
                        bytes: bytes.to_vec(),
                        content_type,
                    });
                }
            } else {
                let text = field.text().await?;
                form.fields.insert(name, text);
            }
        }
        Ok(form)
    }

    fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }

    /// The uploaded document; `hint_field` names the form field carrying an
    /// explicit file type.
    fn document(&mut self, hint_field: Option<&str>) -> Result<SourceDocument, AnalysisError> {
        let hint = hint_field.and_then(|f| self.field(f)).map(str::to_string);
        let upload = self.file.take().ok_or_else(|| AnalysisError::MissingField {
            field: "file".to_string(),
        })?;
        let hint = hint.or(upload.content_type);
        Ok(SourceDocument::from_bytes(
            upload.name,
            upload.bytes,
            hint.as_deref(),
        ))
    }
}

/// `gridSize` form value; anything absent or outside `1..=8` falls back to 2.
pub fn parse_grid_size(raw: Option<&str>) -> u32 {
    raw.and_then(|s| s.trim().parse::<u32>().ok())
        .filter(|g| (1..=MAX_GRID_SIZE).contains(g))
        .unwrap_or(DEFAULT_GRID_SIZE)
}

/// `pageNumber` form value; absent or unparseable means page 1.
///
/// An explicit `0` is kept so page validation can reject it.
pub fn parse_page_number(raw: Option<&str>) -> usize {
    raw.and_then(|s| s.trim().parse::<usize>().ok()).unwrap_or(1)
}

// ── Handlers ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Tiled analysis of one drawing.
pub async fn analyze_drawing(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let mut form = UploadForm::read(multipart?).await?;
    let doc = form.document(Some("fileType"))?;

    let mut config = (*state.config).clone();
    config.grid_size = parse_grid_size(form.field("gridSize"));
    config.page_number = parse_page_number(form.field("pageNumber"));
    let model = vision_model_for(&state, form.field("model"))?;

    info!(
        "analyze-drawing: {} ({} bytes, {:?}), grid {}, page {}",
        doc.name,
        doc.bytes.len(),
        doc.kind,
        config.grid_size,
        config.page_number
    );

    let result = grid::analyze_drawing_with(model, &doc, &config, None).await?;
    Ok(Json(json!({ "result": result })))
}

fn vision_model_for(
    state: &AppState,
    model: Option<&str>,
) -> Result<Arc<dyn VisionModel>, AnalysisError> {
    if let Some(ref fixed) = state.vision {
        return Ok(Arc::clone(fixed));
    }
    let mut config = (*state.config).clone();
    if let Some(model) = model {
        config.model = Some(model.to_string());
    }
    llm::vision_model(&config)
}

/// Document → markdown through the converter, relayed as `text/markdown`.
pub async fn construction_analyze(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    let mut form = UploadForm::read(multipart?).await?;
    let doc = form.document(None)?;
    info!("construction/analyze: {} ({} bytes)", doc.name, doc.bytes.len());

    let body = match state.backend.convert(&doc).await? {
        MarkdownOutput::Complete(text) => Body::from(text),
        MarkdownOutput::Streaming(chunks) => Body::from_stream(chunks),
    };
    Ok((
        [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
        body,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredAnalysisRequest {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

/// Streaming structured analysis of already-converted text.
pub async fn gemini_analyze(
    State(state): State<AppState>,
    request: Result<Json<StructuredAnalysisRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let Json(request) = request?;
    let content = request
        .content
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| AnalysisError::MissingField {
            field: "content".to_string(),
        })?;
    let system_prompt = request
        .system_prompt
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| default_directive(&state));

    let fragments = state.backend.analyze(&content, &system_prompt).await?;
    let events = fragments.map(|item| match item {
        Ok(fragment) => Event::default().json_data(fragment),
        Err(e) => Ok(error_event(&e)),
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Both phases server-side, as named SSE events.
pub async fn construction_pipeline(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let mut form = UploadForm::read(multipart?).await?;
    let system_prompt = form
        .field("systemPrompt")
        .map(str::to_string)
        .unwrap_or_else(|| default_directive(&state));
    let doc = form.document(None)?;
    info!("construction/pipeline: {} ({} bytes)", doc.name, doc.bytes.len());

    let events = analyze_document_stream_with(Arc::clone(&state.backend), doc, system_prompt)
        .map(|item| match item {
            Ok(event) => pipeline_event(&event),
            Err(e) => Ok(error_event(&e)),
        });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn default_directive(state: &AppState) -> String {
    state
        .config
        .system_prompt
        .clone()
        .unwrap_or_else(|| DEFAULT_ANALYSIS_DIRECTIVE.to_string())
}

fn pipeline_event(event: &PipelineEvent) -> Result<Event, axum::Error> {
    Event::default().event(event.name()).json_data(event)
}

fn error_event(e: &AnalysisError) -> Event {
    warn!("Stream ended with error: {}", e);
    Event::default()
        .event("error")
        .data(json!({ "error": e.to_string(), "status": e.status_code() }).to_string())
}
