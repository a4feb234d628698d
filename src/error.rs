//! Error types for the sitedoc-analyzer library.
//!
//! Three error types reflect three distinct failure scopes:
//!
//! * [`AnalysisError`] — **Fatal** for one request: the grid analysis or the
//!   document pipeline cannot produce a result (bad page number, upstream
//!   rejected the call, a tile failed). Returned as `Err(AnalysisError)` from
//!   every public entry point and rendered as `{"error": …}` by the HTTP layer.
//!
//! * [`SectionAnalysisError`] — a single tile's vision call failed. It carries
//!   the tile coordinate so the orchestrator can report *which* tile sank the
//!   batch. Grid runs are all-or-nothing, so it is always wrapped into
//!   [`AnalysisError::SectionAnalysis`] before reaching the caller.
//!
//! * [`ModelError`] — one [`crate::pipeline::llm::VisionModel`] call failed.
//!   Kept separate from the tile error because the summary call has no tile.
//!
//! Stream-parsing noise (a malformed SSE line, an unparseable JSON envelope)
//! is deliberately *not* represented here: it is logged and skipped.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the sitedoc-analyzer library.
#[derive(Debug, Error)]
pub enum AnalysisError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// A required request field (file, content, …) was absent or empty.
    #[error("Missing required field '{field}'")]
    MissingField { field: String },

    /// Input file was not found at the given path.
    #[error("File not found: '{path}'")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a readable file path or a valid HTTP/HTTPS URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    /// Image metadata could not be read, or a dimension (or tile dimension) is zero.
    #[error("Could not determine image dimensions: {detail}")]
    InvalidDimensions { detail: String },

    /// Requested page is outside `1..=total`.
    #[error("Invalid page number: {page}. PDF has {total} pages.")]
    InvalidPage { page: usize, total: usize },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF is corrupt: {detail}")]
    CorruptPdf { detail: String },

    /// pdfium-render returned an error for the selected page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or install pdfium system-wide."
    )]
    PdfiumBindingFailed(String),

    // ── Model errors ──────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// One tile analysis failed; the whole grid request fails with it.
    #[error(transparent)]
    SectionAnalysis(#[from] SectionAnalysisError),

    /// The cross-section synthesis call failed.
    #[error("Summary call failed: {detail}")]
    SummaryFailed { detail: String },

    /// A stage exceeded its configured time budget.
    #[error("{stage} timed out after {secs}s")]
    Timeout { stage: &'static str, secs: u64 },

    // ── Upstream stream errors ────────────────────────────────────────────
    /// The streaming endpoint answered with a non-2xx status before streaming began.
    #[error("Upstream streaming API error ({status}): {body}")]
    UpstreamStream { status: u16, body: String },

    /// The upstream body became unreadable mid-stream.
    #[error("Upstream stream read failed: {detail}")]
    StreamRead { detail: String },

    /// The upstream emitted a typed error envelope inside an otherwise healthy stream.
    #[error("Upstream reported an error mid-stream: {message}")]
    UpstreamEnvelope { code: Option<i64>, message: String },

    /// The document-to-markdown converter failed or returned an error reply.
    #[error("Converter error: {detail}")]
    ConverterFailed { status: Option<u16>, detail: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AnalysisError {
    /// HTTP status reflecting the failure class.
    ///
    /// Client-correctable input maps to 400, credential problems to 401,
    /// upstream statuses pass through when known, timeouts to 504 and
    /// everything else to 500.
    pub fn status_code(&self) -> u16 {
        match self {
            AnalysisError::MissingField { .. }
            | AnalysisError::FileNotFound { .. }
            | AnalysisError::InvalidInput { .. }
            | AnalysisError::DownloadFailed { .. }
            | AnalysisError::InvalidDimensions { .. }
            | AnalysisError::InvalidPage { .. }
            | AnalysisError::CorruptPdf { .. } => 400,
            AnalysisError::PermissionDenied { .. } => 403,
            AnalysisError::ProviderNotConfigured { .. } => 401,
            AnalysisError::SectionAnalysis(e) if e.is_auth() => 401,
            AnalysisError::UpstreamStream { status, .. } => passthrough(*status),
            AnalysisError::ConverterFailed {
                status: Some(status),
                ..
            } => passthrough(*status),
            AnalysisError::Timeout { .. } => 504,
            _ => 500,
        }
    }
}

/// Keep upstream error statuses, but never forward a success code as an error.
fn passthrough(status: u16) -> u16 {
    if (400..600).contains(&status) {
        status
    } else {
        500
    }
}

/// A failed analysis of a single grid tile.
#[derive(Debug, Clone, Error)]
#[error("Section (row {row}, column {column}) failed: {detail}", row = .y + 1, column = .x + 1)]
pub struct SectionAnalysisError {
    /// 0-indexed grid column.
    pub x: u32,
    /// 0-indexed grid row.
    pub y: u32,
    pub detail: String,
    auth: bool,
}

impl SectionAnalysisError {
    pub fn new(x: u32, y: u32, detail: impl Into<String>) -> Self {
        Self {
            x,
            y,
            detail: detail.into(),
            auth: false,
        }
    }

    /// Build from a model failure, remembering whether it was a credential problem.
    pub fn from_model(x: u32, y: u32, err: &ModelError) -> Self {
        Self {
            x,
            y,
            detail: err.to_string(),
            auth: matches!(err, ModelError::Auth(_)),
        }
    }

    pub fn is_auth(&self) -> bool {
        self.auth
    }
}

/// Failure of one vision/text completion call.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    /// Network failure or non-2xx answer from the provider.
    #[error("LLM API error: {0}")]
    Api(String),

    /// The provider rejected the credential.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// The provider answered but the completion carried no text.
    #[error("LLM returned an empty completion")]
    EmptyCompletion,
}

impl ModelError {
    /// Classify a provider error message.
    pub fn from_provider_message(message: String) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("401")
            || lower.contains("403")
            || lower.contains("unauthorized")
            || lower.contains("authentication")
            || lower.contains("api key")
        {
            ModelError::Auth(message)
        } else {
            ModelError::Api(message)
        }
    }
}
