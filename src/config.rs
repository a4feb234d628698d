//! Configuration types for drawing and document analysis.
//!
//! All behaviour is controlled through [`AnalysisConfig`], built via its
//! [`AnalysisConfigBuilder`]. One struct carries every knob so the HTTP
//! service can share a single `Arc<AnalysisConfig>` across requests and
//! derive request-scoped copies (e.g. a per-request grid size or model)
//! with a cheap clone.

use crate::error::AnalysisError;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Default Gemini REST base for the streaming structured-analysis call.
pub const DEFAULT_STRUCTURED_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Default model for the streaming structured-analysis call.
pub const DEFAULT_STRUCTURED_MODEL: &str = "gemini-2.0-flash";

/// Default vision model for tile and summary calls.
pub const DEFAULT_VISION_MODEL: &str = "gpt-4o";

/// Default address of the document-to-markdown converter.
pub const DEFAULT_CONVERTER_URL: &str = "http://127.0.0.1:8000/convert";

/// Largest grid accepted (8×8 = 64 tiles).
pub const MAX_GRID_SIZE: u32 = 8;

/// Configuration for grid analysis and the document pipeline.
///
/// Built via [`AnalysisConfig::builder()`] or using
/// [`AnalysisConfig::default()`].
///
/// # Example
/// ```rust
/// use sitedoc_analyzer::AnalysisConfig;
///
/// let config = AnalysisConfig::builder()
///     .grid_size(3)
///     .max_concurrency(4)
///     .model("gpt-4o")
///     .build()
///     .unwrap();
/// assert_eq!(config.grid_size, 3);
/// ```
#[derive(Clone)]
pub struct AnalysisConfig {
    /// Tiles per side. The drawing is split into `grid_size²` tiles. Default: 2.
    pub grid_size: u32,

    /// 1-indexed page to rasterise when the source is a PDF. Default: 1.
    pub page_number: usize,

    /// Vision model identifier for tile and summary calls.
    /// If None, [`DEFAULT_VISION_MODEL`] is used when a provider has to be created.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "gemini").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Maximum number of tile analyses in flight at once. Default: 10.
    ///
    /// A 2×2 or 3×3 grid fits entirely under the default, so small grids
    /// still fan out fully; larger grids queue instead of exhausting the
    /// provider's rate limit.
    pub max_concurrency: usize,

    /// Sampling temperature for tile and summary calls. Default: 0.2.
    pub temperature: f32,

    /// Maximum tokens per tile/summary completion. Default: 2048.
    pub max_tokens: usize,

    /// Longest edge, in pixels, of a rasterised PDF page. Default: 2000.
    pub max_rendered_pixels: u32,

    /// Per-tile vision call timeout in seconds. Default: 60.
    pub section_timeout_secs: u64,

    /// Summary call timeout in seconds. Default: 120.
    pub summary_timeout_secs: u64,

    /// Budget for the whole streaming structured-analysis phase. Default: 300.
    pub stream_timeout_secs: u64,

    /// Base URL of the streaming structured-analysis API.
    pub structured_endpoint: String,

    /// Model for the streaming structured-analysis call.
    pub structured_model: String,

    /// API key for the structured-analysis call. Falls back to `GEMINI_API_KEY`.
    pub structured_api_key: Option<String>,

    /// Sampling parameters of the structured-analysis call.
    pub structured_temperature: f32,
    pub structured_top_k: u32,
    pub structured_top_p: f32,
    pub structured_max_output_tokens: u32,

    /// Envelope format of the upstream SSE stream. Default: [`DeltaFormat::Gemini`].
    pub delta_format: DeltaFormat,

    /// How the incremental extractor counts braces. Default: [`BraceMatching::StringAware`].
    pub brace_matching: BraceMatching,

    /// Custom structured-analysis directive. If None, uses the built-in one.
    pub system_prompt: Option<String>,

    /// Document-to-markdown converter endpoint.
    pub converter_url: String,

    /// Whether the converter answers atomically (`{markdown}`) or streams text.
    pub converter_mode: ConverterMode,

    /// Converter call timeout in seconds. Default: 300.
    pub converter_timeout_secs: u64,

    /// Upper bound on uploaded file size accepted by the HTTP service. Default: 50 MiB.
    pub max_upload_bytes: usize,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            grid_size: 2,
            page_number: 1,
            model: None,
            provider_name: None,
            provider: None,
            max_concurrency: 10,
            temperature: 0.2,
            max_tokens: 2048,
            max_rendered_pixels: 2000,
            section_timeout_secs: 60,
            summary_timeout_secs: 120,
            stream_timeout_secs: 300,
            structured_endpoint: DEFAULT_STRUCTURED_ENDPOINT.to_string(),
            structured_model: DEFAULT_STRUCTURED_MODEL.to_string(),
            structured_api_key: None,
            structured_temperature: 0.2,
            structured_top_k: 40,
            structured_top_p: 0.95,
            structured_max_output_tokens: 8192,
            delta_format: DeltaFormat::default(),
            brace_matching: BraceMatching::default(),
            system_prompt: None,
            converter_url: DEFAULT_CONVERTER_URL.to_string(),
            converter_mode: ConverterMode::default(),
            converter_timeout_secs: 300,
            max_upload_bytes: 50 * 1024 * 1024,
            download_timeout_secs: 120,
        }
    }
}

impl fmt::Debug for AnalysisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisConfig")
            .field("grid_size", &self.grid_size)
            .field("page_number", &self.page_number)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("max_concurrency", &self.max_concurrency)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("section_timeout_secs", &self.section_timeout_secs)
            .field("summary_timeout_secs", &self.summary_timeout_secs)
            .field("stream_timeout_secs", &self.stream_timeout_secs)
            .field("structured_endpoint", &self.structured_endpoint)
            .field("structured_model", &self.structured_model)
            .field(
                "structured_api_key",
                &self.structured_api_key.as_ref().map(|_| "<redacted>"),
            )
            .field("delta_format", &self.delta_format)
            .field("brace_matching", &self.brace_matching)
            .field("converter_url", &self.converter_url)
            .field("converter_mode", &self.converter_mode)
            .finish()
    }
}

impl AnalysisConfig {
    /// Create a new builder for `AnalysisConfig`.
    pub fn builder() -> AnalysisConfigBuilder {
        AnalysisConfigBuilder {
            config: Self::default(),
        }
    }

    /// The structured-analysis API key, from config or the environment
    /// (`GEMINI_API_KEY`, or `OPENAI_API_KEY` for [`DeltaFormat::OpenAi`]).
    pub fn resolve_structured_api_key(&self) -> Result<String, AnalysisError> {
        if let Some(key) = self.structured_api_key.as_ref().filter(|k| !k.is_empty()) {
            return Ok(key.clone());
        }
        let (provider, var) = match self.delta_format {
            DeltaFormat::Gemini => ("gemini", "GEMINI_API_KEY"),
            DeltaFormat::OpenAi => ("openai", "OPENAI_API_KEY"),
        };
        match std::env::var(var) {
            Ok(key) if !key.is_empty() => Ok(key),
            _ => Err(AnalysisError::ProviderNotConfigured {
                provider: provider.to_string(),
                hint: format!("Structured-analysis API key is not set. Export {var}."),
            }),
        }
    }
}

/// Builder for [`AnalysisConfig`].
#[derive(Debug)]
pub struct AnalysisConfigBuilder {
    config: AnalysisConfig,
}

impl AnalysisConfigBuilder {
    /// Start from an existing configuration (e.g. the service-wide one).
    pub fn from_config(config: AnalysisConfig) -> Self {
        Self { config }
    }

    pub fn grid_size(mut self, n: u32) -> Self {
        self.config.grid_size = n;
        self
    }

    pub fn page_number(mut self, page: usize) -> Self {
        self.config.page_number = page;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.config.max_concurrency = n.max(1);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn section_timeout_secs(mut self, secs: u64) -> Self {
        self.config.section_timeout_secs = secs;
        self
    }

    pub fn summary_timeout_secs(mut self, secs: u64) -> Self {
        self.config.summary_timeout_secs = secs;
        self
    }

    pub fn stream_timeout_secs(mut self, secs: u64) -> Self {
        self.config.stream_timeout_secs = secs;
        self
    }

    pub fn structured_endpoint(mut self, url: impl Into<String>) -> Self {
        self.config.structured_endpoint = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn structured_model(mut self, model: impl Into<String>) -> Self {
        self.config.structured_model = model.into();
        self
    }

    pub fn structured_api_key(mut self, key: impl Into<String>) -> Self {
        self.config.structured_api_key = Some(key.into());
        self
    }

    pub fn structured_temperature(mut self, t: f32) -> Self {
        self.config.structured_temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn structured_max_output_tokens(mut self, n: u32) -> Self {
        self.config.structured_max_output_tokens = n;
        self
    }

    pub fn delta_format(mut self, format: DeltaFormat) -> Self {
        self.config.delta_format = format;
        self
    }

    pub fn brace_matching(mut self, mode: BraceMatching) -> Self {
        self.config.brace_matching = mode;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn converter_url(mut self, url: impl Into<String>) -> Self {
        self.config.converter_url = url.into();
        self
    }

    pub fn converter_mode(mut self, mode: ConverterMode) -> Self {
        self.config.converter_mode = mode;
        self
    }

    pub fn converter_timeout_secs(mut self, secs: u64) -> Self {
        self.config.converter_timeout_secs = secs;
        self
    }

    pub fn max_upload_bytes(mut self, bytes: usize) -> Self {
        self.config.max_upload_bytes = bytes;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<AnalysisConfig, AnalysisError> {
        let c = &self.config;
        if c.grid_size == 0 || c.grid_size > MAX_GRID_SIZE {
            return Err(AnalysisError::InvalidConfig(format!(
                "Grid size must be 1–{}, got {}",
                MAX_GRID_SIZE, c.grid_size
            )));
        }
        if c.page_number == 0 {
            return Err(AnalysisError::InvalidConfig(
                "Page numbers are 1-indexed".into(),
            ));
        }
        if c.section_timeout_secs == 0 || c.summary_timeout_secs == 0 || c.stream_timeout_secs == 0
        {
            return Err(AnalysisError::InvalidConfig(
                "Timeouts must be at least 1 second".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Which provider-specific path carries the text delta inside each SSE envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeltaFormat {
    /// `candidates[0].content.parts[*].text` (Gemini `streamGenerateContent?alt=sse`).
    #[default]
    Gemini,
    /// `choices[0].delta.content` (OpenAI chat-completions streaming).
    OpenAi,
}

/// Brace counting strategy of the incremental JSON extractor.
///
/// | Mode | `{`/`}` inside string literals |
/// |------|--------------------------------|
/// | `Naive` | counted (a `"}"` in prose can close an object early) |
/// | `StringAware` | ignored, escapes honoured (default) |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BraceMatching {
    /// Count every brace, including those inside string literals.
    Naive,
    /// Skip braces inside JSON string literals.
    #[default]
    StringAware,
}

/// How the document-to-markdown converter delivers its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConverterMode {
    /// One JSON reply: `{"markdown": "…"}`. (default)
    #[default]
    Atomic,
    /// A raw `text/markdown` byte stream relayed as it arrives.
    Streamed,
}

impl std::str::FromStr for ConverterMode {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "atomic" | "json" => Ok(ConverterMode::Atomic),
            "streamed" | "stream" => Ok(ConverterMode::Streamed),
            other => Err(AnalysisError::InvalidConfig(format!(
                "Unknown converter mode '{other}' (expected atomic or streamed)"
            ))),
        }
    }
}
