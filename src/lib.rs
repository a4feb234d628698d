//! # sitedoc-analyzer
//!
//! Analyse construction drawings and documents with Vision Language Models.
//!
//! ## Why tiles?
//!
//! A construction drawing packs dimensions, callouts and grid references into
//! a sheet far larger than a VLM reads reliably in one image. Splitting the
//! sheet into a `g × g` grid and asking about each tile separately keeps small
//! annotation text legible; a final call stitches the tile observations into
//! one narrative.
//!
//! ## Two pipelines
//!
//! ```text
//! Grid analysis (one drawing)
//!  ├─ 1. Input    upload, local file or URL
//!  ├─ 2. Render   select + rasterise one PDF page (pdfium, spawn_blocking)
//!  ├─ 3. Tile     g×g row-major PNG tiles
//!  ├─ 4. VLM      bounded concurrent tile calls, all-or-nothing
//!  └─ 5. Summary  one synthesis call → CombinedGridResult
//!
//! Document analysis (whole document)
//!  ├─ 1. Convert  external document→markdown service (atomic or streamed)
//!  ├─ 2. Stream   streaming structured-analysis call (SSE)
//!  ├─ 3. Relay    UTF-8 safe line buffering + typed envelopes
//!  └─ 4. Extract  first balanced JSON object; latest snapshot wins
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sitedoc_analyzer::{grid, AnalysisConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = AnalysisConfig::builder().grid_size(3).build()?;
//!     let result = grid::analyze_input("floor-plan.pdf", &config).await?;
//!     for section in &result.sections {
//!         println!("({}, {}) {}", section.grid_position.x, section.grid_position.y, section.analysis);
//!     }
//!     println!("{}", result.summary);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `sitedoc` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! ```toml
//! sitedoc-analyzer = { version = "0.3", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod document;
pub mod error;
pub mod events;
pub mod grid;
pub mod output;
pub mod pipeline;
pub mod prompts;
pub mod server;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    AnalysisConfig, AnalysisConfigBuilder, BraceMatching, ConverterMode, DeltaFormat,
};
pub use document::{
    analyze_document, analyze_document_stream, analyze_document_stream_with, DocumentBackend,
    HttpBackend, PipelineStream,
};
pub use error::{AnalysisError, ModelError, SectionAnalysisError};
pub use events::{grid_channel, GridEvent, GridEventSender, PipelineEvent};
pub use grid::{analyze_drawing, analyze_drawing_with, analyze_image, analyze_image_with_events};
pub use output::{
    AnalysisSection, CombinedGridResult, ConstructionAnalysis, DocumentAnalysisOutput,
    GridPosition, SectionAnalysisResult,
};
pub use pipeline::extract::{Extraction, JsonExtractor};
pub use pipeline::input::{SourceDocument, SourceKind};
pub use pipeline::llm::{ProviderVisionModel, VisionModel, VisionRequest};
pub use pipeline::relay::{FragmentStream, StreamRelay};
pub use server::{build_router, start_server, AppState};
