//! Pipeline stages for drawing and document analysis.
//!
//! Each submodule implements exactly one transformation step, so every stage
//! is testable on its own and the network-facing ones can be swapped for
//! in-process fakes.
//!
//! ## Data Flow
//!
//! Grid analysis of one drawing:
//!
//! ```text
//! input ──▶ render ──▶ tile ──▶ encode ──▶ llm ──▶ postprocess
//! (bytes)   (pdfium)   (g×g)    (base64)   (VLM)   (cleanup)
//! ```
//!
//! Structured analysis of a whole document:
//!
//! ```text
//! input ──▶ markdown ──▶ structured ──▶ relay ──▶ extract
//!           (converter)  (SSE call)     (lines)   (JSON)
//! ```
//!
//! 1. [`input`]      — upload, local path or URL to in-memory bytes
//! 2. [`render`]     — validate the page number and rasterise that page;
//!    runs in `spawn_blocking` because pdfium is not async-safe
//! 3. [`tile`]       — row-major `g × g` split of the raster
//! 4. [`encode`]     — PNG → base64 `ImageData` for the multimodal request
//! 5. [`llm`]        — per-tile and summary vision calls behind a trait seam
//! 6. [`postprocess`] — deterministic prose cleanup
//! 7. [`markdown`]   — external document-to-markdown converter
//! 8. [`structured`] — streaming structured-analysis request
//! 9. [`relay`]      — SSE line buffering and envelope decoding
//! 10. [`extract`]   — first-balanced-object JSON extraction

pub mod encode;
pub mod extract;
pub mod input;
pub mod llm;
pub mod markdown;
pub mod postprocess;
pub mod relay;
pub mod render;
pub mod structured;
pub mod tile;
