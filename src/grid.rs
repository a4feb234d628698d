//! Grid analysis entry points.
//!
//! A drawing is rasterised (PDF pages via pdfium), split into `g × g` tiles,
//! every tile is analysed by the vision model, and one more call synthesises
//! the per-tile texts into a summary.
//!
//! ## Fan-out
//!
//! Tile calls run concurrently, at most `max_concurrency` at a time, using
//! `buffered` so results come back in submission (row-major) order regardless
//! of completion order.
//!
//! ## All-or-nothing
//!
//! The first failed tile aborts the request: the remaining in-flight calls are
//! dropped, no summary is requested, and the caller gets exactly one
//! [`AnalysisError::SectionAnalysis`] naming the tile.

use crate::config::AnalysisConfig;
use crate::error::AnalysisError;
use crate::events::{emit, GridEvent, GridEventSender};
use crate::output::{CombinedGridResult, SectionAnalysisResult};
use crate::pipeline::input::{self, SourceDocument};
use crate::pipeline::llm::{self, VisionModel};
use crate::pipeline::{render, tile};
use futures::stream::{self, StreamExt, TryStreamExt};
use image::DynamicImage;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Analyse a local file or URL.
pub async fn analyze_input(
    input_str: impl AsRef<str>,
    config: &AnalysisConfig,
) -> Result<CombinedGridResult, AnalysisError> {
    let doc = input::resolve_input(input_str.as_ref(), config.download_timeout_secs).await?;
    analyze_drawing(&doc, config).await
}

/// Analyse one drawing with the provider resolved from `config`.
pub async fn analyze_drawing(
    doc: &SourceDocument,
    config: &AnalysisConfig,
) -> Result<CombinedGridResult, AnalysisError> {
    let model = llm::vision_model(config)?;
    analyze_drawing_with(model, doc, config, None).await
}

/// Analyse one drawing with an explicit model, optionally reporting progress.
pub async fn analyze_drawing_with(
    model: Arc<dyn VisionModel>,
    doc: &SourceDocument,
    config: &AnalysisConfig,
    events: Option<&GridEventSender>,
) -> Result<CombinedGridResult, AnalysisError> {
    let image = rasterise(doc, config).await?;
    analyze_image_with_events(model, &image, config, events).await
}

/// Turn a source document into the raster that gets tiled.
///
/// PDFs are checked against `config.page_number` and only that page is
/// rendered; images are decoded as-is.
pub async fn rasterise(
    doc: &SourceDocument,
    config: &AnalysisConfig,
) -> Result<DynamicImage, AnalysisError> {
    if doc.is_pdf() {
        render::render_page(doc.bytes.clone(), config.page_number, config.max_rendered_pixels).await
    } else {
        tile::decode_image(&doc.bytes)
    }
}

/// Analyse an already-decoded image.
pub async fn analyze_image(
    model: Arc<dyn VisionModel>,
    image: &DynamicImage,
    config: &AnalysisConfig,
) -> Result<CombinedGridResult, AnalysisError> {
    analyze_image_with_events(model, image, config, None).await
}

/// Analyse an image, sending a [`GridEvent`] at each milestone.
pub async fn analyze_image_with_events(
    model: Arc<dyn VisionModel>,
    image: &DynamicImage,
    config: &AnalysisConfig,
    events: Option<&GridEventSender>,
) -> Result<CombinedGridResult, AnalysisError> {
    let start = Instant::now();
    let grid_size = config.grid_size;
    let sections = tile::split_into_grid(image, grid_size)?;
    let total = sections.len();

    info!(
        "Analysing {}x{} grid ({} tiles, ≤{} in flight)",
        grid_size, grid_size, total, config.max_concurrency
    );
    emit(events, GridEvent::Started { grid_size, total });

    let section_timeout = config.section_timeout_secs;
    let tile_model = Arc::clone(&model);
    let tile_events: Option<GridEventSender> = events.cloned();

    // Each tile future owns its handles so the fan-out stays `Send + 'static`.
    let results: Vec<SectionAnalysisResult> = stream::iter(sections.into_iter().enumerate())
        .map(move |(index, section)| {
            let model = Arc::clone(&tile_model);
            let events = tile_events.clone();
            async move {
                let result =
                    llm::analyze_section(model.as_ref(), &section, index, total, section_timeout)
                        .await?;
                emit(
                    events.as_ref(),
                    GridEvent::SectionReady {
                        index,
                        total,
                        result: result.clone(),
                    },
                );
                Ok::<_, AnalysisError>(result)
            }
        })
        .buffered(config.max_concurrency.max(1))
        .try_collect()
        .await?;

    info!("All {} sections analysed in {:?}", total, start.elapsed());

    emit(events, GridEvent::SummaryStarted);
    let summary = llm::summarize(model.as_ref(), &results, config.summary_timeout_secs).await?;

    emit(
        events,
        GridEvent::Finished {
            sections: results.len(),
        },
    );
    info!("Grid analysis complete in {:?}", start.elapsed());

    Ok(CombinedGridResult {
        grid_size,
        sections: results,
        summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;
    use crate::events::grid_channel;
    use crate::output::GridPosition;
    use crate::pipeline::llm::VisionRequest;
    use async_trait::async_trait;
    use image::{Rgba, RgbaImage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Answers each tile with its own label; can fail one tile and delay early ones.
    struct ScriptedModel {
        fail_label: Option<&'static str>,
        slow_first: bool,
        tile_calls: AtomicUsize,
        summary_calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
    }

    impl ScriptedModel {
        fn new() -> Self {
            Self {
                fail_label: None,
                slow_first: false,
                tile_calls: AtomicUsize::new(0),
                summary_calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
            }
        }
    }

    fn label_of(prompt: &str) -> Option<&str> {
        let start = prompt.find("(row ")?;
        let end = prompt[start..].find(')')? + start + 1;
        Some(&prompt[start..end])
    }

    #[async_trait]
    impl VisionModel for ScriptedModel {
        async fn complete(&self, request: VisionRequest) -> Result<String, ModelError> {
            if request.image.is_none() {
                self.summary_calls.fetch_add(1, Ordering::SeqCst);
                return Ok(format!("SUMMARY of {} chars", request.prompt.len()));
            }
            self.tile_calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

            let label = label_of(&request.prompt).unwrap_or("?").to_string();
            let delay = if self.slow_first && label == "(row 1, column 1)" { 50 } else { 5 };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if Some(label.as_str()) == self.fail_label {
                return Err(ModelError::Api("HTTP 500 from vision endpoint".into()));
            }
            Ok(format!("tile {}", label))
        }
    }

    fn drawing() -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(40, 30, Rgba([255, 255, 255, 255])))
    }

    fn config(grid: u32, concurrency: usize) -> AnalysisConfig {
        AnalysisConfig::builder()
            .grid_size(grid)
            .max_concurrency(concurrency)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn results_follow_row_major_order() {
        let model = Arc::new(ScriptedModel {
            slow_first: true,
            ..ScriptedModel::new()
        });
        let result = analyze_image(model.clone(), &drawing(), &config(2, 4)).await.unwrap();

        let positions: Vec<GridPosition> = result.sections.iter().map(|s| s.grid_position).collect();
        assert_eq!(
            positions,
            vec![
                GridPosition { x: 0, y: 0 },
                GridPosition { x: 1, y: 0 },
                GridPosition { x: 0, y: 1 },
                GridPosition { x: 1, y: 1 },
            ]
        );
        assert_eq!(result.sections[1].analysis, "tile (row 1, column 2)");
        assert_eq!(result.sections[2].analysis, "tile (row 2, column 1)");
        assert_eq!(result.grid_size, 2);
        assert!(result.summary.starts_with("SUMMARY"));
        assert_eq!(model.summary_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn one_failed_tile_fails_the_batch() {
        let model = Arc::new(ScriptedModel {
            fail_label: Some("(row 2, column 1)"),
            ..ScriptedModel::new()
        });
        let err = analyze_image(model.clone(), &drawing(), &config(2, 4))
            .await
            .unwrap_err();

        match err {
            AnalysisError::SectionAnalysis(e) => assert_eq!((e.x, e.y), (0, 1)),
            other => panic!("expected SectionAnalysis, got {other:?}"),
        }
        assert_eq!(model.summary_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let model = Arc::new(ScriptedModel::new());
        let result = analyze_image(model.clone(), &drawing(), &config(3, 2)).await.unwrap();
        assert_eq!(result.sections.len(), 9);
        assert_eq!(model.tile_calls.load(Ordering::SeqCst), 9);
        assert!(model.peak_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn events_bracket_the_run() {
        let model = Arc::new(ScriptedModel::new());
        let (tx, mut rx) = grid_channel();
        analyze_image_with_events(model, &drawing(), &config(2, 4), Some(&tx))
            .await
            .unwrap();
        drop(tx);

        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        assert_eq!(events.len(), 1 + 4 + 2);
        assert!(matches!(events[0], GridEvent::Started { grid_size: 2, total: 4 }));
        assert!(events[1..5]
            .iter()
            .all(|e| matches!(e, GridEvent::SectionReady { total: 4, .. })));
        assert!(matches!(events[5], GridEvent::SummaryStarted));
        assert!(matches!(events[6], GridEvent::Finished { sections: 4 }));
    }

    #[tokio::test]
    async fn too_small_image_is_rejected_before_any_call() {
        let model = Arc::new(ScriptedModel::new());
        let tiny = DynamicImage::ImageRgba8(RgbaImage::new(2, 2));
        let err = analyze_image(model.clone(), &tiny, &config(3, 4)).await.unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidDimensions { .. }));
        assert_eq!(model.tile_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn image_documents_skip_pdf_rendering() {
        let mut png = Vec::new();
        drawing()
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let doc = SourceDocument::from_bytes("plan.png", png, None);
        let model = Arc::new(ScriptedModel::new());
        let result = analyze_drawing_with(model, &doc, &config(2, 4), None).await.unwrap();
        assert_eq!(result.sections.len(), 4);
    }

    #[tokio::test]
    async fn drawing_analysis_runs_on_a_spawned_task() {
        let mut png = Vec::new();
        drawing()
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let doc = SourceDocument::from_bytes("plan.png", png, None);
        let model: Arc<dyn VisionModel> = Arc::new(ScriptedModel::new());
        let config = config(2, 2);
        let (tx, mut rx) = grid_channel();

        let handle = tokio::spawn(async move {
            analyze_drawing_with(model, &doc, &config, Some(&tx)).await
        });
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.sections.len(), 4);

        let mut ready = 0;
        while let Some(event) = rx.recv().await {
            if matches!(event, GridEvent::SectionReady { .. }) {
                ready += 1;
            }
        }
        assert_eq!(ready, 4);
    }
}
