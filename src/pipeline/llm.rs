//! Vision-model calls: per-tile analysis and the cross-section summary.
//!
//! The orchestrator talks to models only through the [`VisionModel`] trait,
//! a single-turn "prompt + optional image → text" call. The production
//! implementation, [`ProviderVisionModel`], forwards to any `edgequake-llm`
//! provider; tests substitute scripted models.
//!
//! ## No retry here
//!
//! Tile and summary calls are attempted exactly once. A failure surfaces as
//! [`SectionAnalysisError`] (with the tile coordinate) or
//! [`AnalysisError::SummaryFailed`]; whether to retry belongs to the provider
//! SDK underneath, not to this layer. Each call is bounded by its own timeout.

use crate::config::{AnalysisConfig, DEFAULT_VISION_MODEL};
use crate::error::{AnalysisError, ModelError, SectionAnalysisError};
use crate::output::SectionAnalysisResult;
use crate::pipeline::{encode, postprocess, tile::GridSection};
use crate::prompts::{section_prompt, summary_prompt};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

/// One single-turn completion request.
#[derive(Clone)]
pub struct VisionRequest {
    pub prompt: String,
    pub image: Option<ImageData>,
}

/// A model that answers a prompt, optionally about one image.
#[async_trait]
pub trait VisionModel: Send + Sync {
    async fn complete(&self, request: VisionRequest) -> Result<String, ModelError>;
}

/// [`VisionModel`] backed by an `edgequake-llm` provider.
pub struct ProviderVisionModel {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
}

impl ProviderVisionModel {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &AnalysisConfig) -> Self {
        Self {
            provider,
            options: build_options(config),
        }
    }
}

#[async_trait]
impl VisionModel for ProviderVisionModel {
    async fn complete(&self, request: VisionRequest) -> Result<String, ModelError> {
        let images: Vec<ImageData> = request.image.into_iter().collect();
        let messages = vec![ChatMessage::user_with_images(request.prompt.as_str(), images)];

        let response = self
            .provider
            .chat(&messages, Some(&self.options))
            .await
            .map_err(|e| ModelError::from_provider_message(e.to_string()))?;

        debug!(
            "Completion: {} input tokens, {} output tokens",
            response.prompt_tokens, response.completion_tokens
        );

        if response.content.trim().is_empty() {
            return Err(ModelError::EmptyCompletion);
        }
        Ok(response.content)
    }
}

/// Build the vision model for tile and summary calls from the config.
pub fn vision_model(config: &AnalysisConfig) -> Result<Arc<dyn VisionModel>, AnalysisError> {
    let provider = resolve_provider(config)?;
    Ok(Arc::new(ProviderVisionModel::new(provider, config)))
}

/// Resolve the LLM provider, from most-specific to least-specific:
///
/// 1. pre-built `config.provider`
/// 2. `config.provider_name` + `config.model`
/// 3. `SITEDOC_LLM_PROVIDER` + `SITEDOC_MODEL` (both set)
/// 4. OpenAI when `OPENAI_API_KEY` is set
/// 5. `ProviderFactory::from_env()` auto-detection
pub fn resolve_provider(config: &AnalysisConfig) -> Result<Arc<dyn LLMProvider>, AnalysisError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    let model = config.model.as_deref().unwrap_or(DEFAULT_VISION_MODEL);

    if let Some(ref name) = config.provider_name {
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("SITEDOC_LLM_PROVIDER"),
        std::env::var("SITEDOC_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            let model = config.model.as_deref().unwrap_or(&env_model);
            return create_provider(&prov, model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            return create_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| AnalysisError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, AnalysisError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        AnalysisError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Analyse one tile. `index` is its 0-based submission position out of `total`.
pub async fn analyze_section(
    model: &dyn VisionModel,
    section: &GridSection,
    index: usize,
    total: usize,
    timeout_secs: u64,
) -> Result<SectionAnalysisResult, SectionAnalysisError> {
    let start = Instant::now();
    let request = VisionRequest {
        prompt: section_prompt(index, total, section.x, section.y),
        image: Some(encode::to_image_data(&section.png)),
    };

    let reply = match timeout(Duration::from_secs(timeout_secs), model.complete(request)).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            warn!("Section {}/{} ({}, {}) failed: {}", index + 1, total, section.x, section.y, e);
            return Err(SectionAnalysisError::from_model(section.x, section.y, &e));
        }
        Err(_) => {
            warn!("Section {}/{} timed out after {}s", index + 1, total, timeout_secs);
            return Err(SectionAnalysisError::new(
                section.x,
                section.y,
                format!("timed out after {}s", timeout_secs),
            ));
        }
    };

    debug!(
        "Section {}/{} analysed in {:?} ({} chars)",
        index + 1,
        total,
        start.elapsed(),
        reply.len()
    );

    Ok(SectionAnalysisResult {
        grid_position: section.position(),
        analysis: postprocess::tidy_text(&reply),
    })
}

/// Ask for one narrative that synthesises every section result.
pub async fn summarize(
    model: &dyn VisionModel,
    sections: &[SectionAnalysisResult],
    timeout_secs: u64,
) -> Result<String, AnalysisError> {
    let request = VisionRequest {
        prompt: summary_prompt(sections),
        image: None,
    };

    match timeout(Duration::from_secs(timeout_secs), model.complete(request)).await {
        Ok(Ok(text)) => Ok(postprocess::tidy_text(&text)),
        Ok(Err(e)) => Err(AnalysisError::SummaryFailed {
            detail: e.to_string(),
        }),
        Err(_) => Err(AnalysisError::Timeout {
            stage: "Summary call",
            secs: timeout_secs,
        }),
    }
}

/// Build `CompletionOptions` from the analysis config.
fn build_options(config: &AnalysisConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::GridPosition;
    use std::sync::Mutex;

    struct Recording {
        prompts: Mutex<Vec<(String, bool)>>,
        reply: Result<String, ModelError>,
        delay: Duration,
    }

    #[async_trait]
    impl VisionModel for Recording {
        async fn complete(&self, request: VisionRequest) -> Result<String, ModelError> {
            self.prompts
                .lock()
                .unwrap()
                .push((request.prompt, request.image.is_some()));
            tokio::time::sleep(self.delay).await;
            self.reply.clone()
        }
    }

    fn recording(reply: Result<String, ModelError>, delay_ms: u64) -> Recording {
        Recording {
            prompts: Mutex::new(Vec::new()),
            reply,
            delay: Duration::from_millis(delay_ms),
        }
    }

    fn section(x: u32, y: u32) -> GridSection {
        GridSection {
            x,
            y,
            width: 1,
            height: 1,
            png: vec![0x89, b'P', b'N', b'G'],
        }
    }

    #[test]
    fn build_options_defaults() {
        let config = AnalysisConfig::default();
        let opts = build_options(&config);
        assert_eq!(opts.temperature, Some(0.2));
        assert_eq!(opts.max_tokens, Some(2048));
    }

    #[tokio::test]
    async fn section_call_sends_image_and_position() {
        let model = recording(Ok("```\nrebar at 200 c/c  \n```".into()), 0);
        let result = analyze_section(&model, &section(1, 0), 1, 4, 5).await.unwrap();
        assert_eq!(result.grid_position, GridPosition { x: 1, y: 0 });
        assert_eq!(result.analysis, "rebar at 200 c/c");

        let prompts = model.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].0.contains("grid section 2 of 4 (row 1, column 2)"));
        assert!(prompts[0].1, "tile image must be attached");
    }

    #[tokio::test]
    async fn section_failure_carries_coordinate() {
        let model = recording(Err(ModelError::Api("HTTP 500".into())), 0);
        let err = analyze_section(&model, &section(0, 1), 2, 4, 5).await.unwrap_err();
        assert_eq!((err.x, err.y), (0, 1));
        assert!(err.detail.contains("HTTP 500"));
    }

    #[tokio::test(start_paused = true)]
    async fn section_timeout_is_an_error() {
        let model = recording(Ok("late".into()), 10_000);
        let err = analyze_section(&model, &section(1, 1), 3, 4, 1).await.unwrap_err();
        assert!(err.detail.contains("timed out"));
    }

    #[tokio::test]
    async fn summary_is_text_only() {
        let model = recording(Ok("whole sheet".into()), 0);
        let sections = vec![SectionAnalysisResult {
            grid_position: GridPosition { x: 0, y: 0 },
            analysis: "grid lines A–D".into(),
        }];
        let summary = summarize(&model, &sections, 5).await.unwrap();
        assert_eq!(summary, "whole sheet");
        let prompts = model.prompts.lock().unwrap();
        assert!(!prompts[0].1);
        assert!(prompts[0].0.contains("Section 1 (Row 1, Column 1): grid lines A–D"));
    }

    #[tokio::test]
    async fn summary_failure_maps_to_summary_error() {
        let model = recording(Err(ModelError::EmptyCompletion), 0);
        let err = summarize(&model, &[], 5).await.unwrap_err();
        assert!(matches!(err, AnalysisError::SummaryFailed { .. }));
    }
}
