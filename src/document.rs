//! Document pipeline: markdown conversion, then streamed structured analysis.
//!
//! ## Phases
//!
//! ```text
//! Phase 1  file ──▶ converter ──▶ Markdown events (verbatim) ──▶ full text
//! Phase 2  full text + directive ──▶ streaming LLM ──▶ relay ──▶ Snapshot events
//! ```
//!
//! Phase 2 starts only once phase 1's full text is known. Every parsed
//! fragment is emitted as a [`PipelineEvent::Snapshot`] and *replaces* the
//! current answer; nothing is merged. For consumers that render the five
//! analysis dimensions one by one, a [`PipelineEvent::SectionReady`] follows
//! each snapshot for every dimension whose text changed.
//!
//! A converter reply with no text ends the stream right after
//! `MarkdownComplete`; there is nothing to analyse.
//!
//! The stream ends when the upstream closes. An `Err` item is terminal. A
//! stream that ends without any snapshot is a failed or partial analysis:
//! no success sentinel is ever sent.
//!
//! Dropping the returned stream stops the pipeline task, which drops the
//! converter and LLM bodies it was reading.

use crate::config::AnalysisConfig;
use crate::error::AnalysisError;
use crate::events::PipelineEvent;
use crate::output::{ConstructionAnalysis, DocumentAnalysisOutput};
use crate::pipeline::input::{self, SourceDocument};
use crate::pipeline::markdown::{self, MarkdownOutput};
use crate::pipeline::relay::FragmentStream;
use crate::pipeline::structured;
use crate::prompts::DEFAULT_ANALYSIS_DIRECTIVE;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

/// Pipeline output, in emission order.
pub type PipelineStream = Pin<Box<dyn Stream<Item = Result<PipelineEvent, AnalysisError>> + Send>>;

type EventSender = mpsc::Sender<Result<PipelineEvent, AnalysisError>>;

/// The two remote collaborators of the pipeline.
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Phase 1: document → markdown.
    async fn convert(&self, doc: &SourceDocument) -> Result<MarkdownOutput, AnalysisError>;

    /// Phase 2: open the streaming structured analysis of `content`.
    async fn analyze(
        &self,
        content: &str,
        system_prompt: &str,
    ) -> Result<FragmentStream, AnalysisError>;
}

/// Converter and structured-analysis endpoints from an [`AnalysisConfig`].
pub struct HttpBackend {
    config: AnalysisConfig,
}

impl HttpBackend {
    pub fn new(config: AnalysisConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DocumentBackend for HttpBackend {
    async fn convert(&self, doc: &SourceDocument) -> Result<MarkdownOutput, AnalysisError> {
        markdown::convert_to_markdown(doc, &self.config).await
    }

    async fn analyze(
        &self,
        content: &str,
        system_prompt: &str,
    ) -> Result<FragmentStream, AnalysisError> {
        structured::stream_structured_analysis(content, system_prompt, &self.config).await
    }
}

/// Run the pipeline for `doc`, streaming events as they happen.
pub fn analyze_document_stream(doc: SourceDocument, config: &AnalysisConfig) -> PipelineStream {
    let system_prompt = config
        .system_prompt
        .clone()
        .unwrap_or_else(|| DEFAULT_ANALYSIS_DIRECTIVE.to_string());
    analyze_document_stream_with(Arc::new(HttpBackend::new(config.clone())), doc, system_prompt)
}

/// Run the pipeline against an explicit backend.
pub fn analyze_document_stream_with(
    backend: Arc<dyn DocumentBackend>,
    doc: SourceDocument,
    system_prompt: String,
) -> PipelineStream {
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        if let Err(e) = run_pipeline(backend.as_ref(), &doc, &system_prompt, &tx).await {
            let _ = tx.send(Err(e)).await;
        }
    });
    Box::pin(ReceiverStream::new(rx))
}

/// Run the pipeline to completion and keep only the final state.
pub async fn analyze_document(
    doc: SourceDocument,
    config: &AnalysisConfig,
) -> Result<DocumentAnalysisOutput, AnalysisError> {
    collect(analyze_document_stream(doc, config)).await
}

/// Resolve a local path or URL, then run [`analyze_document`].
pub async fn analyze_input(
    input_str: impl AsRef<str>,
    config: &AnalysisConfig,
) -> Result<DocumentAnalysisOutput, AnalysisError> {
    let doc = input::resolve_input(input_str.as_ref(), config.download_timeout_secs).await?;
    analyze_document(doc, config).await
}

/// Fold a pipeline stream into its final state. The latest snapshot wins.
pub async fn collect(mut events: PipelineStream) -> Result<DocumentAnalysisOutput, AnalysisError> {
    let mut output = DocumentAnalysisOutput::default();
    while let Some(event) = events.next().await {
        match event? {
            PipelineEvent::Markdown { text } => output.markdown.push_str(&text),
            PipelineEvent::Snapshot { fragment } => {
                output.analysis = Some(fragment);
                output.fragments += 1;
            }
            PipelineEvent::MarkdownComplete { .. } | PipelineEvent::SectionReady { .. } => {}
        }
    }
    Ok(output)
}

/// `false` once the consumer is gone.
async fn send(tx: &EventSender, event: PipelineEvent) -> bool {
    tx.send(Ok(event)).await.is_ok()
}

async fn run_pipeline(
    backend: &dyn DocumentBackend,
    doc: &SourceDocument,
    system_prompt: &str,
    tx: &EventSender,
) -> Result<(), AnalysisError> {
    // ── Phase 1: markdown ────────────────────────────────────────────────
    info!("Pipeline phase 1: converting {}", doc.name);
    let markdown = match backend.convert(doc).await? {
        MarkdownOutput::Complete(text) => {
            if !send(tx, PipelineEvent::Markdown { text: text.clone() }).await {
                return Ok(());
            }
            text
        }
        MarkdownOutput::Streaming(mut chunks) => {
            let mut full = String::new();
            loop {
                let next = tokio::select! {
                    _ = tx.closed() => return Ok(()),
                    next = chunks.next() => next,
                };
                let Some(chunk) = next else { break };
                let chunk = chunk?;
                full.push_str(&chunk);
                if !send(tx, PipelineEvent::Markdown { text: chunk }).await {
                    return Ok(());
                }
            }
            full
        }
    };

    let chars = markdown.chars().count();
    if !send(tx, PipelineEvent::MarkdownComplete { chars }).await {
        return Ok(());
    }
    if markdown.trim().is_empty() {
        info!("Converter produced no text for {}; skipping structured analysis", doc.name);
        return Ok(());
    }

    // ── Phase 2: structured analysis ─────────────────────────────────────
    info!("Pipeline phase 2: structured analysis of {} chars", chars);
    let mut fragments = backend.analyze(&markdown, system_prompt).await?;
    let mut current: Option<ConstructionAnalysis> = None;
    let mut snapshots = 0usize;

    loop {
        let next = tokio::select! {
            _ = tx.closed() => {
                debug!("Pipeline consumer went away after {} snapshots", snapshots);
                return Ok(());
            }
            next = fragments.next() => next,
        };
        let Some(fragment) = next else { break };
        let fragment = fragment?;
        snapshots += 1;

        let analysis = ConstructionAnalysis::from_fragment(&fragment);
        if !send(tx, PipelineEvent::Snapshot { fragment }).await {
            return Ok(());
        }
        if let Some(analysis) = analysis {
            for section in analysis.changed_since(current.as_ref()) {
                let text = analysis.get(section).unwrap_or_default().to_string();
                if !send(tx, PipelineEvent::SectionReady { section, text }).await {
                    return Ok(());
                }
            }
            current = Some(analysis);
        }
    }

    info!("Pipeline finished with {} snapshots", snapshots);
    Ok(())
}
