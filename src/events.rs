//! Progress events emitted over explicit channels.
//!
//! Grid runs and document runs both report progress as values sent through a
//! Tokio mpsc channel rather than through a shared callback slot. Each run
//! owns its sender, so concurrent analyses never race on a common hook, and a
//! consumer can sequence its own presentation ("show section 2 only after
//! section 1 finished animating") simply by draining the queue at its own pace.
//!
//! Grid events are best-effort: a dropped receiver never fails the analysis.
//! Pipeline events *are* the output of the document pipeline; see
//! [`crate::document`].

use crate::output::{AnalysisSection, SectionAnalysisResult};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

/// Progress of one grid analysis request.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GridEvent {
    /// Tiling finished; `total` tile analyses are about to be dispatched.
    Started { grid_size: u32, total: usize },
    /// One tile analysis completed.
    SectionReady {
        index: usize,
        total: usize,
        result: SectionAnalysisResult,
    },
    /// All tiles succeeded; the synthesis call is in flight.
    SummaryStarted,
    /// The combined result is ready.
    Finished { sections: usize },
}

/// Sender half handed to [`crate::grid::analyze_image_with_events`].
pub type GridEventSender = mpsc::UnboundedSender<GridEvent>;

/// Create a grid event channel.
pub fn grid_channel() -> (GridEventSender, mpsc::UnboundedReceiver<GridEvent>) {
    mpsc::unbounded_channel()
}

/// Send without caring whether anyone is still listening.
pub(crate) fn emit(events: Option<&GridEventSender>, event: GridEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

/// One item of the document pipeline's output stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// Phase 1: converter output, relayed verbatim as it arrives.
    Markdown { text: String },
    /// Phase 1 finished; phase 2 starts next.
    MarkdownComplete { chars: usize },
    /// Phase 2: the latest parsed fragment. Supersedes every earlier snapshot.
    Snapshot { fragment: Value },
    /// Phase 2: a named analysis dimension gained or changed text in the latest snapshot.
    SectionReady {
        section: AnalysisSection,
        text: String,
    },
}

impl PipelineEvent {
    /// SSE event name used by the HTTP surface.
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::Markdown { .. } => "markdown",
            PipelineEvent::MarkdownComplete { .. } => "markdown_complete",
            PipelineEvent::Snapshot { .. } => "snapshot",
            PipelineEvent::SectionReady { .. } => "section",
        }
    }
}
