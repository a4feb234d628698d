//! Document-to-markdown converter client.
//!
//! The converter is an external HTTP service taking a multipart `file` upload.
//! Depending on how it is deployed it either answers once with
//! `{"markdown": "…"}` ([`ConverterMode::Atomic`]) or streams the markdown
//! body as it is produced ([`ConverterMode::Streamed`]). Both arrive here as a
//! [`MarkdownOutput`]; the streamed variant is relayed chunk by chunk and can
//! be collected into the full text when the caller needs it.

use crate::config::{AnalysisConfig, ConverterMode};
use crate::error::AnalysisError;
use crate::pipeline::input::SourceDocument;
use crate::pipeline::relay::Utf8Decoder;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// Markdown text chunks in arrival order.
pub type MarkdownStream = Pin<Box<dyn Stream<Item = Result<String, AnalysisError>> + Send>>;

/// What the converter returned.
pub enum MarkdownOutput {
    Complete(String),
    Streaming(MarkdownStream),
}

impl MarkdownOutput {
    /// Wait for the whole document text.
    pub async fn into_text(self) -> Result<String, AnalysisError> {
        match self {
            MarkdownOutput::Complete(text) => Ok(text),
            MarkdownOutput::Streaming(mut chunks) => {
                let mut text = String::new();
                while let Some(chunk) = chunks.next().await {
                    text.push_str(&chunk?);
                }
                Ok(text)
            }
        }
    }
}

/// Converter replies, success or error.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ConverterReply {
    Markdown { markdown: String },
    Error { error: String },
    /// FastAPI-style validation/exception body.
    Detail { detail: Value },
}

impl ConverterReply {
    fn error_text(self) -> Option<String> {
        match self {
            ConverterReply::Markdown { .. } => None,
            ConverterReply::Error { error } => Some(error),
            ConverterReply::Detail { detail } => Some(match detail {
                Value::String(s) => s,
                other => other.to_string(),
            }),
        }
    }
}

/// Upload `doc` to the converter and return its markdown.
pub async fn convert_to_markdown(
    doc: &SourceDocument,
    config: &AnalysisConfig,
) -> Result<MarkdownOutput, AnalysisError> {
    let failed = |status: Option<u16>, detail: String| AnalysisError::ConverterFailed { status, detail };

    let part = reqwest::multipart::Part::bytes(doc.bytes.clone())
        .file_name(doc.name.clone())
        .mime_str(doc.mime_type())
        .map_err(|e| AnalysisError::Internal(format!("multipart: {e}")))?;
    let form = reqwest::multipart::Form::new().part("file", part);

    let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(30));
    if config.converter_mode == ConverterMode::Atomic {
        builder = builder.timeout(Duration::from_secs(config.converter_timeout_secs));
    }
    let client = builder
        .build()
        .map_err(|e| AnalysisError::Internal(format!("HTTP client: {e}")))?;

    info!(
        "Converting {} ({} bytes) via {} [{:?}]",
        doc.name,
        doc.bytes.len(),
        config.converter_url,
        config.converter_mode
    );

    let response = client
        .post(&config.converter_url)
        .multipart(form)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                AnalysisError::Timeout {
                    stage: "Markdown conversion",
                    secs: config.converter_timeout_secs,
                }
            } else {
                failed(None, e.to_string())
            }
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<ConverterReply>(&body)
            .ok()
            .and_then(ConverterReply::error_text)
            .unwrap_or(body);
        return Err(failed(Some(status.as_u16()), detail));
    }

    match config.converter_mode {
        ConverterMode::Atomic => {
            let body = response.text().await.map_err(|e| {
                if e.is_timeout() {
                    AnalysisError::Timeout {
                        stage: "Markdown conversion",
                        secs: config.converter_timeout_secs,
                    }
                } else {
                    failed(Some(status.as_u16()), e.to_string())
                }
            })?;
            let markdown = parse_atomic_reply(&body).map_err(|detail| failed(None, detail))?;
            debug!("Converter returned {} chars", markdown.len());
            Ok(MarkdownOutput::Complete(markdown))
        }
        ConverterMode::Streamed => Ok(MarkdownOutput::Streaming(spawn_text_relay(
            response.bytes_stream(),
            Duration::from_secs(config.converter_timeout_secs),
        ))),
    }
}

/// Decode an atomic converter reply into its markdown text.
fn parse_atomic_reply(body: &str) -> Result<String, String> {
    match serde_json::from_str::<ConverterReply>(body) {
        Ok(ConverterReply::Markdown { markdown }) => Ok(markdown),
        Ok(other) => Err(other
            .error_text()
            .unwrap_or_else(|| "converter reported an error".to_string())),
        Err(e) => Err(format!("unexpected converter reply: {e}")),
    }
}

/// Relay a raw text body chunk by chunk, decoding UTF-8 across chunk edges.
fn spawn_text_relay<S, B, E>(upstream: S, budget: Duration) -> MarkdownStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Result<String, AnalysisError>>(16);

    tokio::spawn(async move {
        let mut upstream = Box::pin(upstream);
        let mut decoder = Utf8Decoder::default();
        let deadline = Instant::now() + budget;
        let mut relayed = 0usize;

        loop {
            let next = tokio::select! {
                _ = tx.closed() => {
                    debug!("Markdown consumer went away after {} bytes", relayed);
                    return;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let _ = tx
                        .send(Err(AnalysisError::Timeout {
                            stage: "Markdown conversion",
                            secs: budget.as_secs(),
                        }))
                        .await;
                    return;
                }
                next = upstream.next() => next,
            };

            let text = match next {
                Some(Ok(chunk)) => decoder.push(chunk.as_ref()),
                Some(Err(e)) => {
                    warn!("Converter stream broke: {}", e);
                    let _ = tx
                        .send(Err(AnalysisError::StreamRead {
                            detail: e.to_string(),
                        }))
                        .await;
                    return;
                }
                None => {
                    let tail = decoder.finish();
                    if !tail.is_empty() {
                        let _ = tx.send(Ok(tail)).await;
                    }
                    debug!("Converter stream finished ({} bytes)", relayed);
                    return;
                }
            };

            if text.is_empty() {
                continue;
            }
            relayed += text.len();
            if tx.send(Ok(text)).await.is_err() {
                return;
            }
        }
    });

    Box::pin(ReceiverStream::new(rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[test]
    fn atomic_reply_shapes() {
        assert_eq!(parse_atomic_reply(r##"{"markdown":"# A"}"##).unwrap(), "# A");
        assert_eq!(
            parse_atomic_reply(r#"{"error":"unsupported file"}"#).unwrap_err(),
            "unsupported file"
        );
        assert_eq!(
            parse_atomic_reply(r#"{"detail":"Not Found"}"#).unwrap_err(),
            "Not Found"
        );
        assert!(parse_atomic_reply("<html>").unwrap_err().contains("unexpected"));
    }

    #[tokio::test]
    async fn streamed_text_survives_split_characters() {
        let body = "# Devis — phase 2\n".as_bytes();
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> =
            body.chunks(3).map(|c| Ok(c.to_vec())).collect();
        let text = MarkdownOutput::Streaming(spawn_text_relay(
            stream::iter(chunks),
            Duration::from_secs(5),
        ))
        .into_text()
        .await
        .unwrap();
        assert_eq!(text, "# Devis — phase 2\n");
    }

    #[tokio::test]
    async fn streamed_read_error_fails_collection() {
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> = vec![
            Ok(b"partial".to_vec()),
            Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof")),
        ];
        let err = MarkdownOutput::Streaming(spawn_text_relay(
            stream::iter(chunks),
            Duration::from_secs(5),
        ))
        .into_text()
        .await
        .unwrap_err();
        assert!(matches!(err, AnalysisError::StreamRead { .. }));
    }
}
