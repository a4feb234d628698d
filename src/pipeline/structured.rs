//! Streaming structured-analysis client.
//!
//! Opens one streaming completion against the structured-analysis endpoint
//! (Gemini `streamGenerateContent?alt=sse` by default, or an OpenAI-compatible
//! `chat/completions` with `stream: true`) and hands its body to the
//! [`relay`](crate::pipeline::relay). A non-2xx answer fails before any
//! fragment is produced.

use crate::config::{AnalysisConfig, DeltaFormat};
use crate::error::AnalysisError;
use crate::pipeline::relay::{spawn_relay, FragmentStream, StreamRelay};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

/// Start the streaming structured-analysis call for `content` under `system_prompt`.
pub async fn stream_structured_analysis(
    content: &str,
    system_prompt: &str,
    config: &AnalysisConfig,
) -> Result<FragmentStream, AnalysisError> {
    if content.trim().is_empty() {
        return Err(AnalysisError::MissingField {
            field: "content".to_string(),
        });
    }
    let api_key = config.resolve_structured_api_key()?;

    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| AnalysisError::Internal(format!("HTTP client: {e}")))?;

    let request = match config.delta_format {
        DeltaFormat::Gemini => client
            .post(format!(
                "{}/models/{}:streamGenerateContent",
                config.structured_endpoint, config.structured_model
            ))
            .query(&[("alt", "sse"), ("key", api_key.as_str())])
            .json(&gemini_body(content, system_prompt, config)),
        DeltaFormat::OpenAi => client
            .post(format!("{}/chat/completions", config.structured_endpoint))
            .bearer_auth(&api_key)
            .json(&openai_body(content, system_prompt, config)),
    };

    info!(
        "Opening structured-analysis stream: model={}, {} chars of content",
        config.structured_model,
        content.len()
    );

    let response = request
        .send()
        .await
        .map_err(|e| AnalysisError::UpstreamStream {
            status: 502,
            body: e.without_url().to_string(),
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AnalysisError::UpstreamStream {
            status: status.as_u16(),
            body,
        });
    }
    debug!("Structured-analysis stream open ({})", status);

    let relay = StreamRelay::new(config.delta_format, config.brace_matching);
    Ok(spawn_relay(
        response.bytes_stream(),
        relay,
        Duration::from_secs(config.stream_timeout_secs),
    ))
}

/// `streamGenerateContent` body: directive and content as two text parts.
fn gemini_body(content: &str, system_prompt: &str, config: &AnalysisConfig) -> Value {
    json!({
        "contents": [{
            "role": "user",
            "parts": [
                { "text": system_prompt },
                { "text": content }
            ]
        }],
        "generationConfig": {
            "temperature": config.structured_temperature,
            "topK": config.structured_top_k,
            "topP": config.structured_top_p,
            "maxOutputTokens": config.structured_max_output_tokens
        }
    })
}

fn openai_body(content: &str, system_prompt: &str, config: &AnalysisConfig) -> Value {
    json!({
        "model": config.structured_model,
        "stream": true,
        "temperature": config.structured_temperature,
        "top_p": config.structured_top_p,
        "max_tokens": config.structured_max_output_tokens,
        "messages": [
            { "role": "system", "content": system_prompt },
            { "role": "user", "content": content }
        ]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemini_body_carries_both_parts_and_sampling() {
        let config = AnalysisConfig::default();
        let body = gemini_body("# Spec", "Return JSON", &config);
        assert_eq!(body["contents"][0]["parts"][0]["text"], "Return JSON");
        assert_eq!(body["contents"][0]["parts"][1]["text"], "# Spec");
        assert_eq!(body["generationConfig"]["topK"], 40);
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 8192);
    }

    #[test]
    fn openai_body_streams() {
        let config = AnalysisConfig::builder()
            .delta_format(DeltaFormat::OpenAi)
            .structured_model("gpt-4o-mini")
            .build()
            .unwrap();
        let body = openai_body("doc", "sys", &config);
        assert_eq!(body["stream"], true);
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "system");
    }

    #[tokio::test]
    async fn empty_content_is_rejected() {
        let config = AnalysisConfig::builder().structured_api_key("k").build().unwrap();
        let err = match stream_structured_analysis("  ", "sys", &config).await {
            Err(e) => e,
            Ok(_) => panic!("empty content must be rejected"),
        };
        assert!(matches!(err, AnalysisError::MissingField { .. }));
    }
}
