//! Integration tests for the HTTP service.
//!
//! Every upstream is a local axum server bound to an ephemeral port, so the
//! suite runs offline:
//!
//! * a scripted [`VisionModel`] stands in for the tile/summary provider
//! * a `/convert` route stands in for the document-to-markdown converter
//! * a fallback route answers `…:streamGenerateContent?alt=sse` with SSE
//!
//! Run with:
//!   cargo test --test http_service

use async_trait::async_trait;
use axum::{
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use image::{DynamicImage, Rgba, RgbaImage};
use serde_json::{json, Value};
use sitedoc_analyzer::{
    build_router, AnalysisConfig, AppState, ModelError, VisionModel, VisionRequest,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ── Test helpers ─────────────────────────────────────────────────────────────

async fn spawn(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// Answers tile prompts with "tile" and the synthesis prompt with "summary".
#[derive(Default)]
struct CountingModel {
    tiles: AtomicUsize,
    summaries: AtomicUsize,
}

#[async_trait]
impl VisionModel for CountingModel {
    async fn complete(&self, request: VisionRequest) -> Result<String, ModelError> {
        if request.image.is_some() {
            self.tiles.fetch_add(1, Ordering::SeqCst);
            Ok("Door schedule D1–D4, 900 mm leaves.".to_string())
        } else {
            self.summaries.fetch_add(1, Ordering::SeqCst);
            Ok("Ground floor plan with four doors.".to_string())
        }
    }
}

fn drawing_png() -> Vec<u8> {
    let img = RgbaImage::from_fn(120, 90, |x, y| {
        if (x + y) % 7 == 0 {
            Rgba([0, 0, 0, 255])
        } else {
            Rgba([255, 255, 255, 255])
        }
    });
    let mut png = Vec::new();
    DynamicImage::ImageRgba8(img)
        .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
        .unwrap();
    png
}

fn file_part(bytes: Vec<u8>, name: &str, mime: &str) -> reqwest::multipart::Part {
    reqwest::multipart::Part::bytes(bytes)
        .file_name(name.to_string())
        .mime_str(mime)
        .unwrap()
}

/// SSE body whose text deltas concatenate to one JSON object.
fn gemini_sse() -> String {
    let deltas = [
        r#"{"comprehensive_summary": "Slab"#,
        r#" pour on level 2", "risk_and_compliance_analysis": "Fire stopping {TBC}"}"#,
    ];
    let mut body = String::new();
    for delta in deltas {
        let envelope = json!({
            "candidates": [{ "content": { "parts": [{ "text": delta }] } }]
        });
        body.push_str(&format!("data: {envelope}\r\n\r\n"));
    }
    body
}

async fn gemini_ok(uri: Uri) -> Response {
    assert!(uri.path().ends_with(":streamGenerateContent"), "{uri}");
    assert!(uri.query().unwrap_or_default().contains("alt=sse"));
    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        gemini_sse(),
    )
        .into_response()
}

async fn gemini_quota() -> Response {
    (StatusCode::TOO_MANY_REQUESTS, "Resource has been exhausted").into_response()
}

async fn converter_ok(body: axum::body::Bytes) -> Json<Value> {
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("name=\"file\""), "converter expects a `file` part");
    Json(json!({ "markdown": "# Specification\n\nConcrete grade C32/40." }))
}

async fn converter_rejects() -> Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({ "detail": "Unsupported document" })),
    )
        .into_response()
}

struct Upstreams {
    converter: SocketAddr,
    gemini: SocketAddr,
}

async fn upstreams(converter_fails: bool, gemini_fails: bool) -> Upstreams {
    let converter = if converter_fails {
        Router::new().route("/convert", post(converter_rejects))
    } else {
        Router::new().route("/convert", post(converter_ok))
    };
    let gemini = if gemini_fails {
        Router::new().fallback(gemini_quota)
    } else {
        Router::new().fallback(gemini_ok)
    };
    Upstreams {
        converter: spawn(converter).await,
        gemini: spawn(gemini).await,
    }
}

async fn service(up: &Upstreams, model: Arc<CountingModel>) -> SocketAddr {
    let config = AnalysisConfig::builder()
        .converter_url(format!("http://{}/convert", up.converter))
        .structured_endpoint(format!("http://{}/v1beta", up.gemini))
        .structured_api_key("test")
        .build()
        .unwrap();
    spawn(build_router(AppState::new(config).with_vision_model(model))).await
}

// ── /health ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_ok() {
    let up = upstreams(false, false).await;
    let addr = service(&up, Arc::default()).await;

    let body: Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

// ── /api/analyze-drawing ─────────────────────────────────────────────────────

#[tokio::test]
async fn analyze_drawing_defaults_to_two_by_two() {
    let up = upstreams(false, false).await;
    let model = Arc::new(CountingModel::default());
    let addr = service(&up, model.clone()).await;

    let form = reqwest::multipart::Form::new()
        .part("file", file_part(drawing_png(), "plan.png", "image/png"));
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/api/analyze-drawing"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body: Value = resp.json().await.unwrap();
    let result = &body["result"];
    assert_eq!(result["gridSize"], 2);
    assert_eq!(result["sections"].as_array().unwrap().len(), 4);
    assert_eq!(result["sections"][1]["gridPosition"], json!({ "x": 1, "y": 0 }));
    assert_eq!(result["summary"], "Ground floor plan with four doors.");
    assert_eq!(model.tiles.load(Ordering::SeqCst), 4);
    assert_eq!(model.summaries.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn analyze_drawing_honours_grid_size_field() {
    let up = upstreams(false, false).await;
    let model = Arc::new(CountingModel::default());
    let addr = service(&up, model.clone()).await;

    let form = reqwest::multipart::Form::new()
        .text("gridSize", "3")
        .text("fileType", "image/png")
        .part("file", file_part(drawing_png(), "plan.png", "image/png"));
    let body: Value = reqwest::Client::new()
        .post(format!("http://{addr}/api/analyze-drawing"))
        .multipart(form)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["result"]["gridSize"], 3);
    assert_eq!(body["result"]["sections"].as_array().unwrap().len(), 9);
    assert_eq!(
        body["result"]["sections"][8]["gridPosition"],
        json!({ "x": 2, "y": 2 })
    );
    assert_eq!(model.tiles.load(Ordering::SeqCst), 9);
}

#[tokio::test]
async fn analyze_drawing_without_file_is_bad_request() {
    let up = upstreams(false, false).await;
    let model = Arc::new(CountingModel::default());
    let addr = service(&up, model.clone()).await;

    let form = reqwest::multipart::Form::new().text("gridSize", "2");
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/api/analyze-drawing"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("file"));
    assert_eq!(model.tiles.load(Ordering::SeqCst), 0);
}

// ── /api/construction/gemini-analyze ─────────────────────────────────────────

#[tokio::test]
async fn gemini_analyze_streams_parsed_fragments() {
    let up = upstreams(false, false).await;
    let addr = service(&up, Arc::default()).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/api/construction/gemini-analyze"))
        .json(&json!({ "content": "# Spec\nSlab pour.", "systemPrompt": "Analyse." }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let text = resp.text().await.unwrap();
    let fragments: Vec<Value> = text
        .lines()
        .filter_map(|l| l.strip_prefix("data: "))
        .map(|d| serde_json::from_str(d).unwrap())
        .collect();
    assert_eq!(fragments.len(), 1, "{text}");
    assert_eq!(fragments[0]["comprehensive_summary"], "Slab pour on level 2");
    assert_eq!(fragments[0]["risk_and_compliance_analysis"], "Fire stopping {TBC}");
}

#[tokio::test]
async fn gemini_analyze_passes_upstream_status_through() {
    let up = upstreams(false, true).await;
    let addr = service(&up, Arc::default()).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/api/construction/gemini-analyze"))
        .json(&json!({ "content": "# Spec" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

    let body: Value = resp.json().await.unwrap();
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("Resource has been exhausted"));
}

#[tokio::test]
async fn gemini_analyze_requires_content() {
    let up = upstreams(false, false).await;
    let addr = service(&up, Arc::default()).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/api/construction/gemini-analyze"))
        .json(&json!({ "systemPrompt": "Analyse." }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("content"));
}

#[tokio::test]
async fn gemini_analyze_malformed_json_is_shaped_error() {
    let up = upstreams(false, false).await;
    let addr = service(&up, Arc::default()).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/api/construction/gemini-analyze"))
        .header(header::CONTENT_TYPE, "application/json")
        .body("{content: unquoted}")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("JSON"), "{body}");
}

#[tokio::test]
async fn analyze_drawing_rejects_non_multipart_body_as_shaped_error() {
    let up = upstreams(false, false).await;
    let model = Arc::new(CountingModel::default());
    let addr = service(&up, model.clone()).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/api/analyze-drawing"))
        .json(&json!({ "gridSize": 2 }))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_client_error());
    let body: Value = resp.json().await.unwrap();
    assert!(!body["error"].as_str().unwrap().is_empty(), "{body}");
    assert_eq!(model.tiles.load(Ordering::SeqCst), 0);
}

// ── /api/construction/analyze ────────────────────────────────────────────────

#[tokio::test]
async fn construction_analyze_returns_markdown() {
    let up = upstreams(false, false).await;
    let addr = service(&up, Arc::default()).await;

    let form = reqwest::multipart::Form::new().part(
        "file",
        file_part(b"%PDF-1.7 fake".to_vec(), "spec.pdf", "application/pdf"),
    );
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/api/construction/analyze"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/markdown"));
    assert_eq!(
        resp.text().await.unwrap(),
        "# Specification\n\nConcrete grade C32/40."
    );
}

#[tokio::test]
async fn construction_analyze_relays_converter_failure() {
    let up = upstreams(true, false).await;
    let addr = service(&up, Arc::default()).await;

    let form = reqwest::multipart::Form::new().part(
        "file",
        file_part(b"%PDF-1.7 fake".to_vec(), "spec.pdf", "application/pdf"),
    );
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/api/construction/analyze"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("Unsupported document"));
}

// ── /api/construction/pipeline ───────────────────────────────────────────────

#[tokio::test]
async fn pipeline_emits_named_events_in_phase_order() {
    let up = upstreams(false, false).await;
    let addr = service(&up, Arc::default()).await;

    let form = reqwest::multipart::Form::new()
        .text("systemPrompt", "Analyse the specification.")
        .part(
            "file",
            file_part(b"%PDF-1.7 fake".to_vec(), "spec.pdf", "application/pdf"),
        );
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/api/construction/pipeline"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let text = resp.text().await.unwrap();
    let names: Vec<&str> = text
        .lines()
        .filter_map(|l| l.strip_prefix("event: "))
        .collect();
    assert_eq!(
        names,
        vec!["markdown", "markdown_complete", "snapshot", "section", "section"],
        "{text}"
    );
    assert!(!text.contains("event: error"));
}

#[tokio::test]
async fn pipeline_reports_converter_failure_as_error_event() {
    let up = upstreams(true, false).await;
    let addr = service(&up, Arc::default()).await;

    let form = reqwest::multipart::Form::new().part(
        "file",
        file_part(b"%PDF-1.7 fake".to_vec(), "spec.pdf", "application/pdf"),
    );
    let text = reqwest::Client::new()
        .post(format!("http://{addr}/api/construction/pipeline"))
        .multipart(form)
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert!(text.contains("event: error"), "{text}");
    assert!(text.contains("\"status\":422"), "{text}");
    assert!(!text.contains("event: snapshot"));
}
