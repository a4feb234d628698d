//! Input resolution: turn an upload, a local path or a URL into a [`SourceDocument`].
//!
//! Everything downstream works on in-memory bytes: pdfium can open a byte
//! slice, `image` decodes from memory and the converter upload is a multipart
//! body. Resolving once up front means the grid and document pipelines never
//! touch the file system or the network for their input.

use crate::error::AnalysisError;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// What kind of raster source a document is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Paginated; a page must be selected and rendered before tiling.
    Pdf,
    /// Already a raster image (PNG, JPEG).
    Image,
}

impl SourceKind {
    /// Decide the kind from an explicit hint (`"pdf"`, a MIME type or a file
    /// name) and, failing that, from the `%PDF` magic bytes.
    pub fn detect(bytes: &[u8], hint: Option<&str>) -> Self {
        if let Some(hint) = hint.map(|h| h.trim().to_ascii_lowercase()) {
            if hint == "pdf" || hint == "application/pdf" || hint.ends_with(".pdf") {
                return SourceKind::Pdf;
            }
        }
        if bytes.starts_with(b"%PDF") {
            SourceKind::Pdf
        } else {
            SourceKind::Image
        }
    }
}

/// A resolved input document held in memory.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    /// File name used for logging and for the converter upload.
    pub name: String,
    pub bytes: Vec<u8>,
    pub kind: SourceKind,
}

impl SourceDocument {
    /// Wrap uploaded bytes. `hint` is the client's file-type field, MIME type or file name.
    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>, hint: Option<&str>) -> Self {
        let name = name.into();
        let kind = SourceKind::detect(&bytes, hint.or(Some(name.as_str())));
        Self { name, bytes, kind }
    }

    pub fn is_pdf(&self) -> bool {
        self.kind == SourceKind::Pdf
    }

    /// MIME type announced to the converter.
    pub fn mime_type(&self) -> &'static str {
        match self.kind {
            SourceKind::Pdf => "application/pdf",
            SourceKind::Image if self.bytes.starts_with(&[0xFF, 0xD8]) => "image/jpeg",
            SourceKind::Image => "image/png",
        }
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve a local path or HTTP(S) URL into an in-memory document.
pub async fn resolve_input(
    input: &str,
    timeout_secs: u64,
) -> Result<SourceDocument, AnalysisError> {
    if input.trim().is_empty() {
        return Err(AnalysisError::InvalidInput {
            input: input.to_string(),
        });
    }
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        read_local(Path::new(input)).await
    }
}

async fn read_local(path: &Path) -> Result<SourceDocument, AnalysisError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => AnalysisError::FileNotFound {
            path: path.to_path_buf(),
        },
        std::io::ErrorKind::PermissionDenied => AnalysisError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => AnalysisError::InvalidInput {
            input: format!("{}: {}", path.display(), e),
        },
    })?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| PathBuf::from(path).display().to_string());
    debug!("Read local input {} ({} bytes)", path.display(), bytes.len());
    Ok(SourceDocument::from_bytes(name, bytes, None))
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<SourceDocument, AnalysisError> {
    info!("Downloading input from: {}", url);

    let failed = |reason: String| AnalysisError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            failed(format!("timed out after {timeout_secs}s"))
        } else {
            failed(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let bytes = response
        .bytes()
        .await
        .map_err(|e| failed(e.to_string()))?
        .to_vec();

    let name = extract_filename(url);
    let hint = content_type.as_deref().unwrap_or(name.as_str());
    info!("Downloaded {} bytes from {}", bytes.len(), url);
    Ok(SourceDocument::from_bytes(name.clone(), bytes, Some(hint)))
}

/// Extract a reasonable filename from the URL path.
fn extract_filename(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.contains('.') {
                    return last.to_string();
                }
            }
        }
    }

    "download".to_string()
}
