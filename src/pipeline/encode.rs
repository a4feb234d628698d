//! Image encoding for the vision API: PNG bytes → base64 `ImageData`.
//!
//! Tiles are PNG-encoded once by the tiler; this stage only wraps them for the
//! multimodal request body. PNG keeps thin linework and small annotation text
//! crisp, which matters more for drawings than upload size.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode an image as PNG bytes.
pub fn to_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}

/// Wrap PNG bytes as a base64 image attachment.
///
/// `detail: "high"` asks GPT-4-class models to read the image at full tile
/// resolution; dimension strings and callouts vanish at `"low"`.
pub fn to_image_data(png: &[u8]) -> ImageData {
    let b64 = STANDARD.encode(png);
    debug!("Encoded tile → {} bytes base64", b64.len());
    ImageData::new(b64, "image/png").with_detail("high")
}
