//! PDF page selection and rasterisation via pdfium.
//!
//! Only one page of a PDF is ever analysed per grid request, so this stage
//! validates the requested page against the document's page count and renders
//! exactly that page.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which is CPU-bound and keeps
//! thread-local state. `tokio::task::spawn_blocking` moves the work onto the
//! blocking pool so async worker threads never stall during rendering.
//!
//! ## Why cap pixels?
//!
//! Drawing sheets are large (A1/A0). `max_rendered_pixels` caps the longest
//! edge so an A0 sheet does not turn into a 17 000 px bitmap before it is even
//! split into tiles.

use crate::error::AnalysisError;
use image::DynamicImage;
use pdfium_render::prelude::*;
use tracing::{debug, info};

/// Number of pages in a PDF held in memory.
pub async fn page_count(pdf: Vec<u8>) -> Result<usize, AnalysisError> {
    tokio::task::spawn_blocking(move || -> Result<usize, AnalysisError> {
        let pdfium = bind_pdfium()?;
        let document = load(&pdfium, &pdf)?;
        let total = document.pages().len() as usize;
        Ok(total)
    })
    .await
    .map_err(|e| AnalysisError::Internal(format!("Page count task panicked: {}", e)))?
}

/// Render the 1-indexed `page_number` of a PDF to an image.
///
/// Fails with [`AnalysisError::InvalidPage`] unless `1 ≤ page_number ≤ page count`.
pub async fn render_page(
    pdf: Vec<u8>,
    page_number: usize,
    max_pixels: u32,
) -> Result<DynamicImage, AnalysisError> {
    tokio::task::spawn_blocking(move || render_page_blocking(&pdf, page_number, max_pixels))
        .await
        .map_err(|e| AnalysisError::Internal(format!("Render task panicked: {}", e)))?
}

/// Check a 1-indexed page number against the page count and return its 0-based index.
pub fn validate_page(page_number: usize, total_pages: usize) -> Result<usize, AnalysisError> {
    if page_number == 0 || page_number > total_pages {
        return Err(AnalysisError::InvalidPage {
            page: page_number,
            total: total_pages,
        });
    }
    Ok(page_number - 1)
}

fn render_page_blocking(
    pdf: &[u8],
    page_number: usize,
    max_pixels: u32,
) -> Result<DynamicImage, AnalysisError> {
    let pdfium = bind_pdfium()?;
    let document = load(&pdfium, pdf)?;

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    let index = validate_page(page_number, total_pages)?;
    info!("PDF loaded: {} pages, rendering page {}", total_pages, page_number);

    let render_config = PdfRenderConfig::new()
        .set_target_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);

    let page = pages
        .get(index as u16)
        .map_err(|e| AnalysisError::RasterisationFailed {
            page: page_number,
            detail: format!("{:?}", e),
        })?;

    let bitmap = page
        .render_with_config(&render_config)
        .map_err(|e| AnalysisError::RasterisationFailed {
            page: page_number,
            detail: format!("{:?}", e),
        })?;

    let image = bitmap.as_image();
    debug!(
        "Rendered page {} → {}x{} px",
        page_number,
        image.width(),
        image.height()
    );
    Ok(image)
}

fn load<'a>(pdfium: &'a Pdfium, pdf: &'a [u8]) -> Result<PdfDocument<'a>, AnalysisError> {
    pdfium
        .load_pdf_from_byte_slice(pdf, None)
        .map_err(|e| AnalysisError::CorruptPdf {
            detail: format!("{:?}", e),
        })
}

/// Bind pdfium: `PDFIUM_LIB_PATH`, then the working directory, then the system library.
fn bind_pdfium() -> Result<Pdfium, AnalysisError> {
    let bindings = match std::env::var("PDFIUM_LIB_PATH") {
        Ok(path) if !path.is_empty() => Pdfium::bind_to_library(path),
        _ => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
            .or_else(|_| Pdfium::bind_to_system_library()),
    }
    .map_err(|e| AnalysisError::PdfiumBindingFailed(format!("{:?}", e)))?;

    Ok(Pdfium::new(bindings))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_and_last_page_are_valid() {
        assert_eq!(validate_page(1, 3).unwrap(), 0);
        assert_eq!(validate_page(3, 3).unwrap(), 2);
    }

    #[test]
    fn page_zero_is_rejected() {
        let err = validate_page(0, 3).unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidPage { page: 0, total: 3 }));
    }

    #[test]
    fn page_past_end_is_rejected() {
        let err = validate_page(4, 3).unwrap_err();
        assert_eq!(err.to_string(), "Invalid page number: 4. PDF has 3 pages.");
    }
}
