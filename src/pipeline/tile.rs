//! Grid tiling: split a raster drawing into `g × g` non-overlapping tiles.
//!
//! Tile size is `(⌊W/g⌋, ⌊H/g⌋)` for every tile. When `W` or `H` is not a
//! multiple of `g`, the leftover right/bottom pixel strip is not covered by any
//! tile. Tiles are produced row-major (`y` outer, `x` inner); that order is the
//! submission order to the vision model and the order of the final result, and
//! the "row R, column C" labels in the prompts depend on it.

use crate::error::AnalysisError;
use crate::output::GridPosition;
use crate::pipeline::encode;
use image::DynamicImage;
use tracing::debug;

/// One tile of a drawing, PNG-encoded.
#[derive(Clone)]
pub struct GridSection {
    /// 0-indexed column.
    pub x: u32,
    /// 0-indexed row.
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub png: Vec<u8>,
}

impl GridSection {
    pub fn position(&self) -> GridPosition {
        GridPosition {
            x: self.x,
            y: self.y,
        }
    }
}

impl std::fmt::Debug for GridSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridSection")
            .field("x", &self.x)
            .field("y", &self.y)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("png_bytes", &self.png.len())
            .finish()
    }
}

/// Decode raw image bytes, mapping any failure to `InvalidDimensions`.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, AnalysisError> {
    image::load_from_memory(bytes).map_err(|e| AnalysisError::InvalidDimensions {
        detail: e.to_string(),
    })
}

/// Row-major grid coordinates: `(0,0), (1,0), …, (g-1,0), (0,1), …`.
pub fn grid_positions(grid_size: u32) -> impl Iterator<Item = GridPosition> {
    (0..grid_size).flat_map(move |y| (0..grid_size).map(move |x| GridPosition { x, y }))
}

/// Tile size for an image of `width × height` split `grid_size` ways.
///
/// Rejects a zero image dimension and grids finer than the image (which
/// would yield zero-sized tiles).
pub fn tile_dimensions(
    width: u32,
    height: u32,
    grid_size: u32,
) -> Result<(u32, u32), AnalysisError> {
    if grid_size == 0 {
        return Err(AnalysisError::InvalidConfig("Grid size must be ≥ 1".into()));
    }
    if width == 0 || height == 0 {
        return Err(AnalysisError::InvalidDimensions {
            detail: format!("image is {}x{} px", width, height),
        });
    }
    let (tw, th) = (width / grid_size, height / grid_size);
    if tw == 0 || th == 0 {
        return Err(AnalysisError::InvalidDimensions {
            detail: format!(
                "{}x{} px image is too small for a {}x{} grid",
                width, height, grid_size, grid_size
            ),
        });
    }
    Ok((tw, th))
}

/// Split `image` into `grid_size²` PNG tiles in row-major order.
pub fn split_into_grid(
    image: &DynamicImage,
    grid_size: u32,
) -> Result<Vec<GridSection>, AnalysisError> {
    let (tw, th) = tile_dimensions(image.width(), image.height(), grid_size)?;
    debug!(
        "Tiling {}x{} px into {}x{} grid of {}x{} px tiles",
        image.width(),
        image.height(),
        grid_size,
        grid_size,
        tw,
        th
    );

    grid_positions(grid_size)
        .map(|pos| {
            let tile = image.crop_imm(pos.x * tw, pos.y * th, tw, th);
            let png = encode::to_png(&tile).map_err(|e| AnalysisError::Internal(format!(
                "Tile ({}, {}) encoding failed: {}",
                pos.x, pos.y, e
            )))?;
            Ok(GridSection {
                x: pos.x,
                y: pos.y,
                width: tw,
                height: th,
                png,
            })
        })
        .collect()
}
