//! Tile partitioning and per-tile change classification.
//!
//! The grid is an indexed arena: tile `i` sits at row `i / cols`, column `i % cols`.
//! Tiles are evaluated independently and collected back in index order, so the
//! result does not depend on how work was spread across threads.

use image::Rgba;
use rayon::prelude::*;
use serde::Serialize;

use crate::codec::RasterImage;
use crate::config::DiffConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TileRect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl TileRect {
    pub fn area(&self) -> u64 {
        u64::from(self.w) * u64::from(self.h)
    }

    pub fn union(&self, other: &TileRect) -> TileRect {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let x2 = (self.x + self.w).max(other.x + other.w);
        let y2 = (self.y + self.h).max(other.y + other.h);
        TileRect {
            x,
            y,
            w: x2 - x,
            h: y2 - y,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TileGrid {
    pub width: u32,
    pub height: u32,
    pub tile_size: u32,
    pub cols: u32,
    pub rows: u32,
}

impl TileGrid {
    pub fn new(width: u32, height: u32, tile_size: u32) -> Self {
        let tile_size = tile_size.max(1);
        Self {
            width,
            height,
            tile_size,
            cols: width.div_ceil(tile_size),
            rows: height.div_ceil(tile_size),
        }
    }

    pub fn len(&self) -> usize {
        self.cols as usize * self.rows as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn index_of(&self, row: u32, col: u32) -> usize {
        row as usize * self.cols as usize + col as usize
    }

    pub fn position(&self, index: usize) -> (u32, u32) {
        let cols = self.cols as usize;
        ((index / cols) as u32, (index % cols) as u32)
    }

    /// Pixel bounds of a tile; edge tiles are truncated to the image.
    pub fn rect(&self, index: usize) -> TileRect {
        let (row, col) = self.position(index);
        let x = col * self.tile_size;
        let y = row * self.tile_size;
        TileRect {
            x,
            y,
            w: self.tile_size.min(self.width - x),
            h: self.tile_size.min(self.height - y),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tile {
    pub row: u32,
    pub col: u32,
    pub rect: TileRect,
    pub changed_pixels: u32,
    pub changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffResult {
    pub width: u32,
    pub height: u32,
    pub grid: TileGrid,
    pub tiles: Vec<Tile>,
    pub has_changes: bool,
}

impl DiffResult {
    pub fn changed_tiles(&self) -> impl Iterator<Item = &Tile> {
        self.tiles.iter().filter(|t| t.changed)
    }
}

/// Largest absolute difference across the four channels.
pub fn color_distance(a: Rgba<u8>, b: Rgba<u8>) -> u8 {
    a.0.iter()
        .zip(b.0.iter())
        .map(|(p, q)| p.abs_diff(*q))
        .max()
        .unwrap_or(0)
}

pub fn diff(previous: &RasterImage, current: &RasterImage, config: &DiffConfig) -> Result<DiffResult> {
    if previous.dimensions() != current.dimensions() {
        return Err(Error::DimensionMismatch {
            previous: previous.dimensions(),
            current: current.dimensions(),
        });
    }

    let (width, height) = current.dimensions();
    let grid = TileGrid::new(width, height, config.tile_size());
    let threshold = config.diff_threshold_pixel();
    let min_pixels = config.tile_pixel_threshold();

    let tiles: Vec<Tile> = (0..grid.len())
        .into_par_iter()
        .map(|index| {
            let rect = grid.rect(index);
            let (row, col) = grid.position(index);
            let changed_pixels = count_changed(previous, current, rect, threshold);
            Tile {
                row,
                col,
                rect,
                changed_pixels,
                changed: changed_pixels >= min_pixels,
            }
        })
        .collect();

    let has_changes = tiles.iter().any(|t| t.changed);
    log::debug!(
        "diffed {}x{} as {}x{} tiles, {} changed",
        width,
        height,
        grid.cols,
        grid.rows,
        tiles.iter().filter(|t| t.changed).count()
    );

    Ok(DiffResult {
        width,
        height,
        grid,
        tiles,
        has_changes,
    })
}

fn count_changed(previous: &RasterImage, current: &RasterImage, rect: TileRect, threshold: u8) -> u32 {
    let mut count = 0u32;
    for y in rect.y..rect.y + rect.h {
        for x in rect.x..rect.x + rect.w {
            if color_distance(previous.pixel(x, y), current.pixel(x, y)) > threshold {
                count += 1;
            }
        }
    }
    count
}
