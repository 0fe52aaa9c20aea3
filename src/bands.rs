//! Per-pixel analytical bands: RGB separation and chromatic coordinates
//!
//! **Why**: Vegetation analysis works on normalized chromatic coordinates
//! (channel / channel-sum), not raw RGB; both band families are expensive on
//! multi-megapixel frames and are computed once, cached by the engine, and
//! reused across region statistics.
//!
//! # Chunking
//!
//! Chromatic coordinates are computed in horizontal row windows of at most
//! [`CHUNK_ROWS`] rows so peak scratch memory stays bounded by one window,
//! never the whole frame.

use crate::buffer::{ImageBuffer, MemSize};

/// Maximum rows processed per window in chunked band/statistics passes.
pub const CHUNK_ROWS: usize = 500;

/// Channel-split byte planes of the source buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct RgbBands {
    pub r: Vec<u8>,
    pub g: Vec<u8>,
    pub b: Vec<u8>,
    width: usize,
    height: usize,
}

impl RgbBands {
    pub fn compute(src: &ImageBuffer) -> Self {
        let (width, height) = src.resolution();
        let n = width * height;
        let mut r = Vec::with_capacity(n);
        let mut g = Vec::with_capacity(n);
        let mut b = Vec::with_capacity(n);

        for px in src.data().chunks_exact(3) {
            r.push(px[0]);
            g.push(px[1]);
            b.push(px[2]);
        }

        Self { r, g, b, width, height }
    }

    pub fn resolution(&self) -> (usize, usize) {
        (self.width, self.height)
    }
}

impl MemSize for RgbBands {
    fn mem(&self) -> usize {
        self.r.len() + self.g.len() + self.b.len()
    }
}

/// Chromatic coordinates: per pixel, channel / (R+G+B)
///
/// The float planes are the analytical product; `composite` is a
/// normalized-to-byte merge of the three planes for display only.
#[derive(Debug, Clone, PartialEq)]
pub struct ChromaticBands {
    pub r: Vec<f32>,
    pub g: Vec<f32>,
    pub b: Vec<f32>,
    /// Interleaved RGB visualization, 255 * coordinate per channel.
    pub composite: Vec<u8>,
    width: usize,
    height: usize,
}

impl ChromaticBands {
    /// Compute chromatic coordinates in row windows of at most CHUNK_ROWS.
    ///
    /// The denominator R+G+B is clamped to a minimum of 1 so black pixels
    /// yield (0, 0, 0) instead of dividing by zero.
    pub fn compute(src: &ImageBuffer) -> Self {
        let (width, height) = src.resolution();
        let n = width * height;
        let mut r = vec![0.0f32; n];
        let mut g = vec![0.0f32; n];
        let mut b = vec![0.0f32; n];
        let mut composite = vec![0u8; n * 3];

        let chunk = CHUNK_ROWS.min(height.max(1));
        let data = src.data();

        let mut row = 0;
        while row < height {
            let end = (row + chunk).min(height);
            for y in row..end {
                for x in 0..width {
                    let p = y * width + x;
                    let i = p * 3;
                    let (pr, pg, pb) = (data[i] as f32, data[i + 1] as f32, data[i + 2] as f32);
                    let denom = (pr + pg + pb).max(1.0);

                    let cr = pr / denom;
                    let cg = pg / denom;
                    let cb = pb / denom;
                    r[p] = cr;
                    g[p] = cg;
                    b[p] = cb;
                    composite[i] = (cr * 255.0).round() as u8;
                    composite[i + 1] = (cg * 255.0).round() as u8;
                    composite[i + 2] = (cb * 255.0).round() as u8;
                }
            }
            row = end;
        }

        Self { r, g, b, composite, width, height }
    }

    pub fn resolution(&self) -> (usize, usize) {
        (self.width, self.height)
    }
}

impl MemSize for ChromaticBands {
    fn mem(&self) -> usize {
        (self.r.len() + self.g.len() + self.b.len()) * 4 + self.composite.len()
    }
}

/// Normalized vegetation index (G-R)/(G+R), a simple greenness proxy.
///
/// Epsilon-guarded: a zero denominator (black pixel) yields 0.
#[inline]
pub fn vegetation_index(r: u8, g: u8) -> f32 {
    let (r, g) = (r as f32, g as f32);
    let denom = g + r;
    if denom < 1e-6 { 0.0 } else { (g - r) / denom }
}
