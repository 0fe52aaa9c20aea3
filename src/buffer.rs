//! Decoded raster buffer with RGB channel order
//!
//! **Why**: Analysis (bands, region statistics) and display (overlays) both
//! operate on one flat byte buffer; keeping it a plain `Vec<u8>` makes memory
//! accounting exact and chunked row processing trivial.
//!
//! **Used by**: Engine (active/original buffers), AdaptiveLoader (decode),
//! BoundedCache (size accounting via `MemSize`)
//!
//! # Channel order
//!
//! Pixels are stored interleaved RGB, 1 byte per sample, no alpha. Every
//! statistic in this crate that says "r" means the first stored channel.

use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};

/// Samples per pixel. This core is RGB-only; alpha is dropped at decode time.
pub const CHANNELS: usize = 3;

/// Byte size of a value for cache accounting.
pub trait MemSize {
    /// Memory footprint in bytes.
    fn mem(&self) -> usize;
}

impl MemSize for Vec<u8> {
    fn mem(&self) -> usize {
        self.len()
    }
}

/// Decoded raster, one owner
///
/// Created on load, replaced on reset/reload. The engine holds at most two of
/// these at a time (active + optional original).
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBuffer {
    width: usize,
    height: usize,
    data: Vec<u8>,
}

impl ImageBuffer {
    /// Create a zeroed buffer (black frame).
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0u8; width * height * CHANNELS],
        }
    }

    /// Create a buffer filled with a single color. Handy for synthetic frames.
    pub fn filled(width: usize, height: usize, rgb: [u8; 3]) -> Self {
        let mut data = vec![0u8; width * height * CHANNELS];
        for px in data.chunks_mut(CHANNELS) {
            px.copy_from_slice(&rgb);
        }
        Self { width, height, data }
    }

    /// Convert a decoded image, dropping alpha if present.
    pub fn from_dynamic(img: DynamicImage) -> Self {
        let rgb = img.to_rgb8();
        Self::from_rgb(rgb)
    }

    pub fn from_rgb(img: RgbImage) -> Self {
        let width = img.width() as usize;
        let height = img.height() as usize;
        Self {
            width,
            height,
            data: img.into_raw(),
        }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn channels(&self) -> usize {
        CHANNELS
    }

    /// Resolution as (width, height).
    pub fn resolution(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Flat index of the first sample of pixel (x, y).
    #[inline]
    pub fn idx(&self, x: usize, y: usize) -> usize {
        (y * self.width + x) * CHANNELS
    }

    /// Read one pixel as [r, g, b].
    #[inline]
    pub fn pixel(&self, x: usize, y: usize) -> [u8; 3] {
        let i = self.idx(x, y);
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    /// Write one pixel. Out-of-bounds coordinates are ignored so overlay
    /// drawing can clip without branching at every call site.
    #[inline]
    pub fn set_pixel(&mut self, x: usize, y: usize, rgb: [u8; 3]) {
        if x < self.width && y < self.height {
            let i = self.idx(x, y);
            self.data[i..i + 3].copy_from_slice(&rgb);
        }
    }

    /// Alpha-blend a color onto one pixel: out = (1-a)*px + a*color.
    #[inline]
    pub fn blend_pixel(&mut self, x: usize, y: usize, rgb: [u8; 3], alpha: f32) {
        if x >= self.width || y >= self.height {
            return;
        }
        let a = alpha.clamp(0.0, 1.0);
        let i = self.idx(x, y);
        for c in 0..CHANNELS {
            let src = self.data[i + c] as f32;
            self.data[i + c] = ((1.0 - a) * src + a * rgb[c] as f32).round() as u8;
        }
    }

    /// View as an `image::RgbImage` for resampling/encoding.
    pub fn to_rgb_image(&self) -> RgbImage {
        RgbImage::from_raw(self.width as u32, self.height as u32, self.data.clone())
            .expect("RGB buffer length matches dimensions")
    }

    /// Bilinear resize by a linear factor. Dimensions are rounded and clamped
    /// to at least 1 pixel.
    pub fn resized(&self, factor: f64) -> ImageBuffer {
        let nw = ((self.width as f64 * factor).round() as u32).max(1);
        let nh = ((self.height as f64 * factor).round() as u32).max(1);
        let resized = image::imageops::resize(&self.to_rgb_image(), nw, nh, FilterType::Triangle);
        Self::from_rgb(resized)
    }
}

impl MemSize for ImageBuffer {
    fn mem(&self) -> usize {
        self.data.len()
    }
}

/// RGB (0..=255 per channel) to HSV with h in degrees [0, 360), s and v in [0, 1].
pub fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (f32, f32, f32) {
    let r = r as f32 / 255.0;
    let g = g as f32 / 255.0;
    let b = b as f32 / 255.0;

    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let h = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (((g - b) / delta).rem_euclid(6.0))
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };

    let s = if max == 0.0 { 0.0 } else { delta / max };

    (h, s, max)
}
