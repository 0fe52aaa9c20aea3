//! Named polygon regions and their rasterized masks
//!
//! **Why**: Every statistic in this crate is "over a region". Regions arrive
//! as loosely-specified polygon maps from configuration; here they become a
//! fixed struct with resolved styling defaults, and a byte mask built lazily
//! only when fill or statistics actually need the O(width*height) work.
//!
//! # Rasterization convention
//!
//! Even-odd scanline fill at integer pixel coordinates, plus the polygon
//! outline itself (Bresenham, inclusive endpoints). Boundary pixels count as
//! inside, so a full-image rectangle polygon covers exactly width*height
//! pixels. Deterministic for a given polygon + canvas size.

use serde::{Deserialize, Serialize};

use crate::buffer::ImageBuffer;

fn default_color() -> [u8; 3] {
    [0, 255, 0]
}

fn default_thickness() -> u32 {
    2
}

fn default_closed() -> bool {
    true
}

/// Named polygon annotation area
///
/// The name lives in the surrounding map; repeated overlay under the same
/// name replaces the definition and invalidates the cached mask. Styling
/// defaults (green, 2px, no fill) resolve at deserialization, not inside the
/// engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    /// Ordered vertices in pixel coordinates.
    pub points: Vec<[f32; 2]>,
    /// Border color, RGB.
    #[serde(default = "default_color")]
    pub color: [u8; 3],
    /// Outline thickness in pixels.
    #[serde(default = "default_thickness")]
    pub thickness: u32,
    /// Fill opacity in [0, 1]; 0 disables fill (and mask building at overlay time).
    #[serde(default)]
    pub alpha: f32,
    /// Whether the last vertex connects back to the first.
    #[serde(default = "default_closed")]
    pub closed: bool,
}

impl Region {
    /// Axis-aligned rectangle polygon, inclusive corners.
    pub fn rect(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self {
            points: vec![[x0, y0], [x1, y0], [x1, y1], [x0, y1]],
            color: default_color(),
            thickness: default_thickness(),
            alpha: 0.0,
            closed: true,
        }
    }
}

/// Bounding rectangle in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Rect {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

/// Binary pixel membership mask for a Region
///
/// One byte per pixel, 1 = inside. Built lazily, cached per region name by
/// the engine, invalidated when the region or the image changes.
#[derive(Debug, Clone)]
pub struct RegionMask {
    width: usize,
    height: usize,
    data: Vec<u8>,
}

impl RegionMask {
    /// Rasterize a polygon onto a width x height canvas.
    ///
    /// Polygons with fewer than 3 vertices produce an empty mask; callers
    /// substitute zeroed statistics rather than failing.
    pub fn build(region: &Region, width: usize, height: usize) -> Self {
        let mut mask = Self {
            width,
            height,
            data: vec![0u8; width * height],
        };

        let pts = &region.points;
        if pts.len() < 3 || width == 0 || height == 0 {
            return mask;
        }

        // Even-odd scanline pass at integer rows
        let mut crossings: Vec<f32> = Vec::with_capacity(pts.len());
        for y in 0..height {
            let yf = y as f32;
            crossings.clear();
            for i in 0..pts.len() {
                let [x0, y0] = pts[i];
                let [x1, y1] = pts[(i + 1) % pts.len()];
                if (y0 > yf) != (y1 > yf) {
                    crossings.push(x0 + (yf - y0) * (x1 - x0) / (y1 - y0));
                }
            }
            crossings.sort_by(|a, b| a.total_cmp(b));
            for pair in crossings.chunks(2) {
                if pair.len() < 2 {
                    break;
                }
                let xa = pair[0].ceil().max(0.0) as usize;
                let xb = pair[1].floor().min((width - 1) as f32);
                if xb < 0.0 {
                    continue;
                }
                let xb = xb as usize;
                for x in xa..=xb.min(width - 1) {
                    mask.data[y * width + x] = 1;
                }
            }
        }

        // Outline pass so boundary pixels are members even where the scanline
        // convention excludes them (horizontal edges, vertex rows)
        for i in 0..pts.len() {
            if i + 1 == pts.len() && !region.closed {
                break;
            }
            let a = pts[i];
            let b = pts[(i + 1) % pts.len()];
            mask.mark_line(a, b);
        }

        mask
    }

    /// Bresenham walk between two vertices, marking each visited pixel.
    fn mark_line(&mut self, a: [f32; 2], b: [f32; 2]) {
        let (mut x0, mut y0) = (a[0].round() as i64, a[1].round() as i64);
        let (x1, y1) = (b[0].round() as i64, b[1].round() as i64);

        let dx = (x1 - x0).abs();
        let dy = -(y1 - y0).abs();
        let sx = if x0 < x1 { 1 } else { -1 };
        let sy = if y0 < y1 { 1 } else { -1 };
        let mut err = dx + dy;

        loop {
            if x0 >= 0 && y0 >= 0 && (x0 as usize) < self.width && (y0 as usize) < self.height {
                self.data[y0 as usize * self.width + x0 as usize] = 1;
            }
            if x0 == x1 && y0 == y1 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x0 += sx;
            }
            if e2 <= dx {
                err += dx;
                y0 += sy;
            }
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
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn contains(&self, x: usize, y: usize) -> bool {
        x < self.width && y < self.height && self.data[y * self.width + x] != 0
    }

    /// Number of member pixels.
    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&v| v != 0).count()
    }

    /// Tight bounding rectangle of the mask, or None for an empty mask.
    pub fn bounding_rect(&self) -> Option<Rect> {
        let mut min_x = usize::MAX;
        let mut min_y = usize::MAX;
        let mut max_x = 0usize;
        let mut max_y = 0usize;
        let mut any = false;

        for y in 0..self.height {
            let row = &self.data[y * self.width..(y + 1) * self.width];
            if let Some(first) = row.iter().position(|&v| v != 0) {
                let last = self.width - 1 - row.iter().rev().position(|&v| v != 0).unwrap();
                any = true;
                min_x = min_x.min(first);
                max_x = max_x.max(last);
                min_y = min_y.min(y);
                max_y = y;
            }
        }

        if !any {
            return None;
        }
        Some(Rect {
            x: min_x,
            y: min_y,
            width: max_x - min_x + 1,
            height: max_y - min_y + 1,
        })
    }
}

/// Draw a region outline onto a buffer, stamping a thickness x thickness
/// square at each line pixel. Clips at the frame edge.
pub fn draw_outline(region: &Region, buffer: &mut ImageBuffer) {
    let pts = &region.points;
    if pts.len() < 2 {
        return;
    }

    let radius = (region.thickness.max(1) as i64 - 1) / 2;
    let last = if region.closed { pts.len() } else { pts.len() - 1 };

    for i in 0..last {
        let a = pts[i];
        let b = pts[(i + 1) % pts.len()];
        stamp_line(buffer, a, b, region.color, radius);
    }
}

fn stamp_line(buffer: &mut ImageBuffer, a: [f32; 2], b: [f32; 2], color: [u8; 3], radius: i64) {
    let (mut x0, mut y0) = (a[0].round() as i64, a[1].round() as i64);
    let (x1, y1) = (b[0].round() as i64, b[1].round() as i64);

    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;

    loop {
        for oy in -radius..=radius.max(0) {
            for ox in -radius..=radius.max(0) {
                let (px, py) = (x0 + ox, y0 + oy);
                if px >= 0 && py >= 0 {
                    buffer.set_pixel(px as usize, py as usize, color);
                }
            }
        }
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test: Full-frame rectangle covers every pixel
    /// Validates: Boundary-inclusive rasterization convention
    #[test]
    fn test_full_frame_rect_mask() {
        let region = Region::rect(0.0, 0.0, 15.0, 9.0);
        let mask = RegionMask::build(&region, 16, 10);
        assert_eq!(mask.count(), 16 * 10);
    }

    /// Test: Partial rectangle
    /// Validates: Inclusive row/column extents
    #[test]
    fn test_partial_rect_mask() {
        let region = Region::rect(2.0, 3.0, 6.0, 7.0);
        let mask = RegionMask::build(&region, 10, 10);
        // 5 columns (2..=6) x 5 rows (3..=7)
        assert_eq!(mask.count(), 25);
        assert!(mask.contains(2, 3));
        assert!(mask.contains(6, 7));
        assert!(!mask.contains(1, 3));
        assert!(!mask.contains(2, 8));

        let rect = mask.bounding_rect().unwrap();
        assert_eq!(rect, Rect { x: 2, y: 3, width: 5, height: 5 });
    }

    /// Test: Triangle fill
    /// Validates: Even-odd fill handles non-rectangular polygons
    #[test]
    fn test_triangle_mask() {
        let region = Region {
            points: vec![[0.0, 0.0], [9.0, 0.0], [0.0, 9.0]],
            ..Region::rect(0.0, 0.0, 0.0, 0.0)
        };
        let mask = RegionMask::build(&region, 10, 10);

        // Hypotenuse corner excluded, right-angle corner included
        assert!(mask.contains(0, 0));
        assert!(mask.contains(4, 4));
        assert!(!mask.contains(9, 9));
        // Roughly half the square
        let count = mask.count();
        assert!(count > 40 && count < 70, "count = {}", count);
    }

    /// Test: Degenerate polygons
    /// Validates: <3 vertices yields an empty mask, not an error
    #[test]
    fn test_degenerate_mask() {
        let region = Region {
            points: vec![[1.0, 1.0], [5.0, 5.0]],
            ..Region::rect(0.0, 0.0, 0.0, 0.0)
        };
        let mask = RegionMask::build(&region, 10, 10);
        assert_eq!(mask.count(), 0);
        assert!(mask.bounding_rect().is_none());
    }

    /// Test: Region deserialization defaults
    /// Validates: Styling defaults resolve at the config boundary
    #[test]
    fn test_region_defaults() {
        let region: Region =
            serde_json::from_str(r#"{ "points": [[0,0],[4,0],[4,4],[0,4]] }"#).unwrap();
        assert_eq!(region.color, [0, 255, 0]);
        assert_eq!(region.thickness, 2);
        assert_eq!(region.alpha, 0.0);
        assert!(region.closed);
    }

    /// Test: Outline drawing
    /// Validates: Edge pixels take the region color, clipping is silent
    #[test]
    fn test_draw_outline() {
        let mut buf = ImageBuffer::new(10, 10);
        let mut region = Region::rect(0.0, 0.0, 9.0, 9.0);
        region.color = [255, 0, 0];
        region.thickness = 1;
        draw_outline(&region, &mut buf);

        assert_eq!(buf.pixel(0, 0), [255, 0, 0]);
        assert_eq!(buf.pixel(9, 0), [255, 0, 0]);
        assert_eq!(buf.pixel(5, 9), [255, 0, 0]);
        // Interior untouched
        assert_eq!(buf.pixel(5, 5), [0, 0, 0]);
    }
}
