//! Edge-energy box finder.
//!
//! The frame is downscaled to a fixed analysis width, Sobel gradient
//! magnitude is accumulated into a summed-area table, and a coarse grid of
//! aspect-constrained rectangles is scored by mean edge energy. The winner is
//! scaled back to frame coordinates.

use image::imageops::FilterType;
use serde::Serialize;

use crate::image_impl::{self, luminance, Frame, Point2f, Size};
use crate::types::EdgeBoxConfig;

/// Axis-aligned region in frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoxRegion {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub score: f32,
}

impl BoxRegion {
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h, score: 0.0 }
    }

    pub fn center(&self) -> Point2f {
        Point2f::new(
            self.x as f32 + self.w as f32 / 2.0,
            self.y as f32 + self.h as f32 / 2.0,
        )
    }

    pub fn area(&self) -> u64 {
        self.w as u64 * self.h as u64
    }

    pub fn right(&self) -> u32 {
        self.x + self.w
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.h
    }

    /// Clockwise from top-left.
    pub fn corners(&self) -> [Point2f; 4] {
        let (x0, y0) = (self.x as f32, self.y as f32);
        let (x1, y1) = (self.right() as f32, self.bottom() as f32);
        [
            Point2f::new(x0, y0),
            Point2f::new(x1, y0),
            Point2f::new(x1, y1),
            Point2f::new(x0, y1),
        ]
    }

    /// Shrink to fit a `width` x `height` frame, keeping at least one pixel.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let x = self.x.min(width.saturating_sub(1));
        let y = self.y.min(height.saturating_sub(1));
        let w = self.w.clamp(1, width - x);
        let h = self.h.clamp(1, height - y);
        Self { x, y, w, h, score: self.score }
    }
}

/// Sobel gradient magnitude of a row-major luminance plane. Border pixels are 0.
pub fn sobel_magnitude(gray: &[f32], width: usize, height: usize) -> Vec<f32> {
    let mut mag = vec![0f32; width * height];
    if width < 3 || height < 3 {
        return mag;
    }

    for y in 1..height - 1 {
        let up = (y - 1) * width;
        let mid = y * width;
        let down = (y + 1) * width;
        for x in 1..width - 1 {
            let gx = -gray[up + x - 1] + gray[up + x + 1] - 2.0 * gray[mid + x - 1]
                + 2.0 * gray[mid + x + 1]
                - gray[down + x - 1]
                + gray[down + x + 1];
            let gy = gray[up + x - 1] + 2.0 * gray[up + x] + gray[up + x + 1]
                - gray[down + x - 1]
                - 2.0 * gray[down + x]
                - gray[down + x + 1];
            mag[mid + x] = (gx * gx + gy * gy).sqrt();
        }
    }
    mag
}

/// Summed-area table with a zero row and column, `(W+1) x (H+1)` entries.
#[derive(Debug, Clone)]
pub struct IntegralImage {
    width: usize,
    height: usize,
    table: Vec<f64>,
}

impl IntegralImage {
    pub fn new(values: &[f32], width: usize, height: usize) -> Self {
        let stride = width + 1;
        let mut table = vec![0f64; stride * (height + 1)];
        for y in 0..height {
            let mut row = 0f64;
            for x in 0..width {
                row += values[y * width + x] as f64;
                table[(y + 1) * stride + x + 1] = table[y * stride + x + 1] + row;
            }
        }
        Self { width, height, table }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Sum over `[x0, x1) x [y0, y1)`.
    pub fn sum(&self, x0: usize, y0: usize, x1: usize, y1: usize) -> f64 {
        let stride = self.width + 1;
        self.table[y1 * stride + x1] - self.table[y0 * stride + x1] - self.table[y1 * stride + x0]
            + self.table[y0 * stride + x0]
    }
}

#[derive(Debug, Clone)]
pub struct EdgeBoxFinder {
    cfg: EdgeBoxConfig,
}

impl EdgeBoxFinder {
    pub fn new(cfg: EdgeBoxConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &EdgeBoxConfig {
        &self.cfg
    }

    pub fn find(&self, frame: &Frame) -> BoxRegion {
        self.find_at(frame, self.cfg.analysis_width)
    }

    /// Search at an explicit analysis width, up- or downsampling the frame to
    /// it. Always returns a region inside the frame; the full frame wins when
    /// no candidate qualifies.
    pub fn find_at(&self, frame: &Frame, analysis_width: u32) -> BoxRegion {
        let (fw, fh) = (frame.width(), frame.height());
        let aw = analysis_width.max(1);
        let ah = ((aw as f64 * fh as f64 / fw as f64).floor() as u32).max(1);

        let small = image_impl::resize(frame.as_rgba(), Size::new(aw, ah), FilterType::Triangle);
        let gray: Vec<f32> = small.pixels().map(luminance).collect();
        let (w, h) = (aw as usize, ah as usize);

        let mag = sobel_magnitude(&gray, w, h);
        let integral = IntegralImage::new(&mag, w, h);
        let (bx, by, bw, bh, score) = self.search(&integral);

        let sx = fw as f64 / w as f64;
        let sy = fh as f64 / h as f64;
        let region = BoxRegion {
            x: (bx as f64 * sx).floor() as u32,
            y: (by as f64 * sy).floor() as u32,
            w: (bw as f64 * sx).floor() as u32,
            h: (bh as f64 * sy).floor() as u32,
            score: score as f32,
        }
        .clamp_to(fw, fh);

        tracing::trace!(?region, analysis_width = aw, "edge box search done");
        region
    }

    /// Grid search in analysis coordinates; returns `(x, y, w, h, mean energy)`.
    pub fn search(&self, integral: &IntegralImage) -> (usize, usize, usize, usize, f64) {
        let (width, height) = (integral.width(), integral.height());
        let cfg = &self.cfg;
        let mut best = (0, 0, width, height, -1.0f64);

        let w_min = (width as f32 * cfg.min_width_frac).floor() as usize;
        let w_max = (width as f32 * cfg.max_width_frac).floor() as usize;
        let w_step = ((width as f32 * cfg.width_step_frac).floor() as usize)
            .max(cfg.min_width_step as usize)
            .max(1);
        let x_step = ((width as f32 * cfg.offset_step_frac).floor() as usize)
            .max(cfg.min_offset_step as usize)
            .max(1);
        let y_step = ((height as f32 * cfg.offset_step_frac).floor() as usize)
            .max(cfg.min_offset_step as usize)
            .max(1);

        for &aspect in &cfg.aspects {
            let mut w = w_min;
            while w <= w_max {
                let h = (w as f32 / aspect).floor() as usize;
                if h < cfg.min_height as usize || h > height || w == 0 {
                    w += w_step;
                    continue;
                }
                let area = (w * h) as f64;

                let mut y = 1;
                while y + h < height {
                    let mut x = 1;
                    while x + w < width {
                        let mean = integral.sum(x, y, x + w, y + h) / area;
                        if mean > best.4 {
                            best = (x, y, w, h, mean);
                        }
                        x += x_step;
                    }
                    y += y_step;
                }
                w += w_step;
            }
        }

        if best.4 < 0.0 {
            let area = (width * height) as f64;
            best.4 = if area > 0.0 {
                integral.sum(0, 0, width, height) / area
            } else {
                0.0
            };
        }
        best
    }
}
