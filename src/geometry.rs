use image::imageops::FilterType;
use image::RgbaImage;
use nalgebra::Matrix3;

use crate::contours::Quad;
use crate::edge_box::BoxRegion;
use crate::engine::EngineError;
use crate::image_impl::{self, Frame, Point2f, Size};
use crate::types::RectifyConfig;

/// Warps a quad onto an `S x S` square.
#[derive(Debug, Clone)]
pub struct Rectifier {
    cfg: RectifyConfig,
}

impl Rectifier {
    pub fn new(cfg: RectifyConfig) -> Self {
        Self { cfg }
    }

    pub fn roi_size(&self) -> u32 {
        self.cfg.roi_size
    }

    /// Homography taking `quad`'s corners (tl, tr, br, bl) to the square's.
    pub fn transform_for(&self, quad: &Quad) -> Result<Matrix3<f64>, EngineError> {
        if quad.area() < 1.0 {
            return Err(EngineError::Geometry("quad has no area".to_string()));
        }
        let s = self.cfg.roi_size as f32;
        let dst = [
            Point2f::new(0.0, 0.0),
            Point2f::new(s, 0.0),
            Point2f::new(s, s),
            Point2f::new(0.0, s),
        ];
        image_impl::get_perspective_transform(&quad.corners, &dst)
    }

    /// Raw warp, without the anti-aliasing pass.
    pub fn warp(&self, frame: &Frame, quad: &Quad) -> Result<RgbaImage, EngineError> {
        let m = self.transform_for(quad)?;
        image_impl::warp_perspective(frame.as_rgba(), &m, Size::square(self.cfg.roi_size))
    }

    pub fn rectify(&self, frame: &Frame, quad: &Quad) -> Result<RgbaImage, EngineError> {
        let warped = self.warp(frame, quad)?;
        Ok(anti_alias(&warped, self.cfg.anti_alias_scale))
    }
}

/// Down-then-up linear resample to knock out moire from screen photos.
/// A scale of 1 or more returns the image unchanged.
pub fn anti_alias(img: &RgbaImage, scale: f32) -> RgbaImage {
    if scale >= 1.0 || scale <= 0.0 {
        return img.clone();
    }
    let (w, h) = img.dimensions();
    let small = Size::new(
        ((w as f32 * scale).round() as u32).max(1),
        ((h as f32 * scale).round() as u32).max(1),
    );
    let down = image_impl::resize(img, small, FilterType::Triangle);
    image_impl::resize(&down, Size::new(w, h), FilterType::Triangle)
}

/// Expand `b` by `pad` of its size (half per side), clipped to the frame.
/// `None` when nothing of it is left inside.
pub fn pad_box(b: &BoxRegion, pad: f32, frame_w: u32, frame_h: u32) -> Option<BoxRegion> {
    let pad_w = b.w as f32 * pad / 2.0;
    let pad_h = b.h as f32 * pad / 2.0;

    let x0 = (b.x as f32 - pad_w).floor().max(0.0);
    let y0 = (b.y as f32 - pad_h).floor().max(0.0);
    let x1 = (b.right() as f32 + pad_w).ceil().min(frame_w as f32);
    let y1 = (b.bottom() as f32 + pad_h).ceil().min(frame_h as f32);

    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(BoxRegion {
        x: x0 as u32,
        y: y0 as u32,
        w: (x1 - x0) as u32,
        h: (y1 - y0) as u32,
        score: b.score,
    })
}

/// Largest centered square.
pub fn center_square(frame_w: u32, frame_h: u32) -> BoxRegion {
    let side = frame_w.min(frame_h);
    BoxRegion::new((frame_w - side) / 2, (frame_h - side) / 2, side, side)
}
