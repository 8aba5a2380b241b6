//! Frame type and the low-level pixel operations the pipeline is built on:
//! luminance, resampling, homography estimation and perspective warping.

use std::path::Path;

use image::imageops::{self, FilterType};
use image::{GrayImage, ImageBuffer, Luma, Rgba, RgbaImage};
use nalgebra::{DMatrix, Matrix3};
use serde::Serialize;

use crate::engine::EngineError;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Point2f {
    pub x: f32,
    pub y: f32,
}

impl Point2f {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point2f) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn square(side: u32) -> Self {
        Self::new(side, side)
    }
}

/// One RGBA video frame. Never empty.
#[derive(Clone, Debug)]
pub struct Frame {
    image: RgbaImage,
}

impl Frame {
    pub fn new(image: RgbaImage) -> Result<Self> {
        if image.width() == 0 || image.height() == 0 {
            return Err(EngineError::ImageError("frame has zero area".to_string()));
        }
        Ok(Self { image })
    }

    pub fn from_rgba8(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let image = ImageBuffer::from_raw(width, height, data).ok_or_else(|| {
            EngineError::ImageError(format!("buffer does not match {width}x{height} RGBA"))
        })?;
        Self::new(image)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let img = image::open(path)?;
        Self::new(img.to_rgba8())
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn size(&self) -> Size {
        Size::new(self.width(), self.height())
    }

    pub fn as_rgba(&self) -> &RgbaImage {
        &self.image
    }

    pub fn to_luma(&self) -> GrayImage {
        gray_from_rgba(&self.image)
    }

    /// Copy of the `w` x `h` region at (`x`, `y`), clipped to the frame.
    pub fn crop(&self, x: u32, y: u32, w: u32, h: u32) -> RgbaImage {
        imageops::crop_imm(&self.image, x, y, w, h).to_image()
    }
}

/// ITU-R BT.601 luma in `[0, 255]`.
#[inline]
pub fn luminance(p: &Rgba<u8>) -> f32 {
    0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32
}

pub fn gray_from_rgba(img: &RgbaImage) -> GrayImage {
    let mut out = GrayImage::new(img.width(), img.height());
    for (x, y, p) in img.enumerate_pixels() {
        out.put_pixel(x, y, Luma([luminance(p).round().clamp(0.0, 255.0) as u8]));
    }
    out
}

/// Resample `src` to `dsize`. Same-size requests return a copy untouched.
pub fn resize(src: &RgbaImage, dsize: Size, filter: FilterType) -> RgbaImage {
    if src.dimensions() == (dsize.width, dsize.height) {
        return src.clone();
    }
    imageops::resize(src, dsize.width, dsize.height, filter)
}

/// Solve the homography mapping each `src_pts[i]` onto `dst_pts[i]`.
pub fn get_perspective_transform(
    src_pts: &[Point2f; 4],
    dst_pts: &[Point2f; 4],
) -> Result<Matrix3<f64>> {
    // c22 = 1 first; an 8x8 linear system
    let mut a = DMatrix::<f64>::zeros(8, 8);
    let mut b = DMatrix::<f64>::zeros(8, 1);

    for (i, (s, d)) in src_pts.iter().zip(dst_pts.iter()).enumerate() {
        let (x, y) = (s.x as f64, s.y as f64);
        let (u, v) = (d.x as f64, d.y as f64);

        a[(i, 0)] = x;
        a[(i, 1)] = y;
        a[(i, 2)] = 1.0;
        a[(i, 6)] = -u * x;
        a[(i, 7)] = -u * y;
        b[(i, 0)] = u;

        a[(i + 4, 3)] = x;
        a[(i + 4, 4)] = y;
        a[(i + 4, 5)] = 1.0;
        a[(i + 4, 6)] = -v * x;
        a[(i + 4, 7)] = -v * y;
        b[(i + 4, 0)] = v;
    }

    if let Some(h) = a.clone().lu().solve(&b) {
        let residual = (&a * &h - &b).norm();
        if residual < 1e-6 && h.iter().all(|v| v.is_finite()) {
            let m = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0);
            return ensure_invertible(m);
        }
    }

    // Full 9-parameter system through the null space of A^T A
    let mut a9 = DMatrix::<f64>::zeros(8, 9);
    for (i, (s, d)) in src_pts.iter().zip(dst_pts.iter()).enumerate() {
        let (x, y) = (s.x as f64, s.y as f64);
        let (u, v) = (d.x as f64, d.y as f64);

        a9[(i, 0)] = x;
        a9[(i, 1)] = y;
        a9[(i, 2)] = 1.0;
        a9[(i, 6)] = -u * x;
        a9[(i, 7)] = -u * y;
        a9[(i, 8)] = -u;

        a9[(i + 4, 3)] = x;
        a9[(i + 4, 4)] = y;
        a9[(i + 4, 5)] = 1.0;
        a9[(i + 4, 6)] = -v * x;
        a9[(i + 4, 7)] = -v * y;
        a9[(i + 4, 8)] = -v;
    }

    let ata = a9.transpose() * &a9;
    let svd = ata.svd(true, false);
    let u = svd
        .u
        .ok_or_else(|| EngineError::Geometry("SVD did not converge".to_string()))?;
    // singular values are sorted descending, so the last column spans the null space
    let h = u.column(8);
    if h[8].abs() < 1e-12 {
        return Err(EngineError::Geometry("degenerate point correspondence".to_string()));
    }
    let m = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]) / h[8];
    ensure_invertible(m)
}

fn ensure_invertible(m: Matrix3<f64>) -> Result<Matrix3<f64>> {
    let det = m.determinant();
    if !det.is_finite() || det.abs() <= f64::EPSILON * m.norm().powi(3) {
        return Err(EngineError::Geometry("homography is singular".to_string()));
    }
    Ok(m)
}

pub fn invert_homography(m: &Matrix3<f64>) -> Result<Matrix3<f64>> {
    m.try_inverse()
        .ok_or_else(|| EngineError::Geometry("matrix is not invertible".to_string()))
}

/// Bicubic perspective warp with edge replication. `matrix` maps source
/// pixel coordinates to destination pixel coordinates.
pub fn warp_perspective(src: &RgbaImage, matrix: &Matrix3<f64>, dsize: Size) -> Result<RgbaImage> {
    let m_inv = invert_homography(matrix)?;
    let mut out = RgbaImage::new(dsize.width, dsize.height);

    let (m00, m01, m02) = (m_inv[(0, 0)], m_inv[(0, 1)], m_inv[(0, 2)]);
    let (m10, m11, m12) = (m_inv[(1, 0)], m_inv[(1, 1)], m_inv[(1, 2)]);
    let (m20, m21, m22) = (m_inv[(2, 0)], m_inv[(2, 1)], m_inv[(2, 2)]);

    for y in 0..dsize.height {
        let y_f = y as f64;
        let (m01y, m11y, m21y) = (m01 * y_f, m11 * y_f, m21 * y_f);

        for x in 0..dsize.width {
            let x_f = x as f64;
            let w = m20 * x_f + m21y + m22;
            if w.abs() < 1e-12 {
                continue;
            }
            let src_x = (m00 * x_f + m01y + m02) / w;
            let src_y = (m10 * x_f + m11y + m12) / w;
            out.put_pixel(x, y, sample_bicubic(src, src_x, src_y));
        }
    }

    Ok(out)
}

/// Keys cubic kernel weights for taps at offsets -1, 0, 1, 2 (a = -0.75).
fn cubic_weights(t: f64) -> [f64; 4] {
    const A: f64 = -0.75;
    let w0 = ((A * (t + 1.0) - 5.0 * A) * (t + 1.0) + 8.0 * A) * (t + 1.0) - 4.0 * A;
    let w1 = ((A + 2.0) * t - (A + 3.0)) * t * t + 1.0;
    let w2 = ((A + 2.0) * (1.0 - t) - (A + 3.0)) * (1.0 - t) * (1.0 - t) + 1.0;
    [w0, w1, w2, 1.0 - w0 - w1 - w2]
}

fn sample_bicubic(src: &RgbaImage, x: f64, y: f64) -> Rgba<u8> {
    let (w, h) = src.dimensions();
    let max_x = w as i64 - 1;
    let max_y = h as i64 - 1;
    let x = x.clamp(-2.0, w as f64 + 2.0);
    let y = y.clamp(-2.0, h as f64 + 2.0);

    let x0 = x.floor();
    let y0 = y.floor();
    let wx = cubic_weights(x - x0);
    let wy = cubic_weights(y - y0);
    let (ix, iy) = (x0 as i64, y0 as i64);

    let mut acc = [0f64; 4];
    for (j, wyj) in wy.iter().enumerate() {
        let sy = (iy - 1 + j as i64).clamp(0, max_y) as u32;
        for (i, wxi) in wx.iter().enumerate() {
            let sx = (ix - 1 + i as i64).clamp(0, max_x) as u32;
            let p = src.get_pixel(sx, sy);
            let weight = wyj * wxi;
            for (c, a) in acc.iter_mut().enumerate() {
                *a += weight * p[c] as f64;
            }
        }
    }
    Rgba(acc.map(|v| v.round().clamp(0.0, 255.0) as u8))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    /// `None` when `p` lands on the line at infinity.
    fn apply_homography(m: &Matrix3<f64>, p: Point2f) -> Option<Point2f> {
        let v = m * Vector3::new(p.x as f64, p.y as f64, 1.0);
        if v[2].abs() < 1e-12 {
            return None;
        }
        Some(Point2f::new((v[0] / v[2]) as f32, (v[1] / v[2]) as f32))
    }

    fn gradient(w: u32, h: u32) -> RgbaImage {
        RgbaImage::from_fn(w, h, |x, y| {
            Rgba([(x * 7 % 256) as u8, (y * 11 % 256) as u8, ((x + y) * 3 % 256) as u8, 255])
        })
    }

    #[test]
    fn test_frame_rejects_empty() {
        assert!(Frame::new(RgbaImage::new(0, 4)).is_err());
        assert!(Frame::from_rgba8(2, 2, vec![0; 15]).is_err());
        assert!(Frame::from_rgba8(2, 2, vec![0; 16]).is_ok());
    }

    #[test]
    fn test_luminance_weights() {
        assert!((luminance(&Rgba([255, 255, 255, 255])) - 255.0).abs() < 1e-3);
        assert!((luminance(&Rgba([100, 0, 0, 255])) - 29.9).abs() < 1e-3);
        assert!((luminance(&Rgba([0, 100, 0, 255])) - 58.7).abs() < 1e-3);
        assert!((luminance(&Rgba([0, 0, 100, 255])) - 11.4).abs() < 1e-3);
    }

    #[test]
    fn test_perspective_transform_maps_corners() {
        let src = [
            Point2f::new(10.0, 12.0),
            Point2f::new(90.0, 5.0),
            Point2f::new(95.0, 70.0),
            Point2f::new(8.0, 80.0),
        ];
        let dst = [
            Point2f::new(0.0, 0.0),
            Point2f::new(63.0, 0.0),
            Point2f::new(63.0, 63.0),
            Point2f::new(0.0, 63.0),
        ];
        let m = get_perspective_transform(&src, &dst).unwrap();
        for (s, d) in src.iter().zip(dst.iter()) {
            let p = apply_homography(&m, *s).unwrap();
            assert!((p.x - d.x).abs() < 1e-3, "{p:?} vs {d:?}");
            assert!((p.y - d.y).abs() < 1e-3, "{p:?} vs {d:?}");
        }
    }

    #[test]
    fn test_perspective_transform_rejects_collinear() {
        let src = [
            Point2f::new(0.0, 0.0),
            Point2f::new(10.0, 0.0),
            Point2f::new(20.0, 0.0),
            Point2f::new(30.0, 0.0),
        ];
        let dst = [
            Point2f::new(0.0, 0.0),
            Point2f::new(10.0, 0.0),
            Point2f::new(10.0, 10.0),
            Point2f::new(0.0, 10.0),
        ];
        assert!(matches!(
            get_perspective_transform(&src, &dst),
            Err(EngineError::Geometry(_))
        ));
    }

    #[test]
    fn test_identity_warp_is_exact() {
        let img = gradient(16, 12);
        let m = Matrix3::identity();
        let out = warp_perspective(&img, &m, Size::new(16, 12)).unwrap();
        assert_eq!(out, img);
    }

    #[test]
    fn test_warp_replicates_border() {
        let img = RgbaImage::from_pixel(4, 4, Rgba([200, 10, 10, 255]));
        // shift right by 3 so the left columns sample outside the source
        let m = Matrix3::new(1.0, 0.0, 3.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0);
        let out = warp_perspective(&img, &m, Size::new(4, 4)).unwrap();
        assert!(out.pixels().all(|p| *p == Rgba([200, 10, 10, 255])));
    }

    #[test]
    fn test_cubic_weights_partition_unity() {
        for i in 0..=10 {
            let t = i as f64 / 10.0;
            let s: f64 = cubic_weights(t).iter().sum();
            assert!((s - 1.0).abs() < 1e-12);
        }
        assert_eq!(cubic_weights(0.0), [0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_resize_same_size_is_copy() {
        let img = gradient(5, 3);
        assert_eq!(resize(&img, Size::new(5, 3), FilterType::Triangle), img);
        let up = resize(&img, Size::new(10, 6), FilterType::CatmullRom);
        assert_eq!(up.dimensions(), (10, 6));
    }
}
