use image::imageops::FilterType;
use image::RgbaImage;
use ndarray::Array4;

use crate::edge_box::BoxRegion;
use crate::geometry::{center_square, pad_box};
use crate::image_impl::{self, Frame, Size};
use crate::types::{CropMode, NormMode, NormalizeConfig, TensorLayout};

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

impl NormMode {
    /// Map one 8-bit channel value (RGB order, `channel` in 0..3) to model space.
    #[inline]
    pub fn encode(self, value: u8, channel: usize) -> f32 {
        let v = value as f32;
        match self {
            NormMode::Neg1To1 => v / 127.5 - 1.0,
            NormMode::Zero1 => v / 255.0,
            NormMode::Imagenet => (v / 255.0 - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel],
        }
    }

    /// Inverse of [`NormMode::encode`], unclamped.
    pub fn decode(self, x: f32, channel: usize) -> f32 {
        match self {
            NormMode::Neg1To1 => (x + 1.0) * 127.5,
            NormMode::Zero1 => x * 255.0,
            NormMode::Imagenet => (x * IMAGENET_STD[channel] + IMAGENET_MEAN[channel]) * 255.0,
        }
    }
}

/// Model input, batch of one, three channels.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: Array4<f32>,
    layout: TensorLayout,
}

impl Tensor {
    pub fn zeros(shape: [usize; 4], layout: TensorLayout) -> Self {
        Self {
            data: Array4::zeros(shape),
            layout,
        }
    }

    pub fn shape(&self) -> [usize; 4] {
        let s = self.data.shape();
        [s[0], s[1], s[2], s[3]]
    }

    pub fn layout(&self) -> TensorLayout {
        self.layout
    }

    pub fn as_array(&self) -> &Array4<f32> {
        &self.data
    }

    /// Row-major copy of the values.
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.iter().copied().collect()
    }

    /// Value at pixel (`x`, `y`), channel `c`, independent of layout.
    pub fn at(&self, x: usize, y: usize, c: usize) -> f32 {
        match self.layout {
            TensorLayout::Nchw => self.data[[0, c, y, x]],
            TensorLayout::Nhwc => self.data[[0, y, x, c]],
        }
    }
}

/// What the strategy located this tick, if anything.
#[derive(Debug, Clone, Copy)]
pub enum RoiSource<'a> {
    None,
    Region(&'a BoxRegion),
    Rectified(&'a RgbaImage),
}

/// Crop, resize to the model's square input and normalize.
#[derive(Debug, Clone)]
pub struct Normalizer {
    cfg: NormalizeConfig,
}

impl Normalizer {
    pub fn new(cfg: NormalizeConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &NormalizeConfig {
        &self.cfg
    }

    pub fn set_layout(&mut self, layout: TensorLayout) {
        self.cfg.layout = layout;
    }

    pub fn run(&self, frame: &Frame, roi: RoiSource<'_>) -> Tensor {
        let crop = self.crop(frame, roi);
        let s = self.cfg.input_size;
        let resized = image_impl::resize(&crop, Size::square(s), FilterType::Triangle);
        self.normalize_and_permute(&resized)
    }

    /// Region handed to the resizer. `Auto` without a usable ROI falls back
    /// to the full frame.
    pub fn crop(&self, frame: &Frame, roi: RoiSource<'_>) -> RgbaImage {
        let (fw, fh) = (frame.width(), frame.height());
        match (self.cfg.crop_mode, roi) {
            (CropMode::Center, _) => {
                let sq = center_square(fw, fh);
                frame.crop(sq.x, sq.y, sq.w, sq.h)
            }
            (CropMode::Auto, RoiSource::Rectified(img)) => img.clone(),
            (CropMode::Auto, RoiSource::Region(b)) => match pad_box(b, self.cfg.roi_pad, fw, fh) {
                Some(p) => frame.crop(p.x, p.y, p.w, p.h),
                None => frame.as_rgba().clone(),
            },
            _ => frame.as_rgba().clone(),
        }
    }

    pub fn normalize_and_permute(&self, img: &RgbaImage) -> Tensor {
        let (w, h) = (img.width() as usize, img.height() as usize);
        let mode = self.cfg.norm_mode;

        let mut out = match self.cfg.layout {
            TensorLayout::Nchw => Array4::<f32>::zeros((1, 3, h, w)),
            TensorLayout::Nhwc => Array4::<f32>::zeros((1, h, w, 3)),
        };

        for (x, y, pix) in img.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for c in 0..3 {
                let v = mode.encode(pix[c], c);
                match self.cfg.layout {
                    TensorLayout::Nchw => out[[0, c, y, x]] = v,
                    TensorLayout::Nhwc => out[[0, y, x, c]] = v,
                }
            }
        }

        Tensor {
            data: out,
            layout: self.cfg.layout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    const CROPS: [CropMode; 3] = [CropMode::Full, CropMode::Center, CropMode::Auto];
    const NORMS: [NormMode; 3] = [NormMode::Neg1To1, NormMode::Zero1, NormMode::Imagenet];
    const LAYOUTS: [TensorLayout; 2] = [TensorLayout::Nchw, TensorLayout::Nhwc];

    fn pixel(x: u32, y: u32) -> Rgba<u8> {
        Rgba([(x * 60 + 10) as u8, (y * 70 + 5) as u8, (x * 20 + y * 30) as u8, 255])
    }

    #[test]
    fn test_encode_constants() {
        assert_eq!(NormMode::Neg1To1.encode(0, 0), -1.0);
        assert_eq!(NormMode::Neg1To1.encode(255, 1), 1.0);
        assert_eq!(NormMode::Zero1.encode(255, 2), 1.0);
        let r = NormMode::Imagenet.encode(255, 0);
        assert!((r - (1.0 - 0.485) / 0.229).abs() < 1e-5);
        let b = NormMode::Imagenet.encode(0, 2);
        assert!((b - (-0.406 / 0.225)).abs() < 1e-5);
    }

    #[test]
    fn test_decode_inverts_encode() {
        for mode in NORMS {
            for c in 0..3 {
                for v in [0u8, 1, 77, 128, 254, 255] {
                    let back = mode.decode(mode.encode(v, c), c);
                    assert!((back - v as f32).abs() < 1e-3, "{mode:?} {c} {v} -> {back}");
                }
            }
        }
    }

    /// Every crop x norm x layout combination, on frames where the chosen
    /// crop already has the model size so values can be checked pixel by pixel.
    #[test]
    fn test_all_combinations() {
        // Full: a square 2x2 frame, taken whole.
        // Center: 4x2 frame, columns 1..3.
        // Auto: same 4x2 frame, ROI at columns 2..4, distinct from the center.
        let square = Frame::new(RgbaImage::from_fn(2, 2, pixel)).unwrap();
        let wide = Frame::new(RgbaImage::from_fn(4, 2, pixel)).unwrap();
        let roi = BoxRegion::new(2, 0, 2, 2);
        assert_ne!(center_square(4, 2), roi);

        for crop_mode in CROPS {
            let (frame, x_offset) = match crop_mode {
                CropMode::Full => (&square, 0),
                CropMode::Center => (&wide, 1),
                CropMode::Auto => (&wide, 2),
            };
            for norm_mode in NORMS {
                for layout in LAYOUTS {
                    let n = Normalizer::new(NormalizeConfig {
                        input_size: 2,
                        crop_mode,
                        norm_mode,
                        layout,
                        roi_pad: 0.0,
                    });
                    let t = n.run(frame, RoiSource::Region(&roi));
                    let expected = match layout {
                        TensorLayout::Nchw => [1, 3, 2, 2],
                        TensorLayout::Nhwc => [1, 2, 2, 3],
                    };
                    assert_eq!(t.shape(), expected, "{crop_mode:?} {norm_mode:?} {layout:?}");
                    assert_eq!(t.layout(), layout);
                    for y in 0..2u32 {
                        for x in 0..2u32 {
                            let p = pixel(x + x_offset, y);
                            for c in 0..3 {
                                let want = norm_mode.encode(p[c], c);
                                let got = t.at(x as usize, y as usize, c);
                                assert!(
                                    (got - want).abs() < 1e-6,
                                    "{crop_mode:?} {norm_mode:?} {layout:?} ({x},{y},{c})"
                                );
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_full_crop_values_when_square() {
        let frame = Frame::new(RgbaImage::from_fn(3, 3, pixel)).unwrap();
        let n = Normalizer::new(NormalizeConfig {
            input_size: 3,
            crop_mode: CropMode::Full,
            norm_mode: NormMode::Zero1,
            layout: TensorLayout::Nhwc,
            roi_pad: 0.0,
        });
        let t = n.run(&frame, RoiSource::None);
        assert_eq!(t.at(2, 1, 0), pixel(2, 1)[0] as f32 / 255.0);
        // NHWC keeps channels innermost
        assert_eq!(t.to_vec()[3], pixel(1, 0)[0] as f32 / 255.0);
    }

    #[test]
    fn test_auto_without_roi_uses_full_frame() {
        let frame = Frame::new(RgbaImage::from_fn(4, 2, pixel)).unwrap();
        let n = Normalizer::new(NormalizeConfig {
            crop_mode: CropMode::Auto,
            ..NormalizeConfig::default()
        });
        assert_eq!(n.crop(&frame, RoiSource::None).dimensions(), (4, 2));

        let outside = BoxRegion::new(10, 10, 5, 5);
        assert_eq!(n.crop(&frame, RoiSource::Region(&outside)).dimensions(), (4, 2));

        let rectified = RgbaImage::from_pixel(7, 7, Rgba([1, 2, 3, 255]));
        assert_eq!(n.crop(&frame, RoiSource::Rectified(&rectified)).dimensions(), (7, 7));
    }

    #[test]
    fn test_output_values_finite() {
        let frame = Frame::new(RgbaImage::from_fn(37, 23, |x, y| pixel(x % 4, y % 3))).unwrap();
        for norm_mode in NORMS {
            let n = Normalizer::new(NormalizeConfig {
                norm_mode,
                input_size: 16,
                ..NormalizeConfig::default()
            });
            let t = n.run(&frame, RoiSource::None);
            assert!(t.as_array().iter().all(|v| v.is_finite()));
        }
    }
}
