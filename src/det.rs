use std::time::Instant;

use image::RgbaImage;
use serde::Serialize;

use crate::contours::{Quad, QuadDetector};
use crate::edge_box::{BoxRegion, EdgeBoxFinder};
use crate::geometry::Rectifier;
use crate::image_impl::{Frame, Point2f};
use crate::types::{DetectionStrategy, PipelineConfig};

/// Geometry drawn over the frame for one ROI.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Overlay {
    Box(BoxRegion),
    Quad(Quad),
}

impl Overlay {
    pub fn centroid(&self) -> Point2f {
        match self {
            Overlay::Box(b) => b.center(),
            Overlay::Quad(q) => q.centroid(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Detection {
    pub overlay: Overlay,
    /// Perspective-corrected ROI, when the strategy produces one.
    pub rectified: Option<RgbaImage>,
}

#[derive(Debug, Clone, Default)]
pub struct DetectionOutput {
    /// Ranked, best first.
    pub detections: Vec<Detection>,
    /// Per-candidate failures that did not stop the tick.
    pub errors: Vec<String>,
    pub elapse: f64,
}

pub trait RoiStrategy {
    fn name(&self) -> &'static str;

    fn run(&mut self, frame: &Frame) -> DetectionOutput;
}

pub struct EdgeBoxStrategy {
    finder: EdgeBoxFinder,
}

impl EdgeBoxStrategy {
    pub fn new(finder: EdgeBoxFinder) -> Self {
        Self { finder }
    }
}

impl RoiStrategy for EdgeBoxStrategy {
    fn name(&self) -> &'static str {
        "box"
    }

    fn run(&mut self, frame: &Frame) -> DetectionOutput {
        let start = Instant::now();
        let region = self.finder.find(frame);
        DetectionOutput {
            detections: vec![Detection {
                overlay: Overlay::Box(region),
                rectified: None,
            }],
            errors: Vec::new(),
            elapse: start.elapsed().as_secs_f64(),
        }
    }
}

pub struct QuadStrategy {
    detector: QuadDetector,
    rectifier: Rectifier,
}

impl QuadStrategy {
    pub fn new(detector: QuadDetector, rectifier: Rectifier) -> Self {
        Self { detector, rectifier }
    }
}

impl RoiStrategy for QuadStrategy {
    fn name(&self) -> &'static str {
        "quad"
    }

    fn run(&mut self, frame: &Frame) -> DetectionOutput {
        let start = Instant::now();
        let quads = self.detector.detect(frame);

        let mut detections = Vec::with_capacity(quads.len());
        let mut errors = Vec::new();
        for quad in quads {
            match self.rectifier.rectify(frame, &quad) {
                Ok(img) => detections.push(Detection {
                    overlay: Overlay::Quad(quad),
                    rectified: Some(img),
                }),
                Err(err) => {
                    tracing::warn!(%err, ?quad, "skipping quad that cannot be rectified");
                    errors.push(err.to_string());
                }
            }
        }

        DetectionOutput {
            detections,
            errors,
            elapse: start.elapsed().as_secs_f64(),
        }
    }
}

pub fn strategy_from_config(cfg: &PipelineConfig) -> Box<dyn RoiStrategy> {
    match cfg.strategy {
        DetectionStrategy::EdgeBox => {
            Box::new(EdgeBoxStrategy::new(EdgeBoxFinder::new(cfg.edge_box.clone())))
        }
        DetectionStrategy::Quad => Box::new(QuadStrategy::new(
            QuadDetector::new(cfg.quad.clone()),
            Rectifier::new(cfg.rectify.clone()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn test_box_strategy_always_yields_one() {
        let frame = Frame::new(RgbaImage::from_pixel(40, 30, Rgba([0, 0, 0, 255]))).unwrap();
        let mut s = strategy_from_config(&PipelineConfig::edge_box());
        assert_eq!(s.name(), "box");
        let out = s.run(&frame);
        assert_eq!(out.detections.len(), 1);
        assert!(out.detections[0].rectified.is_none());
    }

    #[test]
    fn test_quad_strategy_blank_frame() {
        let frame = Frame::new(RgbaImage::from_pixel(40, 30, Rgba([0, 0, 0, 255]))).unwrap();
        let mut s = strategy_from_config(&PipelineConfig::quad());
        assert_eq!(s.name(), "quad");
        let out = s.run(&frame);
        assert!(out.detections.is_empty());
        assert!(out.errors.is_empty());
    }

    #[test]
    fn test_overlay_serializes_with_kind() {
        let o = Overlay::Box(BoxRegion::new(1, 2, 3, 4));
        let json = serde_json::to_value(o).unwrap();
        assert_eq!(json["kind"], "box");
        assert_eq!(json["w"], 3);
    }
}
