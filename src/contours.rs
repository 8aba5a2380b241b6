// Quadrilateral candidate detection on top of imageproc's edge and contour
// primitives, plus the small polygon helpers the filters need.

use image::GrayImage;
use imageproc::contours::find_contours;
use imageproc::edges::canny;
use imageproc::filter::median_filter;
use imageproc::geometry::{approximate_polygon_dp, arc_length};
use imageproc::point::Point;
use serde::Serialize;

use crate::edge_box::BoxRegion;
use crate::image_impl::{Frame, Point2f};
use crate::types::QuadConfig;

/// Vertices closer than this (in pixels) are merged after approximation.
const MERGE_DIST: f32 = 1.5;

/// Configured Canny thresholds are in OpenCV units: 3x3 Gaussian, then Sobel.
/// imageproc's `canny` blurs with sigma 1.4 instead, so a step edge peaks at
/// about 2.05 x its height rather than 3 x.
const CANNY_GRADIENT_SCALE: f32 = 2.05 / 3.0;

/// Convex quadrilateral with corners in tl, tr, br, bl order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Quad {
    pub corners: [Point2f; 4],
}

impl Quad {
    pub fn new(points: [Point2f; 4]) -> Self {
        Self {
            corners: order_quad(points),
        }
    }

    pub fn from_box(b: &BoxRegion) -> Self {
        Self { corners: b.corners() }
    }

    pub fn area(&self) -> f32 {
        polygon_area(&self.corners)
    }

    pub fn centroid(&self) -> Point2f {
        centroid(&self.corners)
    }

    pub fn side_lengths(&self) -> [f32; 4] {
        let c = &self.corners;
        [
            c[0].distance(&c[1]),
            c[1].distance(&c[2]),
            c[2].distance(&c[3]),
            c[3].distance(&c[0]),
        ]
    }

    /// Tight axis-aligned bounds, clamped to a `width` x `height` frame.
    pub fn bounding_box(&self, width: u32, height: u32) -> BoxRegion {
        let xs = self.corners.iter().map(|p| p.x);
        let ys = self.corners.iter().map(|p| p.y);
        let x0 = xs.clone().fold(f32::INFINITY, f32::min).max(0.0);
        let x1 = xs.fold(f32::NEG_INFINITY, f32::max).max(0.0);
        let y0 = ys.clone().fold(f32::INFINITY, f32::min).max(0.0);
        let y1 = ys.fold(f32::NEG_INFINITY, f32::max).max(0.0);
        BoxRegion::new(
            x0.floor() as u32,
            y0.floor() as u32,
            (x1 - x0).ceil() as u32,
            (y1 - y0).ceil() as u32,
        )
        .clamp_to(width, height)
    }
}

/// Absolute shoelace area.
pub fn polygon_area(points: &[Point2f]) -> f32 {
    let n = points.len();
    if n < 3 {
        return 0.0;
    }
    let mut area = 0.0f64;
    for i in 0..n {
        let j = (i + 1) % n;
        area += points[i].x as f64 * points[j].y as f64 - points[j].x as f64 * points[i].y as f64;
    }
    (area.abs() / 2.0) as f32
}

pub fn centroid(points: &[Point2f]) -> Point2f {
    if points.is_empty() {
        return Point2f::default();
    }
    let n = points.len() as f32;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    Point2f::new(sx / n, sy / n)
}

/// Strict convexity: every turn has the same non-zero orientation.
pub fn is_convex(points: &[Point2f]) -> bool {
    let n = points.len();
    if n < 3 {
        return false;
    }
    let mut sign = 0.0f32;
    for i in 0..n {
        let a = points[i];
        let b = points[(i + 1) % n];
        let c = points[(i + 2) % n];
        let cross = (b.x - a.x) * (c.y - b.y) - (b.y - a.y) * (c.x - b.x);
        if cross.abs() < 1e-6 {
            return false;
        }
        if sign == 0.0 {
            sign = cross.signum();
        } else if cross.signum() != sign {
            return false;
        }
    }
    true
}

/// Longest side over shortest side of a closed polygon.
pub fn side_ratio(points: &[Point2f]) -> f32 {
    let n = points.len();
    let (mut lo, mut hi) = (f32::INFINITY, 0.0f32);
    for i in 0..n {
        let d = points[i].distance(&points[(i + 1) % n]);
        lo = lo.min(d);
        hi = hi.max(d);
    }
    if lo <= f32::EPSILON {
        f32::INFINITY
    } else {
        hi / lo
    }
}

/// Canonical tl, tr, br, bl order.
///
/// Corners are picked by the extremes of `x + y` and `x - y`. When those do
/// not name four distinct vertices in convex order, the points are sorted
/// clockwise around their centroid starting from the top-left-most one.
pub fn order_quad(points: [Point2f; 4]) -> [Point2f; 4] {
    let sum = |p: &Point2f| p.x + p.y;
    let diff = |p: &Point2f| p.x - p.y;

    let tl = argmin(&points, sum);
    let br = argmax(&points, sum);
    let tr = argmax(&points, diff);
    let bl = argmin(&points, diff);

    let idx = [tl, tr, br, bl];
    let distinct = (0..4).all(|i| (i + 1..4).all(|j| idx[i] != idx[j]));
    if distinct {
        let ordered = idx.map(|i| points[i]);
        if is_convex(&ordered) {
            return ordered;
        }
    }

    let c = centroid(&points);
    let mut sorted = points;
    sorted.sort_by(|a, b| {
        let ta = (a.y - c.y).atan2(a.x - c.x);
        let tb = (b.y - c.y).atan2(b.x - c.x);
        ta.total_cmp(&tb)
    });
    let start = argmin(&sorted, sum);
    sorted.rotate_left(start);
    sorted
}

fn argmin(points: &[Point2f; 4], key: impl Fn(&Point2f) -> f32) -> usize {
    let mut best = 0;
    for i in 1..4 {
        if key(&points[i]) < key(&points[best]) {
            best = i;
        }
    }
    best
}

fn argmax(points: &[Point2f; 4], key: impl Fn(&Point2f) -> f32) -> usize {
    let mut best = 0;
    for i in 1..4 {
        if key(&points[i]) > key(&points[best]) {
            best = i;
        }
    }
    best
}

fn merge_close_vertices(points: Vec<Point2f>, min_dist: f32) -> Vec<Point2f> {
    let mut out: Vec<Point2f> = Vec::with_capacity(points.len());
    for p in points {
        if out.last().map_or(true, |q| q.distance(&p) >= min_dist) {
            out.push(p);
        }
    }
    while out.len() > 1 && out[0].distance(&out[out.len() - 1]) < min_dist {
        out.pop();
    }
    out
}

fn line_distance(p: Point2f, a: Point2f, b: Point2f) -> f32 {
    let len = a.distance(&b);
    if len <= f32::EPSILON {
        return p.distance(&a);
    }
    ((b.x - a.x) * (a.y - p.y) - (a.x - p.x) * (b.y - a.y)).abs() / len
}

/// Remove vertices within `tol` of the line through their neighbours.
fn drop_collinear(mut points: Vec<Point2f>, tol: f32) -> Vec<Point2f> {
    let mut i = 0;
    while points.len() > 3 && i < points.len() {
        let n = points.len();
        let prev = points[(i + n - 1) % n];
        let next = points[(i + 1) % n];
        if line_distance(points[i], prev, next) < tol {
            points.remove(i);
            i = 0;
        } else {
            i += 1;
        }
    }
    points
}

#[derive(Debug, Clone)]
pub struct QuadDetector {
    cfg: QuadConfig,
}

impl QuadDetector {
    pub fn new(cfg: QuadConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &QuadConfig {
        &self.cfg
    }

    /// Up to `max_rois` convex quads, largest first. Empty when nothing qualifies.
    pub fn detect(&self, frame: &Frame) -> Vec<Quad> {
        let edges = self.edge_map(frame);
        let frame_area = frame.width() as f32 * frame.height() as f32;

        let mut quads: Vec<Quad> = find_contours::<i32>(&edges)
            .iter()
            .filter_map(|contour| self.approximate(&contour.points))
            .filter_map(|poly| self.accept(&poly, frame_area))
            .collect();

        quads.sort_by(|a, b| b.area().total_cmp(&a.area()));
        let quads = suppress_duplicates(quads);
        let kept: Vec<Quad> = quads.into_iter().take(self.cfg.max_rois).collect();

        tracing::debug!(count = kept.len(), "quad candidates");
        kept
    }

    /// Median 3x3, then Canny with hysteresis. `canny` does its own
    /// Gaussian pass.
    pub fn edge_map(&self, frame: &Frame) -> GrayImage {
        let gray = frame.to_luma();
        let r = self.cfg.median_radius;
        let denoised = if r > 0 { median_filter(&gray, r, r) } else { gray };
        canny(
            &denoised,
            self.cfg.canny_low * CANNY_GRADIENT_SCALE,
            self.cfg.canny_high * CANNY_GRADIENT_SCALE,
        )
    }

    fn approximate(&self, contour: &[Point<i32>]) -> Option<Vec<Point2f>> {
        if contour.len() < 4 {
            return None;
        }
        let perimeter = arc_length(contour, true);
        let epsilon = self.cfg.approx_epsilon * perimeter;
        if epsilon <= 0.0 {
            return None;
        }
        let approx = approximate_polygon_dp(contour, epsilon, true);
        let points = approx
            .iter()
            .map(|p| Point2f::new(p.x as f32, p.y as f32))
            .collect();
        // DP keeps the contour's start point even when it lies mid-edge
        let merged = merge_close_vertices(points, MERGE_DIST);
        Some(drop_collinear(merged, epsilon as f32))
    }

    /// Apply the shape filters to one polygon in contour order.
    pub fn accept(&self, polygon: &[Point2f], frame_area: f32) -> Option<Quad> {
        if polygon.len() != 4 || !is_convex(polygon) {
            return None;
        }
        if polygon_area(polygon) < self.cfg.min_area_ratio * frame_area {
            return None;
        }
        if side_ratio(polygon) > self.cfg.max_side_ratio {
            return None;
        }
        Some(Quad::new([polygon[0], polygon[1], polygon[2], polygon[3]]))
    }
}

/// Outline rings produce an outer and an inner border of the same shape;
/// keep the larger of any two quads with near-identical centroid and area.
fn suppress_duplicates(sorted: Vec<Quad>) -> Vec<Quad> {
    let mut kept: Vec<Quad> = Vec::with_capacity(sorted.len());
    for q in sorted {
        let area = q.area();
        let c = q.centroid();
        let dup = kept.iter().any(|k| {
            let ka = k.area();
            ka > 0.0 && area / ka > 0.8 && k.centroid().distance(&c) < 0.1 * ka.sqrt()
        });
        if !dup {
            kept.push(q);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};
    use proptest::prelude::*;

    fn p(x: f32, y: f32) -> Point2f {
        Point2f::new(x, y)
    }

    #[test]
    fn test_order_quad_axis_aligned() {
        let shuffled = [p(100.0, 80.0), p(0.0, 0.0), p(0.0, 80.0), p(100.0, 0.0)];
        let q = Quad::new(shuffled);
        assert_eq!(q.corners, [p(0.0, 0.0), p(100.0, 0.0), p(100.0, 80.0), p(0.0, 80.0)]);
    }

    #[test]
    fn test_order_quad_tilted() {
        let pts = [p(60.0, 10.0), p(110.0, 60.0), p(50.0, 110.0), p(10.0, 50.0)];
        let q = Quad::new(pts);
        assert_eq!(q.corners, [p(10.0, 50.0), p(60.0, 10.0), p(110.0, 60.0), p(50.0, 110.0)]);
        assert!(is_convex(&q.corners));
        assert!((q.area() - polygon_area(&pts)).abs() < 1e-3);
    }

    #[test]
    fn test_order_quad_diamond_falls_back_to_angular() {
        // x + y ties between the left and top vertices
        let pts = [p(50.0, 0.0), p(100.0, 50.0), p(50.0, 100.0), p(0.0, 50.0)];
        let q = Quad::new(pts);
        assert!(is_convex(&q.corners));
        let mut seen: Vec<(i32, i32)> =
            q.corners.iter().map(|c| (c.x as i32, c.y as i32)).collect();
        seen.sort();
        assert_eq!(seen, vec![(0, 50), (50, 0), (50, 100), (100, 50)]);
    }

    #[test]
    fn test_convexity() {
        assert!(is_convex(&[p(0.0, 0.0), p(10.0, 0.0), p(10.0, 10.0), p(0.0, 10.0)]));
        // bowtie
        assert!(!is_convex(&[p(0.0, 0.0), p(10.0, 10.0), p(10.0, 0.0), p(0.0, 10.0)]));
        // dart
        assert!(!is_convex(&[p(0.0, 0.0), p(10.0, 5.0), p(0.0, 10.0), p(3.0, 5.0)]));
        // collinear
        assert!(!is_convex(&[p(0.0, 0.0), p(5.0, 0.0), p(10.0, 0.0), p(0.0, 10.0)]));
    }

    #[test]
    fn test_accept_filters() {
        let det = QuadDetector::new(QuadConfig::default());
        let frame_area = 200.0 * 150.0;
        let good = [p(50.0, 35.0), p(150.0, 35.0), p(150.0, 115.0), p(50.0, 115.0)];
        assert!(det.accept(&good, frame_area).is_some());

        let tiny = [p(0.0, 0.0), p(10.0, 0.0), p(10.0, 10.0), p(0.0, 10.0)];
        assert!(det.accept(&tiny, frame_area).is_none());

        let long = [p(0.0, 0.0), p(180.0, 0.0), p(180.0, 60.0), p(0.0, 60.0)];
        assert!(det.accept(&long, frame_area).is_none());

        let triangle = [p(0.0, 0.0), p(100.0, 0.0), p(50.0, 100.0)];
        assert!(det.accept(&triangle, frame_area).is_none());
    }

    #[test]
    fn test_merge_close_vertices_wraps() {
        let pts = vec![
            p(0.0, 0.0),
            p(0.5, 0.0),
            p(10.0, 0.0),
            p(10.0, 10.0),
            p(0.0, 10.0),
            p(0.2, 0.3),
        ];
        let merged = merge_close_vertices(pts, MERGE_DIST);
        assert_eq!(merged, vec![p(0.0, 0.0), p(10.0, 0.0), p(10.0, 10.0), p(0.0, 10.0)]);
    }

    #[test]
    fn test_drop_collinear_removes_mid_edge_start() {
        let pts = vec![p(40.0, 0.0), p(100.0, 0.0), p(100.0, 80.0), p(0.0, 80.0), p(0.0, 0.0)];
        let out = drop_collinear(pts, 2.0);
        assert_eq!(out, vec![p(100.0, 0.0), p(100.0, 80.0), p(0.0, 80.0), p(0.0, 0.0)]);
    }

    fn rect_on_dark(fg: [u8; 3]) -> Frame {
        Frame::new(RgbaImage::from_fn(200, 150, |x, y| {
            if (50..150).contains(&x) && (35..115).contains(&y) {
                Rgba([fg[0], fg[1], fg[2], 255])
            } else {
                Rgba([30, 30, 30, 255])
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_moderate_contrast_steps_are_found() {
        // luminance steps of roughly 87, 90 and 225 over the background
        let det = QuadDetector::new(QuadConfig::default());
        for fg in [[250, 60, 60], [120, 120, 120], [255, 255, 255]] {
            let frame = rect_on_dark(fg);
            let edges = det.edge_map(&frame);
            assert!(edges.pixels().any(|p| p[0] > 0), "no edges for {fg:?}");
            let quads = det.detect(&frame);
            assert!(!quads.is_empty(), "no quad for {fg:?}");
            let c = quads[0].centroid();
            assert!((c.x - 99.5).abs() < 4.0 && (c.y - 74.5).abs() < 4.0, "{fg:?}: {c:?}");
        }
    }

    #[test]
    fn test_faint_step_is_ignored() {
        // a 20-level step stays under the high threshold
        let frame = rect_on_dark([50, 50, 50]);
        assert!(QuadDetector::new(QuadConfig::default()).detect(&frame).is_empty());
    }

    #[test]
    fn test_detect_blank_frame_is_empty() {
        let frame = Frame::new(RgbaImage::from_pixel(64, 48, Rgba([30, 30, 30, 255]))).unwrap();
        assert!(QuadDetector::new(QuadConfig::default()).detect(&frame).is_empty());
    }

    #[test]
    fn test_bounding_box() {
        let q = Quad::new([p(10.5, 5.0), p(40.0, 6.0), p(41.0, 30.0), p(9.0, 29.0)]);
        let b = q.bounding_box(100, 100);
        assert_eq!((b.x, b.y, b.w, b.h), (9, 5, 32, 25));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_detected_quads_pass_filters(
            rects in prop::collection::vec(
                (0u32..96, 0u32..72, 4u32..96, 4u32..72, any::<u8>()),
                0..4,
            ),
            noise in prop::collection::vec(any::<u8>(), 96 * 72),
            bg in any::<u8>(),
        ) {
            let (w, h) = (96u32, 72u32);
            let img = RgbaImage::from_fn(w, h, |x, y| {
                let mut v = bg / 2 + noise[(y * w + x) as usize] / 8;
                for &(rx, ry, rw, rh, shade) in &rects {
                    if (rx..rx + rw).contains(&x) && (ry..ry + rh).contains(&y) {
                        v = shade;
                    }
                }
                Rgba([v, v, v, 255])
            });
            let cfg = QuadConfig::default();
            let det = QuadDetector::new(cfg.clone());
            let quads = det.detect(&Frame::new(img).unwrap());

            let frame_area = (w * h) as f32;
            prop_assert!(quads.len() <= cfg.max_rois);
            for q in &quads {
                prop_assert!(is_convex(&q.corners), "{:?}", q);
                prop_assert!(q.area() >= cfg.min_area_ratio * frame_area, "{:?}", q);
                prop_assert!(side_ratio(&q.corners) <= cfg.max_side_ratio, "{:?}", q);
            }
            for pair in quads.windows(2) {
                prop_assert!(pair[0].area() >= pair[1].area());
            }
        }
    }
}
