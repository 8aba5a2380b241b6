//! # Slate - ROI detection and smoothed classification for live frames
//!
//! Slate locates a flat rectangular object (a card, a tablet screen, a sheet
//! of paper) in each video frame, crops or perspective-corrects it, turns it
//! into a model-ready tensor and classifies it with temporal smoothing.
//!
//! ## Pipelines
//!
//! - **Box**: Sobel edge energy over a summed-area table picks one
//!   axis-aligned box per frame. Cheap, runs on every tick.
//! - **Quad**: Canny edges and polygon approximation find up to four convex
//!   quads, each warped to a square before classification.
//!
//! Classification runs either inline or on a detached worker thread that
//! drops requests while busy. Probabilities are smoothed per slot with a
//! temperature softmax and an exponential moving average.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Instant;
//! use slate::{Frame, FrameLoop, LabelMap, PipelineConfig};
//!
//! let mut frames = FrameLoop::new(PipelineConfig::quad(), LabelMap::new())?;
//! let frame = Frame::open("frame.png")?;
//! let report = frames.tick(Instant::now(), Some(&frame));
//!
//! for slot in &report.slots {
//!     println!("{}: {:?}", slot.slot, slot.overlay);
//! }
//! # Ok::<(), slate::EngineError>(())
//! ```

// Core modules
mod contours;
mod det;
mod dispatch;
mod edge_box;
mod engine;
mod frame_loop;
mod geometry;
mod image_impl;
mod labels;
mod preprocess;
mod smoother;
mod types;

// Public API exports
pub use crate::contours::{order_quad, Quad, QuadDetector};
pub use crate::det::{
    strategy_from_config, Detection, DetectionOutput, EdgeBoxStrategy, Overlay, QuadStrategy,
    RoiStrategy,
};
pub use crate::dispatch::{DetachedClassifier, InferenceOutcome, InferenceRequest, Submit};
pub use crate::edge_box::{sobel_magnitude, BoxRegion, EdgeBoxFinder, IntegralImage};
pub use crate::engine::{layout_from_input_shape, Classifier, EngineError};
pub use crate::frame_loop::{
    FrameLoop, PipelineContext, SlotReport, TickReport, TickStatus, TickTimings,
};
pub use crate::geometry::{anti_alias, center_square, pad_box, Rectifier};
pub use crate::image_impl::{
    get_perspective_transform, luminance, warp_perspective, Frame, Point2f, Size,
};
pub use crate::labels::LabelMap;
pub use crate::preprocess::{Normalizer, RoiSource, Tensor, IMAGENET_MEAN, IMAGENET_STD};
pub use crate::smoother::{
    softmax_with_temperature, BoxEma, Prediction, ProbEma, SlotBank, TemporalSmoother,
};
pub use crate::types::{
    CropMode, DetectionStrategy, DispatchMode, EdgeBoxConfig, EngineConfig, LoopConfig,
    NormMode, NormalizeConfig, PipelineConfig, QuadConfig, RectifyConfig, SlotAssignment,
    SmoothingConfig, TensorLayout,
};

#[cfg(feature = "onnx")]
pub use crate::engine::OrtClassifier;
