use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::engine::EngineError;

/// Which ROI detector feeds the normalizer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionStrategy {
    /// Axis-aligned edge-energy box search, one implicit slot.
    #[serde(rename = "box")]
    EdgeBox,
    /// Contour quads with perspective rectification, up to `max_rois` slots.
    Quad,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CropMode {
    Full,
    Center,
    Auto,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormMode {
    /// `v / 127.5 - 1`
    #[serde(rename = "neg1to1")]
    Neg1To1,
    /// `v / 255`
    #[serde(rename = "zero1")]
    Zero1,
    /// `(v / 255 - mean) / std` with ImageNet statistics
    #[serde(rename = "imagenet")]
    Imagenet,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorLayout {
    /// `[1, 3, H, W]`
    Nchw,
    /// `[1, H, W, 3]`
    Nhwc,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Classify synchronously inside the tick.
    Inline,
    /// Hand tensors to a worker thread; results are applied on a later tick.
    Detached,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotAssignment {
    /// Slot `i` is the `i`-th ranked detection of the tick.
    Positional,
    /// Greedy nearest-centroid match against the previous tick's slots.
    NearestCentroid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EdgeBoxConfig {
    pub analysis_width: u32,
    pub aspects: Vec<f32>,
    pub min_width_frac: f32,
    pub max_width_frac: f32,
    pub width_step_frac: f32,
    pub min_width_step: u32,
    pub offset_step_frac: f32,
    pub min_offset_step: u32,
    pub min_height: u32,
}

impl Default for EdgeBoxConfig {
    fn default() -> Self {
        Self {
            analysis_width: 160,
            aspects: vec![1.33, 1.5, 1.6],
            min_width_frac: 0.45,
            max_width_frac: 0.95,
            width_step_frac: 0.08,
            min_width_step: 8,
            offset_step_frac: 0.06,
            min_offset_step: 6,
            min_height: 16,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QuadConfig {
    pub canny_low: f32,
    pub canny_high: f32,
    /// Polygon approximation tolerance as a fraction of the contour perimeter.
    pub approx_epsilon: f64,
    pub min_area_ratio: f32,
    pub max_side_ratio: f32,
    pub median_radius: u32,
    pub max_rois: usize,
}

impl Default for QuadConfig {
    fn default() -> Self {
        Self {
            canny_low: 70.0,
            canny_high: 180.0,
            approx_epsilon: 0.02,
            min_area_ratio: 0.03,
            max_side_ratio: 1.7,
            median_radius: 1,
            max_rois: 4,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RectifyConfig {
    pub roi_size: u32,
    /// Down/up resampling factor of the anti-moire pass; `1.0` disables it.
    pub anti_alias_scale: f32,
}

impl Default for RectifyConfig {
    fn default() -> Self {
        Self {
            roi_size: 256,
            anti_alias_scale: 0.75,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NormalizeConfig {
    pub input_size: u32,
    pub crop_mode: CropMode,
    pub norm_mode: NormMode,
    pub layout: TensorLayout,
    pub roi_pad: f32,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            input_size: 224,
            crop_mode: CropMode::Auto,
            norm_mode: NormMode::Neg1To1,
            layout: TensorLayout::Nchw,
            roi_pad: 0.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SmoothingConfig {
    pub prob_ema: f32,
    pub box_ema: f32,
    pub temperature: f32,
    pub confidence_threshold: f32,
    pub top_k: usize,
    pub slot_assignment: SlotAssignment,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            prob_ema: 0.0,
            box_ema: 0.0,
            temperature: 1.0,
            confidence_threshold: 0.0,
            top_k: 3,
            slot_assignment: SlotAssignment::Positional,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoopConfig {
    pub min_interval_ms: u64,
    pub dispatch: DispatchMode,
    /// Pending detached requests allowed before new ones are dropped.
    pub queue_depth: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 150,
            dispatch: DispatchMode::Detached,
            queue_depth: 1,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub intra_op_num_threads: usize,
    pub inter_op_num_threads: usize,
    /// Output to read logits from; the first output when unset.
    pub output_name: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        // Auto-detect optimal thread count (use all available CPUs)
        let num_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            intra_op_num_threads: num_threads,
            inter_op_num_threads: 1,
            output_name: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub strategy: DetectionStrategy,
    pub edge_box: EdgeBoxConfig,
    pub quad: QuadConfig,
    pub rectify: RectifyConfig,
    pub normalize: NormalizeConfig,
    pub smoothing: SmoothingConfig,
    pub frame_loop: LoopConfig,
    pub engine: EngineConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::edge_box()
    }
}

impl PipelineConfig {
    /// Fast box pipeline: edge-energy search, `neg1to1` input, fire-and-forget inference.
    pub fn edge_box() -> Self {
        Self {
            strategy: DetectionStrategy::EdgeBox,
            edge_box: EdgeBoxConfig::default(),
            quad: QuadConfig::default(),
            rectify: RectifyConfig::default(),
            normalize: NormalizeConfig::default(),
            smoothing: SmoothingConfig::default(),
            frame_loop: LoopConfig::default(),
            engine: EngineConfig::default(),
        }
    }

    /// Quad pipeline: rectified ROIs, ImageNet input, temperature 1.5 and
    /// probability EMA 0.7, awaited inference per slot.
    pub fn quad() -> Self {
        Self {
            strategy: DetectionStrategy::Quad,
            normalize: NormalizeConfig {
                norm_mode: NormMode::Imagenet,
                ..NormalizeConfig::default()
            },
            smoothing: SmoothingConfig {
                prob_ema: 0.7,
                temperature: 1.5,
                confidence_threshold: 0.75,
                ..SmoothingConfig::default()
            },
            frame_loop: LoopConfig {
                min_interval_ms: 0,
                dispatch: DispatchMode::Inline,
                ..LoopConfig::default()
            },
            ..Self::edge_box()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        let cfg: Self = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let eb = &self.edge_box;
        check(eb.analysis_width >= 1, "edge_box.analysis_width must be >= 1")?;
        check(!eb.aspects.is_empty(), "edge_box.aspects must not be empty")?;
        check(
            eb.aspects.iter().all(|a| a.is_finite() && *a > 0.0),
            "edge_box.aspects must be positive",
        )?;
        check(
            (0.0..=1.0).contains(&eb.min_width_frac)
                && (0.0..=1.0).contains(&eb.max_width_frac)
                && eb.min_width_frac <= eb.max_width_frac,
            "edge_box width fractions must satisfy 0 <= min <= max <= 1",
        )?;
        check(
            eb.width_step_frac >= 0.0 && eb.offset_step_frac >= 0.0,
            "edge_box step fractions must be >= 0",
        )?;
        check(
            eb.min_width_step >= 1 && eb.min_offset_step >= 1,
            "edge_box minimum steps must be >= 1",
        )?;

        let q = &self.quad;
        check(
            q.canny_low >= 0.0 && q.canny_low <= q.canny_high,
            "quad.canny_low must be in [0, canny_high]",
        )?;
        check(q.approx_epsilon > 0.0, "quad.approx_epsilon must be > 0")?;
        check(
            (0.0..=1.0).contains(&q.min_area_ratio),
            "quad.min_area_ratio must be in [0, 1]",
        )?;
        check(q.max_side_ratio >= 1.0, "quad.max_side_ratio must be >= 1")?;
        check(q.max_rois >= 1, "quad.max_rois must be >= 1")?;

        check(self.rectify.roi_size >= 1, "rectify.roi_size must be >= 1")?;
        check(
            self.rectify.anti_alias_scale > 0.0 && self.rectify.anti_alias_scale <= 1.0,
            "rectify.anti_alias_scale must be in (0, 1]",
        )?;

        check(self.normalize.input_size >= 1, "normalize.input_size must be >= 1")?;
        check(
            self.normalize.roi_pad.is_finite() && self.normalize.roi_pad >= 0.0,
            "normalize.roi_pad must be >= 0",
        )?;

        let s = &self.smoothing;
        check((0.0..=1.0).contains(&s.prob_ema), "smoothing.prob_ema must be in [0, 1]")?;
        check((0.0..=1.0).contains(&s.box_ema), "smoothing.box_ema must be in [0, 1]")?;
        check(
            s.temperature.is_finite() && s.temperature > 0.0,
            "smoothing.temperature must be > 0",
        )?;
        check(
            (0.0..=1.0).contains(&s.confidence_threshold),
            "smoothing.confidence_threshold must be in [0, 1]",
        )?;
        check(s.top_k >= 1, "smoothing.top_k must be >= 1")?;

        check(self.frame_loop.queue_depth >= 1, "frame_loop.queue_depth must be >= 1")?;
        Ok(())
    }

    /// Number of EMA slots the configured strategy can address.
    pub fn slot_capacity(&self) -> usize {
        match self.strategy {
            DetectionStrategy::EdgeBox => 1,
            DetectionStrategy::Quad => self.quad.max_rois,
        }
    }
}

fn check(ok: bool, msg: &str) -> Result<(), EngineError> {
    if ok {
        Ok(())
    } else {
        Err(EngineError::Config(msg.to_string()))
    }
}
