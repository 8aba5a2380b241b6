//! Temporal smoothing of per-ROI classifier output.
//!
//! Logits become probabilities through a temperature softmax and are then
//! folded into a per-slot exponential moving average. A slot is one of up to
//! `max_rois` tracked positions; each owns its probability and box EMA.

use serde::Serialize;

use crate::edge_box::BoxRegion;
use crate::image_impl::Point2f;
use crate::types::{SlotAssignment, SmoothingConfig};

/// `softmax(logits / T)`, max-subtracted. A non-positive or non-finite `T`
/// is treated as 1.
pub fn softmax_with_temperature(logits: &[f32], temperature: f32) -> Vec<f32> {
    if logits.is_empty() {
        return Vec::new();
    }
    let t = if temperature.is_finite() && temperature > 0.0 {
        temperature
    } else {
        1.0
    };
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| ((l - max) / t).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Class indices ordered by descending probability, lower index first on ties.
pub fn rank(probs: &[f32]) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..probs.len()).collect();
    idx.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]).then(a.cmp(&b)));
    idx
}

#[derive(Debug, Clone, Default)]
pub struct ProbEma {
    acc: Option<Vec<f32>>,
}

impl ProbEma {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold `probs` in with weight `1 - alpha`. The first observation, or one
    /// whose class count differs from the accumulator, replaces it.
    pub fn update(&mut self, probs: &[f32], alpha: f32) -> &[f32] {
        let acc = match self.acc.take() {
            Some(mut acc) if acc.len() == probs.len() => {
                for (a, &p) in acc.iter_mut().zip(probs) {
                    *a = alpha * *a + (1.0 - alpha) * p;
                }
                acc
            }
            Some(acc) => {
                tracing::warn!(
                    expected = acc.len(),
                    got = probs.len(),
                    "class count changed, resetting probability EMA"
                );
                probs.to_vec()
            }
            None => probs.to_vec(),
        };
        self.acc.insert(acc).as_slice()
    }

    pub fn value(&self) -> Option<&[f32]> {
        self.acc.as_deref()
    }

    pub fn is_ready(&self) -> bool {
        self.acc.is_some()
    }

    pub fn reset(&mut self) {
        self.acc = None;
    }
}

#[derive(Debug, Clone, Default)]
pub struct BoxEma {
    acc: Option<[f32; 4]>,
}

impl BoxEma {
    pub fn new() -> Self {
        Self::default()
    }

    /// Smooth `b` component-wise and clamp the result to the frame.
    pub fn update(&mut self, b: &BoxRegion, alpha: f32, frame_w: u32, frame_h: u32) -> BoxRegion {
        let obs = [b.x as f32, b.y as f32, b.w as f32, b.h as f32];
        let acc = match self.acc {
            Some(mut acc) => {
                for (a, o) in acc.iter_mut().zip(obs) {
                    *a = alpha * *a + (1.0 - alpha) * o;
                }
                acc
            }
            None => obs,
        };
        self.acc = Some(acc);
        BoxRegion {
            x: acc[0].round().max(0.0) as u32,
            y: acc[1].round().max(0.0) as u32,
            w: acc[2].round().max(1.0) as u32,
            h: acc[3].round().max(1.0) as u32,
            score: b.score,
        }
        .clamp_to(frame_w, frame_h)
    }

    pub fn reset(&mut self) {
        self.acc = None;
    }
}

/// Smoothed classification of one slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub top1: usize,
    pub top1_prob: f32,
    pub top_k: Vec<(usize, f32)>,
    pub confident: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SlotState {
    pub prob: ProbEma,
    pub bbox: BoxEma,
    pub centroid: Option<Point2f>,
    /// Highest inference generation applied to this slot.
    pub generation: u64,
    pub latest: Option<Prediction>,
}

/// Per-slot state, grown on demand and capped at `capacity`.
#[derive(Debug, Clone)]
pub struct SlotBank {
    slots: Vec<SlotState>,
    capacity: usize,
}

impl SlotBank {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&self, slot: usize) -> Option<&SlotState> {
        self.slots.get(slot)
    }

    /// `None` past capacity.
    pub fn slot_mut(&mut self, slot: usize) -> Option<&mut SlotState> {
        if slot >= self.capacity {
            return None;
        }
        if slot >= self.slots.len() {
            self.slots.resize_with(slot + 1, SlotState::default);
        }
        self.slots.get_mut(slot)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Slot index for each detection centroid, in input order. Detections
    /// beyond capacity are not assigned.
    pub fn assign(&self, centroids: &[Point2f], mode: SlotAssignment) -> Vec<usize> {
        let n = centroids.len().min(self.capacity);
        match mode {
            SlotAssignment::Positional => (0..n).collect(),
            SlotAssignment::NearestCentroid => self.assign_nearest(&centroids[..n]),
        }
    }

    fn assign_nearest(&self, centroids: &[Point2f]) -> Vec<usize> {
        let mut pairs: Vec<(f32, usize, usize)> = Vec::new();
        for (d, c) in centroids.iter().enumerate() {
            for (s, state) in self.slots.iter().enumerate() {
                if let Some(prev) = state.centroid {
                    pairs.push((c.distance(&prev), d, s));
                }
            }
        }
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        let mut out: Vec<Option<usize>> = vec![None; centroids.len()];
        let mut taken = vec![false; self.capacity];
        for (_, d, s) in pairs {
            if out[d].is_none() && !taken[s] {
                out[d] = Some(s);
                taken[s] = true;
            }
        }

        let mut free = (0..self.capacity).filter(|&s| !taken[s]);
        out.into_iter()
            .map(|slot| match slot {
                Some(s) => s,
                // capacity >= centroids.len(), so a free slot always remains
                None => free.next().unwrap_or(0),
            })
            .collect()
    }
}

/// Softmax + EMA + top-k for one slot.
#[derive(Debug, Clone)]
pub struct TemporalSmoother {
    cfg: SmoothingConfig,
}

impl TemporalSmoother {
    pub fn new(cfg: SmoothingConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &SmoothingConfig {
        &self.cfg
    }

    /// `None` for an empty logit vector.
    pub fn step(&self, state: &mut ProbEma, logits: &[f32]) -> Option<Prediction> {
        if logits.is_empty() {
            return None;
        }
        let probs = softmax_with_temperature(logits, self.cfg.temperature);
        let smoothed = state.update(&probs, self.cfg.prob_ema);

        let order = rank(smoothed);
        let top1 = order[0];
        let top1_prob = smoothed[top1];
        let top_k = order
            .iter()
            .take(self.cfg.top_k)
            .map(|&i| (i, smoothed[i]))
            .collect();

        Some(Prediction {
            top1,
            top1_prob,
            top_k,
            confident: top1_prob >= self.cfg.confidence_threshold,
        })
    }
}
