//! Per-tick orchestration: throttle, detect, smooth the box, normalize,
//! classify (inline or detached) and report.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::det::{strategy_from_config, Detection, Overlay, RoiStrategy};
use crate::dispatch::{DetachedClassifier, Dispatcher, InferenceOutcome, InferenceRequest, Submit};
use crate::edge_box::BoxRegion;
use crate::engine::{Classifier, EngineError};
use crate::image_impl::{Frame, Point2f};
use crate::labels::LabelMap;
use crate::preprocess::{Normalizer, RoiSource};
use crate::smoother::{Prediction, SlotBank, TemporalSmoother};
use crate::types::{DetectionStrategy, DispatchMode, PipelineConfig};

/// State carried from one tick to the next.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    /// Smoothed box of slot 0, reused when a tick detects nothing.
    pub last_box: Option<BoxRegion>,
    pub slots: SlotBank,
    /// Last generation id handed out.
    pub generation: u64,
}

impl PipelineContext {
    pub fn new(slot_capacity: usize) -> Self {
        Self {
            last_box: None,
            slots: SlotBank::new(slot_capacity),
            generation: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickStatus {
    Processed,
    Throttled,
    NoFrame,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotReport {
    pub slot: usize,
    pub overlay: Overlay,
    /// Display label, present when the prediction clears the confidence threshold.
    pub label: Option<String>,
    pub confidence_pct: Option<f32>,
    pub prediction: Option<Prediction>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TickTimings {
    pub detect_ms: f64,
    pub preprocess_ms: f64,
    pub inference_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub tick: u64,
    pub status: TickStatus,
    pub strategy: &'static str,
    pub slots: Vec<SlotReport>,
    pub timings: TickTimings,
    pub errors: Vec<String>,
}

impl TickReport {
    fn new(tick: u64, status: TickStatus, strategy: &'static str) -> Self {
        Self {
            tick,
            status,
            strategy,
            slots: Vec::new(),
            timings: TickTimings::default(),
            errors: Vec::new(),
        }
    }
}

pub struct FrameLoop {
    cfg: PipelineConfig,
    strategy: Box<dyn RoiStrategy>,
    normalizer: Normalizer,
    smoother: TemporalSmoother,
    labels: LabelMap,
    dispatcher: Option<Dispatcher>,
    ctx: PipelineContext,
    last_tick: Option<Instant>,
    ticks: u64,
    stopped: bool,
}

impl FrameLoop {
    /// Detection-only loop; attach a model with [`FrameLoop::with_classifier`].
    pub fn new(cfg: PipelineConfig, labels: LabelMap) -> Result<Self, EngineError> {
        cfg.validate()?;
        let strategy = strategy_from_config(&cfg);
        tracing::info!(
            strategy = strategy.name(),
            dispatch = ?cfg.frame_loop.dispatch,
            min_interval_ms = cfg.frame_loop.min_interval_ms,
            "frame loop configured"
        );
        Ok(Self {
            normalizer: Normalizer::new(cfg.normalize.clone()),
            smoother: TemporalSmoother::new(cfg.smoothing.clone()),
            ctx: PipelineContext::new(cfg.slot_capacity()),
            strategy,
            labels,
            dispatcher: None,
            last_tick: None,
            ticks: 0,
            stopped: false,
            cfg,
        })
    }

    pub fn with_strategy(mut self, strategy: Box<dyn RoiStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_classifier(mut self, classifier: Box<dyn Classifier>) -> Result<Self, EngineError> {
        if let Some(layout) = classifier.layout() {
            self.normalizer.set_layout(layout);
        }
        self.dispatcher = Some(match self.cfg.frame_loop.dispatch {
            DispatchMode::Inline => Dispatcher::Inline(classifier),
            DispatchMode::Detached => Dispatcher::Detached(DetachedClassifier::spawn(
                classifier,
                self.cfg.frame_loop.queue_depth,
            )?),
        });
        Ok(self)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.cfg
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.cfg.frame_loop.min_interval_ms)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Cancel the loop. Later ticks report `Stopped` and results still in
    /// flight are discarded.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Some(Dispatcher::Detached(d)) = &mut self.dispatcher {
            d.shutdown();
        }
        tracing::info!(ticks = self.ticks, "frame loop stopped");
    }

    pub fn tick(&mut self, now: Instant, frame: Option<&Frame>) -> TickReport {
        self.ticks += 1;
        let name = self.strategy.name();

        if self.stopped {
            return TickReport::new(self.ticks, TickStatus::Stopped, name);
        }
        let Some(frame) = frame else {
            return TickReport::new(self.ticks, TickStatus::NoFrame, name);
        };
        if let Some(last) = self.last_tick {
            if now.saturating_duration_since(last) < self.min_interval() {
                return TickReport::new(self.ticks, TickStatus::Throttled, name);
            }
        }
        self.last_tick = Some(now);

        let report = self.process(frame);
        tracing::debug!(
            tick = report.tick,
            slots = report.slots.len(),
            detect_ms = report.timings.detect_ms,
            preprocess_ms = report.timings.preprocess_ms,
            inference_ms = report.timings.inference_ms,
            "tick processed"
        );
        report
    }

    /// Wait up to `timeout` for one detached result and apply it.
    /// Returns whether anything was applied.
    pub fn settle(&mut self, timeout: Duration) -> bool {
        if self.stopped {
            return false;
        }
        let outcome = match &self.dispatcher {
            Some(Dispatcher::Detached(d)) => d.wait(timeout),
            _ => None,
        };
        match outcome {
            Some(o) => {
                let name = self.strategy.name();
                let mut scratch = TickReport::new(self.ticks, TickStatus::Processed, name);
                self.apply_outcome(o, &mut scratch)
            }
            None => false,
        }
    }

    fn process(&mut self, frame: &Frame) -> TickReport {
        let mut report = TickReport::new(self.ticks, TickStatus::Processed, self.strategy.name());

        let finished = match &self.dispatcher {
            Some(Dispatcher::Detached(d)) => d.drain(),
            _ => Vec::new(),
        };
        for outcome in finished {
            self.apply_outcome(outcome, &mut report);
        }

        let det = self.strategy.run(frame);
        report.timings.detect_ms = det.elapse * 1000.0;
        report.errors.extend(det.errors);

        let mut detections = det.detections;
        if detections.is_empty() && self.cfg.strategy == DetectionStrategy::EdgeBox {
            if let Some(b) = self.ctx.last_box {
                detections.push(Detection {
                    overlay: Overlay::Box(b),
                    rectified: None,
                });
            }
        }

        let centroids: Vec<Point2f> = detections.iter().map(|d| d.overlay.centroid()).collect();
        let slots = self
            .ctx
            .slots
            .assign(&centroids, self.cfg.smoothing.slot_assignment);

        for (det, slot) in detections.into_iter().zip(slots) {
            if let Some(slot_report) = self.process_slot(frame, det, slot, &mut report) {
                report.slots.push(slot_report);
            }
        }
        report.slots.sort_by_key(|s| s.slot);
        report
    }

    fn process_slot(
        &mut self,
        frame: &Frame,
        det: Detection,
        slot: usize,
        report: &mut TickReport,
    ) -> Option<SlotReport> {
        let box_alpha = self.cfg.smoothing.box_ema;
        let overlay = {
            let state = self.ctx.slots.slot_mut(slot)?;
            let overlay = match det.overlay {
                Overlay::Box(b) => {
                    Overlay::Box(state.bbox.update(&b, box_alpha, frame.width(), frame.height()))
                }
                other => other,
            };
            state.centroid = Some(overlay.centroid());
            overlay
        };
        if let (Overlay::Box(b), 0) = (&overlay, slot) {
            self.ctx.last_box = Some(*b);
        }

        let mut slot_report = SlotReport {
            slot,
            overlay,
            label: None,
            confidence_pct: None,
            prediction: None,
            error: None,
        };

        if self.dispatcher.is_none() {
            return Some(slot_report);
        }

        let start = Instant::now();
        let source = match (&det.rectified, &overlay) {
            (Some(img), _) => RoiSource::Rectified(img),
            (None, Overlay::Box(b)) => RoiSource::Region(b),
            (None, Overlay::Quad(_)) => RoiSource::None,
        };
        let tensor = self.normalizer.run(frame, source);
        report.timings.preprocess_ms += start.elapsed().as_secs_f64() * 1000.0;

        self.ctx.generation += 1;
        let generation = self.ctx.generation;

        let inline = match &mut self.dispatcher {
            Some(Dispatcher::Inline(classifier)) => {
                let start = Instant::now();
                let result = classifier.classify(&tensor);
                let elapsed = start.elapsed();
                report.timings.inference_ms += elapsed.as_secs_f64() * 1000.0;
                Some(InferenceOutcome {
                    generation,
                    slot,
                    result,
                    elapsed,
                })
            }
            Some(Dispatcher::Detached(d)) => {
                match d.submit(InferenceRequest {
                    generation,
                    slot,
                    tensor,
                }) {
                    Ok(Submit::Queued) => {}
                    Ok(Submit::Dropped) => {
                        tracing::debug!(generation, slot, "inference busy, frame dropped");
                    }
                    Err(err) => {
                        tracing::warn!(%err, slot, "inference submit failed");
                        slot_report.error = Some(err.to_string());
                    }
                }
                None
            }
            None => None,
        };

        if let Some(outcome) = inline {
            if let Err(err) = &outcome.result {
                slot_report.error = Some(err.to_string());
            }
            // timing already counted above
            let mut scratch = TickReport::new(report.tick, TickStatus::Processed, report.strategy);
            self.apply_outcome(outcome, &mut scratch);
        }

        if let Some(p) = self.ctx.slots.get(slot).and_then(|s| s.latest.clone()) {
            slot_report.confidence_pct = Some(p.top1_prob * 100.0);
            if p.confident {
                slot_report.label = Some(self.labels.label(p.top1).into_owned());
            }
            slot_report.prediction = Some(p);
        }
        Some(slot_report)
    }

    /// Fold one classifier result into its slot. Results not newer than the
    /// slot's last applied generation are discarded.
    pub(crate) fn apply_outcome(
        &mut self,
        outcome: InferenceOutcome,
        report: &mut TickReport,
    ) -> bool {
        if self.stopped {
            return false;
        }
        let Some(state) = self.ctx.slots.slot_mut(outcome.slot) else {
            return false;
        };
        if outcome.generation <= state.generation {
            tracing::debug!(
                generation = outcome.generation,
                applied = state.generation,
                slot = outcome.slot,
                "discarding stale result"
            );
            return false;
        }
        state.generation = outcome.generation;
        report.timings.inference_ms += outcome.elapsed.as_secs_f64() * 1000.0;

        match outcome.result {
            Ok(logits) => match self.smoother.step(&mut state.prob, &logits) {
                Some(p) => {
                    state.latest = Some(p);
                    true
                }
                None => {
                    report.errors.push("classifier returned no logits".to_string());
                    false
                }
            },
            Err(err) => {
                tracing::warn!(%err, slot = outcome.slot, "inference failed");
                report.errors.push(err.to_string());
                false
            }
        }
    }
}

impl Drop for FrameLoop {
    fn drop(&mut self) {
        self.stop();
    }
}
