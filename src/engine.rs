use crate::preprocess::Tensor;
use crate::types::TensorLayout;

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[cfg(feature = "onnx")]
    #[error("ORT error: {0}")]
    Ort(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Image processing error: {0}")]
    ImageError(String),

    #[error("Geometry error: {0}")]
    Geometry(String),

    #[error("Invalid input shape")]
    InvalidInputShape,

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Inference worker is gone")]
    WorkerGone,
}

impl From<image::ImageError> for EngineError {
    fn from(err: image::ImageError) -> Self {
        EngineError::ImageError(err.to_string())
    }
}

/// Anything that turns one input tensor into one logit vector.
///
/// Implementations own their runtime state; the detached dispatcher moves
/// the classifier onto its worker thread, hence the `Send` bound.
pub trait Classifier: Send {
    fn classify(&mut self, input: &Tensor) -> Result<Vec<f32>, EngineError>;

    /// Layout the model expects, when the classifier knows it.
    fn layout(&self) -> Option<TensorLayout> {
        None
    }
}

impl Classifier for Box<dyn Classifier> {
    fn classify(&mut self, input: &Tensor) -> Result<Vec<f32>, EngineError> {
        (**self).classify(input)
    }

    fn layout(&self) -> Option<TensorLayout> {
        (**self).layout()
    }
}

/// Layout implied by a model's 4-d input shape: channels of 3 at index 1
/// means NCHW, at index 3 NHWC. Dynamic dimensions are negative.
pub fn layout_from_input_shape(dims: &[i64]) -> Option<TensorLayout> {
    match dims {
        [_, 3, _, _] => Some(TensorLayout::Nchw),
        [_, _, _, 3] => Some(TensorLayout::Nhwc),
        _ => None,
    }
}

#[cfg(feature = "onnx")]
pub use ort_impl::OrtClassifier;

#[cfg(feature = "onnx")]
mod ort_impl {
    use std::path::Path;

    use ort::session::builder::GraphOptimizationLevel;
    use ort::session::Session;
    use ort::value::Tensor as OrtTensor;

    use super::{layout_from_input_shape, Classifier, EngineError};
    use crate::preprocess::Tensor;
    use crate::types::{EngineConfig, TensorLayout};

    fn ort_err<E: std::fmt::Display>(err: E) -> EngineError {
        EngineError::Ort(err.to_string())
    }

    pub struct OrtClassifier {
        session: Session,
        output_name: Option<String>,
        layout: TensorLayout,
    }

    impl OrtClassifier {
        pub fn from_path(
            model_path: &Path,
            engine_cfg: &EngineConfig,
            layout: TensorLayout,
            input_size: u32,
        ) -> Result<Self, EngineError> {
            let mut builder = Session::builder()
                .map_err(ort_err)?
                .with_optimization_level(GraphOptimizationLevel::Level3)
                .map_err(ort_err)?;

            if engine_cfg.intra_op_num_threads > 0 {
                builder = builder
                    .with_intra_threads(engine_cfg.intra_op_num_threads)
                    .map_err(ort_err)?;
            }

            if engine_cfg.inter_op_num_threads > 0 {
                builder = builder
                    .with_inter_threads(engine_cfg.inter_op_num_threads)
                    .map_err(ort_err)?;
            }

            let session = builder.commit_from_file(model_path).map_err(ort_err)?;

            let detected = session
                .inputs
                .first()
                .and_then(|input| input.input_type.tensor_shape())
                .and_then(|shape| layout_from_input_shape(shape));
            let layout = match detected {
                Some(found) => {
                    if found != layout {
                        tracing::info!(
                            configured = ?layout,
                            model = ?found,
                            "using model input layout"
                        );
                    }
                    found
                }
                None => layout,
            };
            tracing::info!(model = %model_path.display(), ?layout, "classifier session ready");

            let mut classifier = Self {
                session,
                output_name: engine_cfg.output_name.clone(),
                layout,
            };
            classifier.warm_up(input_size);
            Ok(classifier)
        }

        /// One zero-filled pass so the first real frame does not pay for
        /// lazy allocation. Failures are logged, not fatal.
        fn warm_up(&mut self, input_size: u32) {
            let s = input_size as usize;
            let shape = match self.layout {
                TensorLayout::Nchw => [1, 3, s, s],
                TensorLayout::Nhwc => [1, s, s, 3],
            };
            let zeros = Tensor::zeros(shape, self.layout);
            if let Err(err) = self.classify(&zeros) {
                tracing::warn!(%err, "classifier warm-up failed");
            }
        }
    }

    impl Classifier for OrtClassifier {
        fn classify(&mut self, input: &Tensor) -> Result<Vec<f32>, EngineError> {
            let shape: Vec<i64> = input.shape().iter().map(|&d| d as i64).collect();
            let value = OrtTensor::from_array((shape, input.to_vec())).map_err(ort_err)?;
            let outputs = self.session.run(ort::inputs![value]).map_err(ort_err)?;

            let output = match &self.output_name {
                Some(name) => outputs
                    .get(name.as_str())
                    .ok_or_else(|| EngineError::Inference(format!("no output named {name}")))?,
                None => &outputs[0],
            };
            let (_shape, logits) = output.try_extract_tensor::<f32>().map_err(ort_err)?;
            if logits.is_empty() {
                return Err(EngineError::InvalidInputShape);
            }
            Ok(logits.to_vec())
        }

        fn layout(&self) -> Option<TensorLayout> {
            Some(self.layout)
        }
    }
}
