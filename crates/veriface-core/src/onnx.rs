//! Inference-only scorer for classifiers exported to ONNX.
//!
//! The graph must take one NCHW `f32` input of the configured input shape,
//! normalized the same way as training, and produce one sigmoid probability
//! per example.

use crate::classifier::{check_input, ClassifierError, Scorer};
use crate::preprocess::Normalization;
use crate::types::InputShape;
use ndarray::ArrayView4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

pub struct OnnxScorer {
    session: Session,
    shape: InputShape,
    normalization: Normalization,
}

impl OnnxScorer {
    pub fn load(
        path: &Path,
        shape: InputShape,
        normalization: Normalization,
    ) -> Result<Self, ClassifierError> {
        if !path.is_file() {
            return Err(ClassifierError::NotFound(path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(path)?;

        tracing::info!(
            path = %path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ONNX classifier"
        );

        Ok(Self {
            session,
            shape,
            normalization,
        })
    }
}

impl Scorer for OnnxScorer {
    fn input_shape(&self) -> InputShape {
        self.shape
    }

    fn normalization(&self) -> Normalization {
        self.normalization
    }

    fn predict(&mut self, inputs: ArrayView4<f32>) -> Result<Vec<f32>, ClassifierError> {
        check_input(&inputs, self.shape)?;
        let batch = inputs.shape()[0];

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(inputs)?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ClassifierError::Inference(format!("probability extraction: {e}")))?;

        if raw.len() != batch {
            return Err(ClassifierError::Inference(format!(
                "expected {batch} probabilities, got {}",
                raw.len()
            )));
        }
        if let Some(p) = raw.iter().find(|p| !(0.0..=1.0).contains(*p)) {
            return Err(ClassifierError::Inference(format!(
                "output {p} is not a probability; export the model with its sigmoid"
            )));
        }
        Ok(raw.to_vec())
    }
}
