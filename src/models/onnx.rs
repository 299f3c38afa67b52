//! ONNX Runtime backed embedding networks

use anyhow::{anyhow, bail, Result};
use ndarray::{Array2, ArrayViewD};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::Path;
use std::sync::Mutex;

use super::EmbeddingNetwork;
use crate::device::Device;

/// An exported network loaded into an ONNX Runtime session.
///
/// The session takes a single `f32` input and its first output is used as the
/// embedding. Running a session needs exclusive access, hence the mutex.
pub struct OnnxEncoder {
    name: String,
    session: Mutex<Session>,
}

impl OnnxEncoder {
    pub fn load(
        name: &str,
        model_path: &Path,
        device: Device,
        intra_threads: usize,
    ) -> Result<Self> {
        if !model_path.exists() {
            bail!("Model checkpoint not found: {}", model_path.display());
        }

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(intra_threads)?
            .with_execution_providers(device.execution_providers())?
            .commit_from_file(model_path)?;

        tracing::info!(
            model = %name,
            path = ?model_path,
            device = %device,
            "Loaded embedding network"
        );

        Ok(Self {
            name: name.to_string(),
            session: Mutex::new(session),
        })
    }
}

impl EmbeddingNetwork for OnnxEncoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn embed(&self, input: ArrayViewD<'_, f32>) -> Result<Array2<f32>> {
        let batch = input.shape().first().copied().unwrap_or(0);
        let shape = input.shape().to_vec();
        let data: Vec<f32> = input.iter().copied().collect();

        let input_tensor = Tensor::from_array((shape, data.into_boxed_slice()))?;

        let mut model = self
            .session
            .lock()
            .map_err(|e| anyhow!("Failed to lock model {}: {}", self.name, e))?;

        let outputs = model.run(ort::inputs![input_tensor])?;

        let embedding_output = outputs
            .iter()
            .next()
            .ok_or_else(|| anyhow!("Model {} produced no output", self.name))?;

        let (out_shape, embedding_data) = embedding_output.1.try_extract_tensor::<f32>()?;

        let rows = out_shape.first().copied().unwrap_or(0) as usize;
        if rows != batch {
            bail!(
                "Model {} returned {} rows for a batch of {}",
                self.name,
                rows,
                batch
            );
        }
        let cols = if rows == 0 { 0 } else { embedding_data.len() / rows };

        Ok(Array2::from_shape_vec((rows, cols), embedding_data.to_vec())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_checkpoint() {
        let path = Path::new("/nonexistent/stack.onnx");
        let result = OnnxEncoder::load("stack", path, Device::Cpu, 1);
        let err = result.err().unwrap();
        assert!(err.to_string().contains("Model checkpoint not found"));
    }
}
