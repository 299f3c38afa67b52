//! Embedding networks.
//!
//! The evaluation pipeline runs two networks side by side: one over frame
//! stacks and one over the paired audio samples. Both sit behind
//! [`EmbeddingNetwork`] so the pipeline does not care how they execute.

mod onnx;

use anyhow::Result;
use ndarray::{Array2, ArrayViewD};

pub use onnx::OnnxEncoder;

/// A network mapping a batch of inputs to one feature row per sample.
pub trait EmbeddingNetwork: Send + Sync {
    fn name(&self) -> &str;

    /// Run inference on a batch whose leading axis is the batch axis.
    fn embed(&self, input: ArrayViewD<'_, f32>) -> Result<Array2<f32>>;
}
