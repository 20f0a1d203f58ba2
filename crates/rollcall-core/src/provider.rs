//! The embedding provider boundary.
//!
//! A provider turns one RGB image into the faces it finds, each with a
//! bounding box and a fixed-length embedding. The bundled implementation
//! is [`OnnxProvider`](crate::onnx::OnnxProvider); tests use mocks.

use crate::types::DetectedFace;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("model file not found: {0} — download the buffalo_l pack from insightface and place it in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Face detection + embedding capability.
///
/// Implementations hold model state and are expected to be built once per
/// process and reused. `&mut self` because inference sessions are not
/// reentrant; callers that need parallelism run one provider per worker.
pub trait EmbeddingProvider: Send {
    /// Detect every face in `image` and embed it.
    ///
    /// Returning an empty `Vec` means no face was found; that is not an error.
    fn analyze(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, ProviderError>;
}

impl<P: EmbeddingProvider + ?Sized> EmbeddingProvider for Box<P> {
    fn analyze(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, ProviderError> {
        (**self).analyze(image)
    }
}
