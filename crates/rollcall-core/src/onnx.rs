//! InsightFace `buffalo_l` embedding provider: SCRFD detection followed by
//! ArcFace recognition on each aligned face.

use crate::detector::{DetectorError, FaceDetector};
use crate::provider::{EmbeddingProvider, ProviderError};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::DetectedFace;
use image::RgbImage;
use std::path::{Path, PathBuf};

pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

/// `$XDG_DATA_HOME/rollcall`, or `~/.local/share/rollcall`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

/// `models/` under [`default_data_dir`].
pub fn default_model_dir() -> PathBuf {
    default_data_dir().join("models")
}

impl From<DetectorError> for ProviderError {
    fn from(e: DetectorError) -> Self {
        match e {
            DetectorError::ModelNotFound(p) => ProviderError::ModelNotFound(p),
            DetectorError::InferenceFailed(m) => ProviderError::InferenceFailed(format!("detector: {m}")),
            DetectorError::Ort(e) => ProviderError::Ort(e),
        }
    }
}

impl From<RecognizerError> for ProviderError {
    fn from(e: RecognizerError) -> Self {
        match e {
            RecognizerError::ModelNotFound(p) => ProviderError::ModelNotFound(p),
            RecognizerError::Ort(e) => ProviderError::Ort(e),
            other => ProviderError::InferenceFailed(format!("recognizer: {other}")),
        }
    }
}

/// Detector + recognizer pair, loaded once and reused for every image.
pub struct OnnxProvider {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxProvider {
    /// Load both models from `model_dir`. Fails fast if either file is missing.
    pub fn load(model_dir: &Path) -> Result<Self, ProviderError> {
        let det_path = model_dir.join(DETECTOR_MODEL_FILE);
        let rec_path = model_dir.join(RECOGNIZER_MODEL_FILE);

        let detector = FaceDetector::load(&det_path.to_string_lossy())?;
        tracing::info!(path = %det_path.display(), "SCRFD detector loaded");

        let recognizer = FaceRecognizer::load(&rec_path.to_string_lossy())?;
        tracing::info!(path = %rec_path.display(), "ArcFace recognizer loaded");

        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl EmbeddingProvider for OnnxProvider {
    fn analyze(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, ProviderError> {
        let boxes = self.detector.detect(image)?;
        let mut faces = Vec::with_capacity(boxes.len());

        for bbox in boxes {
            match self.recognizer.extract(image, &bbox) {
                Ok(embedding) => faces.push(DetectedFace { bbox, embedding }),
                Err(RecognizerError::NoLandmarks) => {
                    tracing::warn!(confidence = bbox.confidence, "face without landmarks skipped");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(faces)
    }
}
