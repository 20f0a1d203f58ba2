//! rollcall-core — Face matching engine for attendance.
//!
//! Turns images into face embeddings through an [`EmbeddingProvider`],
//! scores probes against an enrolled gallery, and decides who is present
//! with a per-probe threshold plus a vote count across shots.

pub mod alignment;
pub mod detector;
pub mod extract;
pub mod gallery;
pub mod matcher;
pub mod onnx;
pub mod provider;
pub mod recognizer;
pub mod similarity;
pub mod types;

pub use extract::{ExtractError, Extractor, FaceSelection, ImageInput};
pub use gallery::{Gallery, GalleryError, GalleryStore, InMemoryGallery};
pub use matcher::{decide, match_many, match_one, recognized_from_votes, CosineMatcher, MatchError, MatchParams, Matcher};
pub use onnx::{default_data_dir, default_model_dir, OnnxProvider};
pub use provider::{EmbeddingProvider, ProviderError};
pub use similarity::{distance, similarity, DimensionMismatch};
pub use types::{BoundingBox, DetectedFace, Embedding, GalleryEntry, IdentityId, MatchResult, Pose, ScopeId};
