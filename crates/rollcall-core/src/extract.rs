//! Embedding extraction adapter.
//!
//! Normalizes raw pixel arrays, decoded images, encoded buffers and base64
//! payloads into RGB, runs the provider, and picks faces out of the result.
//! A missing face is `None` / an empty list, never an error.

use crate::provider::{EmbeddingProvider, ProviderError};
use crate::types::{DetectedFace, Embedding};
use base64::Engine as _;
use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("image decode failed: {0}")]
    Decode(String),
    #[error("embedding provider: {0}")]
    Provider(#[from] ProviderError),
}

impl From<image::ImageError> for ExtractError {
    fn from(e: image::ImageError) -> Self {
        ExtractError::Decode(e.to_string())
    }
}

/// An image in any of the forms callers hand us.
#[derive(Debug, Clone)]
pub enum ImageInput {
    /// Interleaved 8-bit pixels: 1 (gray), 3 (RGB) or 4 (RGBA) channels.
    Raw {
        data: Vec<u8>,
        width: u32,
        height: u32,
        channels: u8,
    },
    /// An already decoded image of any color type.
    Image(DynamicImage),
    /// PNG/JPEG/... bytes.
    Encoded(Vec<u8>),
    /// Base64 text of an encoded image, optionally a `data:` URL.
    Base64(String),
}

impl ImageInput {
    /// Convert to the 3-channel RGB buffer the provider expects.
    ///
    /// Grayscale is replicated into all three channels; alpha is dropped.
    pub fn to_rgb(&self) -> Result<RgbImage, ExtractError> {
        match self {
            ImageInput::Raw {
                data,
                width,
                height,
                channels,
            } => raw_to_rgb(data, *width, *height, *channels),
            ImageInput::Image(img) => Ok(img.to_rgb8()),
            ImageInput::Encoded(bytes) => decode_bytes(bytes),
            ImageInput::Base64(text) => {
                let payload = match text.split_once(";base64,") {
                    Some((prefix, rest)) if prefix.starts_with("data:") => rest,
                    _ => text.as_str(),
                };
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(payload.trim())
                    .map_err(|e| ExtractError::Decode(format!("invalid base64: {e}")))?;
                decode_bytes(&bytes)
            }
        }
    }
}

impl From<DynamicImage> for ImageInput {
    fn from(img: DynamicImage) -> Self {
        ImageInput::Image(img)
    }
}

impl From<RgbImage> for ImageInput {
    fn from(img: RgbImage) -> Self {
        ImageInput::Image(DynamicImage::ImageRgb8(img))
    }
}

impl From<GrayImage> for ImageInput {
    fn from(img: GrayImage) -> Self {
        ImageInput::Image(DynamicImage::ImageLuma8(img))
    }
}

fn decode_bytes(bytes: &[u8]) -> Result<RgbImage, ExtractError> {
    if bytes.is_empty() {
        return Err(ExtractError::Decode("empty image buffer".into()));
    }
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

fn raw_to_rgb(data: &[u8], width: u32, height: u32, channels: u8) -> Result<RgbImage, ExtractError> {
    let expected = width as usize * height as usize * channels as usize;
    if width == 0 || height == 0 {
        return Err(ExtractError::Decode(format!("empty image: {width}x{height}")));
    }
    if data.len() != expected {
        return Err(ExtractError::Decode(format!(
            "raw buffer length {} does not match {width}x{height}x{channels} = {expected}",
            data.len()
        )));
    }

    let too_small = || ExtractError::Decode("raw buffer too small".into());
    match channels {
        1 => {
            let gray = GrayImage::from_raw(width, height, data.to_vec()).ok_or_else(too_small)?;
            Ok(DynamicImage::ImageLuma8(gray).to_rgb8())
        }
        3 => RgbImage::from_raw(width, height, data.to_vec()).ok_or_else(too_small),
        4 => {
            let rgba = RgbaImage::from_raw(width, height, data.to_vec()).ok_or_else(too_small)?;
            Ok(DynamicImage::ImageRgba8(rgba).to_rgb8())
        }
        n => Err(ExtractError::Decode(format!("unsupported channel count: {n}"))),
    }
}

/// Which face `extract_single` keeps when the provider reports several.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaceSelection {
    /// Whatever the provider lists first (SCRFD: highest confidence).
    #[default]
    First,
    /// Largest bounding box area.
    Largest,
    /// Highest detection confidence.
    MostConfident,
}

impl FaceSelection {
    /// Index of the chosen face. Ties keep the earlier face.
    pub fn pick(&self, faces: &[DetectedFace]) -> Option<usize> {
        let key = |f: &DetectedFace| match self {
            FaceSelection::First => 0.0,
            FaceSelection::Largest => f.bbox.area(),
            FaceSelection::MostConfident => f.bbox.confidence,
        };

        let mut best: Option<(usize, f32)> = None;
        for (i, face) in faces.iter().enumerate() {
            let k = key(face);
            if best.map_or(true, |(_, b)| k > b) {
                best = Some((i, k));
            }
        }
        best.map(|(i, _)| i)
    }
}

impl fmt::Display for FaceSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FaceSelection::First => "first",
            FaceSelection::Largest => "largest",
            FaceSelection::MostConfident => "most_confident",
        })
    }
}

impl FromStr for FaceSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "first" => Ok(FaceSelection::First),
            "largest" => Ok(FaceSelection::Largest),
            "most_confident" => Ok(FaceSelection::MostConfident),
            other => Err(format!("unknown face selection policy: {other}")),
        }
    }
}

/// Owns an embedding provider and exposes the extraction operations.
pub struct Extractor<P> {
    provider: P,
    selection: FaceSelection,
}

impl<P: EmbeddingProvider> Extractor<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            selection: FaceSelection::default(),
        }
    }

    pub fn with_selection(mut self, selection: FaceSelection) -> Self {
        self.selection = selection;
        self
    }

    pub fn selection(&self) -> FaceSelection {
        self.selection
    }

    pub fn provider_mut(&mut self) -> &mut P {
        &mut self.provider
    }

    /// Every face in the image, in provider order.
    pub fn extract_all(&mut self, image: &ImageInput) -> Result<Vec<DetectedFace>, ExtractError> {
        let rgb = image.to_rgb()?;
        let faces = self.provider.analyze(&rgb)?;
        tracing::debug!(
            width = rgb.width(),
            height = rgb.height(),
            faces = faces.len(),
            "faces extracted"
        );
        Ok(faces)
    }

    /// Embedding of one face chosen by the selection policy, or `None`
    /// when no face was detected.
    pub fn extract_single(&mut self, image: &ImageInput) -> Result<Option<Embedding>, ExtractError> {
        let mut faces = self.extract_all(image)?;
        Ok(self
            .selection
            .pick(&faces)
            .map(|idx| faces.swap_remove(idx).embedding))
    }

    /// `extract_single` over each image in order, skipping faceless images.
    ///
    /// The result may be shorter than the input. Decode and provider
    /// failures abort the batch.
    pub fn extract_batch(&mut self, images: &[ImageInput]) -> Result<Vec<Embedding>, ExtractError> {
        let mut embeddings = Vec::with_capacity(images.len());
        for (i, image) in images.iter().enumerate() {
            match self.extract_single(image)? {
                Some(embedding) => embeddings.push(embedding),
                None => tracing::debug!(index = i, "no face detected; skipping image"),
            }
        }
        Ok(embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;
    use image::{ImageFormat, Luma, Rgb};
    use std::collections::HashMap;
    use std::io::Cursor;

    /// Returns faces keyed by the red value of the top-left pixel, and
    /// records every image it was handed.
    #[derive(Default)]
    struct ScriptedProvider {
        faces: HashMap<u8, Vec<DetectedFace>>,
        seen: Vec<RgbImage>,
    }

    impl EmbeddingProvider for ScriptedProvider {
        fn analyze(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, ProviderError> {
            self.seen.push(image.clone());
            let marker = image.get_pixel(0, 0)[0];
            Ok(self.faces.get(&marker).cloned().unwrap_or_default())
        }
    }

    struct FailingProvider;

    impl EmbeddingProvider for FailingProvider {
        fn analyze(&mut self, _image: &RgbImage) -> Result<Vec<DetectedFace>, ProviderError> {
            Err(ProviderError::InferenceFailed("session poisoned".into()))
        }
    }

    fn face(w: f32, conf: f32, values: &[f32]) -> DetectedFace {
        DetectedFace {
            bbox: BoundingBox {
                x: 0.0, y: 0.0, width: w, height: w,
                confidence: conf, landmarks: None,
            },
            embedding: Embedding::new(values.to_vec()),
        }
    }

    fn marked(marker: u8) -> ImageInput {
        RgbImage::from_pixel(8, 8, Rgb([marker, 0, 0])).into()
    }

    fn scripted() -> ScriptedProvider {
        let mut p = ScriptedProvider::default();
        p.faces.insert(10, vec![face(20.0, 0.7, &[1.0, 0.0])]);
        p.faces.insert(
            20,
            vec![
                face(20.0, 0.6, &[0.0, 1.0]),
                face(80.0, 0.8, &[0.5, 0.5]),
                face(40.0, 0.9, &[0.3, 0.7]),
            ],
        );
        p
    }

    #[test]
    fn test_extract_single_no_face_is_none() {
        let mut ex = Extractor::new(scripted());
        assert_eq!(ex.extract_single(&marked(99)).unwrap(), None);
    }

    #[test]
    fn test_extract_single_first_face_by_default() {
        let mut ex = Extractor::new(scripted());
        let e = ex.extract_single(&marked(20)).unwrap().unwrap();
        assert_eq!(e.values, vec![0.0, 1.0]);
    }

    #[test]
    fn test_extract_single_largest_policy() {
        let mut ex = Extractor::new(scripted()).with_selection(FaceSelection::Largest);
        let e = ex.extract_single(&marked(20)).unwrap().unwrap();
        assert_eq!(e.values, vec![0.5, 0.5]);
    }

    #[test]
    fn test_extract_single_most_confident_policy() {
        let mut ex = Extractor::new(scripted()).with_selection(FaceSelection::MostConfident);
        let e = ex.extract_single(&marked(20)).unwrap().unwrap();
        assert_eq!(e.values, vec![0.3, 0.7]);
    }

    #[test]
    fn test_extract_all_preserves_order() {
        let mut ex = Extractor::new(scripted());
        let faces = ex.extract_all(&marked(20)).unwrap();
        let confs: Vec<f32> = faces.iter().map(|f| f.bbox.confidence).collect();
        assert_eq!(confs, vec![0.6, 0.8, 0.9]);
    }

    #[test]
    fn test_extract_batch_skips_faceless_images() {
        let mut ex = Extractor::new(scripted());
        let batch = vec![marked(10), marked(99), marked(20)];
        let out = ex.extract_batch(&batch).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].values, vec![1.0, 0.0]);
        assert_eq!(out[1].values, vec![0.0, 1.0]);
    }

    #[test]
    fn test_extract_batch_decode_failure_aborts() {
        let mut ex = Extractor::new(scripted());
        let batch = vec![marked(10), ImageInput::Encoded(b"not an image".to_vec())];
        assert!(matches!(ex.extract_batch(&batch), Err(ExtractError::Decode(_))));
    }

    #[test]
    fn test_provider_failure_is_surfaced() {
        let mut ex = Extractor::new(FailingProvider);
        assert!(matches!(
            ex.extract_single(&marked(10)),
            Err(ExtractError::Provider(ProviderError::InferenceFailed(_)))
        ));
    }

    #[test]
    fn test_grayscale_is_expanded_to_rgb() {
        let mut ex = Extractor::new(scripted());
        let gray: ImageInput = GrayImage::from_pixel(4, 3, Luma([10])).into();
        let e = ex.extract_single(&gray).unwrap();
        assert!(e.is_some());

        let seen = &ex.provider_mut().seen[0];
        assert_eq!(seen.dimensions(), (4, 3));
        assert!(seen.pixels().all(|p| p.0 == [10, 10, 10]));
    }

    #[test]
    fn test_raw_channel_layouts() {
        let gray = ImageInput::Raw { data: vec![7; 6], width: 3, height: 2, channels: 1 };
        assert!(gray.to_rgb().unwrap().pixels().all(|p| p.0 == [7, 7, 7]));

        let rgba = ImageInput::Raw {
            data: [1, 2, 3, 255].repeat(4),
            width: 2,
            height: 2,
            channels: 4,
        };
        assert!(rgba.to_rgb().unwrap().pixels().all(|p| p.0 == [1, 2, 3]));
    }

    #[test]
    fn test_raw_length_mismatch_is_decode_error() {
        let bad = ImageInput::Raw { data: vec![0; 10], width: 2, height: 2, channels: 3 };
        assert!(matches!(bad.to_rgb(), Err(ExtractError::Decode(_))));

        let bad_channels = ImageInput::Raw { data: vec![0; 8], width: 2, height: 2, channels: 2 };
        assert!(matches!(bad_channels.to_rgb(), Err(ExtractError::Decode(_))));
    }

    fn png_bytes(marker: u8) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(6, 6, Rgb([marker, 0, 0])));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_encoded_and_base64_inputs() {
        let bytes = png_bytes(10);
        let b64 = base64::engine::general_purpose::STANDARD.encode(&bytes);

        let mut ex = Extractor::new(scripted());
        assert!(ex.extract_single(&ImageInput::Encoded(bytes)).unwrap().is_some());
        assert!(ex.extract_single(&ImageInput::Base64(b64.clone())).unwrap().is_some());
        let data_url = format!("data:image/png;base64,{b64}");
        assert!(ex.extract_single(&ImageInput::Base64(data_url)).unwrap().is_some());
    }

    #[test]
    fn test_invalid_base64_is_decode_error() {
        let input = ImageInput::Base64("!!!not base64!!!".into());
        assert!(matches!(input.to_rgb(), Err(ExtractError::Decode(_))));
    }

    #[test]
    fn test_face_selection_parse() {
        assert_eq!("largest".parse::<FaceSelection>().unwrap(), FaceSelection::Largest);
        assert_eq!("most-confident".parse::<FaceSelection>().unwrap(), FaceSelection::MostConfident);
        assert!("biggest".parse::<FaceSelection>().is_err());
        assert_eq!(FaceSelection::Largest.pick(&[]), None);
    }
}
