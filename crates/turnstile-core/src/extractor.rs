//! Face embedding extraction.
//!
//! [`EmbeddingExtractor`] turns an image on disk into a fixed-length vector.
//! [`OnnxExtractor`] runs a FaceNet (InceptionResnetV1, VGGFace2) export via
//! ONNX Runtime: the whole photo is resized to 160x160 RGB, standardised and
//! embedded into 512 dimensions.

use crate::types::Embedding;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const FACENET_INPUT_SIZE: usize = 160;
const FACENET_MEAN: f32 = 127.5;
const FACENET_STD: f32 = 128.0;
const FACENET_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("model file not found: {0}; export InceptionResnetV1 (vggface2) to ONNX and set TURNSTILE_MODEL_PATH")]
    ModelNotFound(String),
    #[error("image {path}: {source}")]
    Image {
        path: String,
        #[source]
        source: image::ImageError,
    },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("extraction timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("extractor worker exited")]
    WorkerGone,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Opaque image → embedding capability.
pub trait EmbeddingExtractor {
    fn extract(&mut self, image_path: &Path) -> Result<Embedding, ExtractError>;
}

impl<E: EmbeddingExtractor + ?Sized> EmbeddingExtractor for Box<E> {
    fn extract(&mut self, image_path: &Path) -> Result<Embedding, ExtractError> {
        (**self).extract(image_path)
    }
}

/// FaceNet embedding extractor on ONNX Runtime.
pub struct OnnxExtractor {
    session: Session,
}

impl OnnxExtractor {
    /// Load the FaceNet ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, ExtractError> {
        if !model_path.exists() {
            return Err(ExtractError::ModelNotFound(
                model_path.display().to_string(),
            ));
        }

        let session = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded FaceNet model"
        );

        Ok(Self { session })
    }

    /// Convert a 160x160 RGB image into a standardised NCHW float tensor.
    fn preprocess(img: &RgbImage) -> Array4<f32> {
        let size = FACENET_INPUT_SIZE;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for (x, y, pixel) in img.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            if x >= size || y >= size {
                continue;
            }
            for c in 0..3 {
                tensor[[0, c, y, x]] = (pixel[c] as f32 - FACENET_MEAN) / FACENET_STD;
            }
        }

        tensor
    }
}

impl EmbeddingExtractor for OnnxExtractor {
    fn extract(&mut self, image_path: &Path) -> Result<Embedding, ExtractError> {
        let img = image::open(image_path)
            .map_err(|source| ExtractError::Image {
                path: image_path.display().to_string(),
                source,
            })?
            .resize_exact(
                FACENET_INPUT_SIZE as u32,
                FACENET_INPUT_SIZE as u32,
                FilterType::Triangle,
            )
            .to_rgb8();

        let input = Self::preprocess(&img);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let raw: Vec<f32> = raw_data.to_vec();

        if raw.len() != FACENET_EMBEDDING_DIM {
            return Err(ExtractError::InferenceFailed(format!(
                "expected {FACENET_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        tracing::debug!(path = %image_path.display(), "embedding extracted");
        Ok(Embedding::new(l2_normalize(raw)))
    }
}

fn l2_normalize(raw: Vec<f32>) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw
    }
}
