//! Face embedding extraction.
//!
//! [`ArcFaceEmbedder`] runs an ArcFace ONNX model over the aligned crop and
//! returns an L2-normalized vector. Other models plug in through [`Embedder`].

use crate::frame;
use crate::types::{l2_normalize, Embedding, FaceCrop};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (different from SCRFD!) ---
const ARCFACE_INPUT_SIZE: usize = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric: (x - 127.5) / 127.5

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("model file not found: {0}; download it from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("embedding failure: {0}")]
    Failed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Maps an aligned face crop to a unit-length embedding.
pub trait Embedder: Send {
    fn embed(&mut self, crop: &FaceCrop) -> Result<Embedding, EmbedError>;

    /// Dimensionality of every embedding this embedder produces.
    fn dim(&self) -> usize;
}

/// ArcFace-based embedder.
pub struct ArcFaceEmbedder {
    session: Session,
    dim: usize,
    model_version: String,
}

impl ArcFaceEmbedder {
    /// Load an ArcFace ONNX model that must emit `dim`-dimensional vectors.
    pub fn load(model_path: &str, dim: usize) -> Result<Self, EmbedError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let model_version = Path::new(model_path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "arcface".to_string());

        tracing::info!(
            path = model_path,
            dim,
            version = %model_version,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self {
            session,
            dim,
            model_version,
        })
    }
}

impl Embedder for ArcFaceEmbedder {
    fn embed(&mut self, crop: &FaceCrop) -> Result<Embedding, EmbedError> {
        let input = preprocess(crop)?;

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedError::Failed(format!("embedding extraction: {e}")))?;

        let mut values = raw.to_vec();
        finalize(&mut values, self.dim)?;

        Ok(Embedding {
            values,
            model_version: Some(self.model_version.clone()),
        })
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

/// Validate a raw model output and L2-normalize it in place.
///
/// The dimension must match exactly; the output is never padded or truncated.
pub fn finalize(values: &mut [f32], dim: usize) -> Result<(), EmbedError> {
    if values.len() != dim {
        return Err(EmbedError::Failed(format!(
            "expected {dim}-dim embedding, got {}",
            values.len()
        )));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(EmbedError::Failed("non-finite embedding component".into()));
    }
    if values.iter().all(|&v| v == 0.0) {
        return Err(EmbedError::Failed("zero embedding".into()));
    }
    l2_normalize(values);
    Ok(())
}

/// Resize the crop to the ArcFace input and normalize it into a NCHW tensor.
fn preprocess(crop: &FaceCrop) -> Result<Array4<f32>, EmbedError> {
    let side = crop.size as usize;
    if side == 0 || crop.pixels.len() != side * side {
        return Err(EmbedError::Failed(format!(
            "corrupt crop: {} bytes for a {side}x{side} crop",
            crop.pixels.len()
        )));
    }

    let size = ARCFACE_INPUT_SIZE;
    let resized;
    let pixels = if side == size {
        &crop.pixels
    } else {
        resized = frame::resize_bilinear(&crop.pixels, side, side, size, size);
        &resized
    };

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for y in 0..size {
        for x in 0..size {
            let normalized = (pixels[y * size + x] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            // Grayscale → 3-channel: replicate Y → [R=Y, G=Y, B=Y]
            tensor[[0, 0, y, x]] = normalized;
            tensor[[0, 1, y, x]] = normalized;
            tensor[[0, 2, y, x]] = normalized;
        }
    }

    Ok(tensor)
}
