use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("embedding dimension mismatch: expected {expected}, got {actual}")]
pub struct DimensionMismatch {
    pub expected: usize,
    pub actual: usize,
}

/// Face embedding vector (typically 512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn norm(&self) -> f32 {
        self.values.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    /// Return a unit-length copy. Zero vectors are returned unchanged.
    pub fn normalized(mut self) -> Self {
        l2_normalize(&mut self.values);
        self
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    /// Always processes all dimensions.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Random unit vector of the given dimension, used for synthetic load.
    pub fn random_unit<R: Rng + ?Sized>(rng: &mut R, dim: usize) -> Self {
        let values = (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
        Self {
            values,
            model_version: Some(SYNTHETIC_MODEL_VERSION.to_string()),
        }
        .normalized()
    }
}

/// Model version tag carried by randomly generated embeddings.
pub const SYNTHETIC_MODEL_VERSION: &str = "synthetic";

/// Scale `values` to unit L2 norm in place. A zero vector is left untouched.
pub fn l2_normalize(values: &mut [f32]) {
    let norm: f32 = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in values.iter_mut() {
            *v /= norm;
        }
    }
}

/// An aligned, fixed-resolution face region cut from a frame with exactly one face.
#[derive(Debug, Clone)]
pub struct FaceCrop {
    /// Grayscale pixels, `size * size` bytes, row-major.
    pub pixels: Vec<u8>,
    pub size: u32,
    /// Location of the face in the source frame.
    pub bbox: BoundingBox,
    /// Faces found in the source frame. Always 1 for a crop handed downstream.
    pub face_count: usize,
}

/// An enrolled person and their enrollment samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub display_name: String,
    pub embeddings: Vec<Embedding>,
    /// RFC 3339 enrollment timestamp.
    pub enrolled_at: String,
    /// Generated for load testing; purged by the synthetic clear.
    pub synthetic: bool,
}

impl Identity {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, embedding: Embedding) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            embeddings: vec![embedding],
            enrolled_at: String::new(),
            synthetic: false,
        }
    }

    pub fn to_ref(&self) -> IdentityRef {
        IdentityRef {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
        }
    }

    /// Fails on the first embedding whose dimension differs from `dim`.
    pub fn check_dim(&self, dim: usize) -> Result<(), DimensionMismatch> {
        match self.embeddings.iter().find(|e| e.dim() != dim) {
            Some(e) => Err(DimensionMismatch {
                expected: dim,
                actual: e.dim(),
            }),
            None => Ok(()),
        }
    }
}

/// Lightweight reference to an enrolled identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRef {
    pub id: String,
    pub display_name: String,
}

/// The spoof artifact that weighed most against a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpoofCue {
    #[serde(rename = "uniform texture")]
    UniformTexture,
    #[serde(rename = "moire pattern")]
    MoirePattern,
    #[serde(rename = "specular glare")]
    SpecularGlare,
    #[serde(rename = "flat depth")]
    FlatDepth,
}

impl SpoofCue {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpoofCue::UniformTexture => "uniform texture",
            SpoofCue::MoirePattern => "moire pattern",
            SpoofCue::SpecularGlare => "specular glare",
            SpoofCue::FlatDepth => "flat depth",
        }
    }
}

impl std::fmt::Display for SpoofCue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-cue liveness scores in [0, 1], 1 meaning "looks live".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CueScores {
    pub texture: f32,
    pub moire: f32,
    pub specular: f32,
    pub depth: f32,
}

/// Outcome of the passive liveness check for one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessVerdict {
    pub is_live: bool,
    /// Combined confidence in [0, 1].
    pub confidence: f32,
    /// Weakest cue, set only when the verdict fails.
    pub reason: Option<SpoofCue>,
    pub cues: CueScores,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchDecision {
    Accept,
    NoMatch,
    AmbiguousMatch,
}

/// Result of matching a query embedding against a gallery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    pub decision: MatchDecision,
    /// Cosine similarity of the best identity [-1, 1]; 0.0 for an empty gallery.
    pub similarity: f32,
    /// Best identity. Set for `Accept` only.
    pub identity: Option<IdentityRef>,
    /// Score of the second-best identity, when there is one.
    pub runner_up: Option<f32>,
    /// Number of stored embeddings compared.
    pub compared: usize,
}

impl MatchResult {
    pub fn matched(&self) -> bool {
        self.decision == MatchDecision::Accept
    }
}
