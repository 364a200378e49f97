//! rollcall-core: face screening and identity matching for attendance.
//!
//! SCRFD gates each frame down to exactly one aligned face, ArcFace embeds
//! it (both via ONNX Runtime on CPU), a passive scorer checks liveness and
//! a cosine matcher searches the enrolled gallery.

pub mod alignment;
pub mod detector;
pub mod embedder;
pub mod frame;
pub mod liveness;
pub mod matcher;
pub mod pipeline;
pub mod types;

pub use detector::{DetectionError, Detector, FaceGate, FaceLocator, GateConfig, ScrfdLocator};
pub use embedder::{ArcFaceEmbedder, EmbedError, Embedder};
pub use frame::{Frame, FrameError};
pub use liveness::{LivenessScorer, TextureLiveness};
pub use matcher::{CosineMatcher, Gallery, MatchError, Matcher};
pub use pipeline::{Pipeline, PipelineError, Screening, StageTimings};
pub use types::{
    DimensionMismatch, Embedding, FaceCrop, Identity, IdentityRef, LivenessVerdict, MatchDecision,
    MatchResult, SpoofCue,
};
