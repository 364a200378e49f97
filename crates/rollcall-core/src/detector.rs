//! Single-face gate and the SCRFD face locator behind it.
//!
//! [`FaceGate`] turns raw detections into exactly one aligned [`FaceCrop`] or a
//! typed rejection. Raw face finding is delegated to a [`FaceLocator`]; the
//! production locator is SCRFD with 3-stride anchor decoding and NMS, running
//! via ONNX Runtime.

use crate::alignment;
use crate::frame::{self, Frame};
use crate::types::{BoundingBox, FaceCrop};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

const CLAHE_TILES: u32 = 8;
const CLAHE_CLIP_LIMIT: f32 = 0.02;

/// Why a frame was judged unusable before or during localization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QualityIssue {
    TooDark,
    TooBlurry { sharpness: f32 },
    MissingLandmarks,
}

impl std::fmt::Display for QualityIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QualityIssue::TooDark => f.write_str("frame too dark"),
            QualityIssue::TooBlurry { sharpness } => write!(f, "frame too blurred (sharpness {sharpness:.1})"),
            QualityIssue::MissingLandmarks => f.write_str("face landmarks could not be localized"),
        }
    }
}

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("no face found")]
    NoFaceFound,
    #[error("{count} faces found; exactly one is required")]
    MultipleFacesFound { count: usize },
    #[error("low image quality: {0}")]
    LowImageQuality(QualityIssue),
    #[error("model file not found: {0}; download it from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Finds candidate faces in a frame. Implementations return every face above
/// their own confidence floor, sorted by confidence.
pub trait FaceLocator: Send {
    fn locate(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectionError>;
}

/// Produces exactly one aligned face crop from a frame, or a typed rejection.
pub trait Detector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<FaceCrop, DetectionError>;
}

/// Tunables for [`FaceGate`].
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Side length of the canonical square crop.
    pub crop_size: u32,
    /// Fraction of near-black pixels above which a frame is rejected as dark.
    pub dark_threshold_pct: f32,
    /// Minimum Laplacian variance of the frame.
    pub min_sharpness: f32,
    /// Retry localization once on a CLAHE-enhanced copy when nothing is found.
    pub enhance_contrast: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            crop_size: 112,
            dark_threshold_pct: 0.95,
            min_sharpness: 15.0,
            enhance_contrast: true,
        }
    }
}

/// Quality and face-count gate in front of a [`FaceLocator`].
pub struct FaceGate<L> {
    locator: L,
    config: GateConfig,
}

impl<L: FaceLocator> FaceGate<L> {
    pub fn new(locator: L, config: GateConfig) -> Self {
        Self { locator, config }
    }
}

impl<L: FaceLocator> Detector for FaceGate<L> {
    fn detect(&mut self, frame: &Frame) -> Result<FaceCrop, DetectionError> {
        if frame::is_dark_frame(&frame.data, self.config.dark_threshold_pct) {
            tracing::debug!(brightness = frame.avg_brightness(), "frame rejected as too dark");
            return Err(DetectionError::LowImageQuality(QualityIssue::TooDark));
        }

        let sharpness = frame.sharpness();
        if sharpness < self.config.min_sharpness {
            return Err(DetectionError::LowImageQuality(QualityIssue::TooBlurry { sharpness }));
        }

        let mut faces = self.locator.locate(frame)?;

        if faces.is_empty() && self.config.enhance_contrast {
            let mut enhanced = frame.clone();
            frame::clahe_enhance(
                &mut enhanced.data,
                enhanced.width,
                enhanced.height,
                CLAHE_TILES,
                CLAHE_CLIP_LIMIT,
            );
            faces = self.locator.locate(&enhanced)?;
            tracing::debug!(found = faces.len(), "retried localization on contrast-enhanced frame");
        }

        let face = match faces.len() {
            0 => return Err(DetectionError::NoFaceFound),
            1 => faces.swap_remove(0),
            count => return Err(DetectionError::MultipleFacesFound { count }),
        };

        let landmarks = face
            .landmarks
            .ok_or(DetectionError::LowImageQuality(QualityIssue::MissingLandmarks))?;

        let size = self.config.crop_size;
        let pixels = alignment::align_face(frame, &landmarks, size as usize);

        Ok(FaceCrop {
            pixels,
            size,
            bbox: face,
            face_count: 1,
        })
    }
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor indices for one stride: (score_idx, bbox_idx, kps_idx).
type StrideOutputIndices = (usize, usize, usize);

/// SCRFD-based face locator.
pub struct ScrfdLocator {
    session: Session,
    /// Per-stride output indices [(score, bbox, kps)] for strides [8, 16, 32].
    stride_indices: [StrideOutputIndices; 3],
    confidence_threshold: f32,
}

impl ScrfdLocator {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str, confidence_threshold: f32) -> Result<Self, DetectionError> {
        if !Path::new(model_path).exists() {
            return Err(DetectionError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = model_path,
            outputs = ?output_names,
            confidence_threshold,
            "loaded SCRFD model"
        );

        if output_names.len() < 9 {
            return Err(DetectionError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            stride_indices,
            confidence_threshold,
        })
    }
}

impl FaceLocator for ScrfdLocator {
    fn locate(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectionError> {
        let (input, letterbox) = preprocess(frame);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_indices[pos];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectionError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };

            let level = StrideOutputs {
                scores: extract(score_idx, "scores")?,
                bboxes: extract(bbox_idx, "bboxes")?,
                kps: extract(kps_idx, "kps")?,
            };
            candidates.extend(decode_stride(&level, stride, &letterbox, self.confidence_threshold));
        }

        Ok(nms(candidates, SCRFD_NMS_THRESHOLD))
    }
}

/// Letterbox a grayscale frame into the square SCRFD input and normalize it
/// into a NCHW tensor, replicating luma into three channels.
fn preprocess(frame: &Frame) -> (Array4<f32>, Letterbox) {
    let (width, height) = (frame.width as usize, frame.height as usize);
    let size = SCRFD_INPUT_SIZE;

    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
    let new_w = ((width as f32 * scale).round() as usize).clamp(1, size);
    let new_h = ((height as f32 * scale).round() as usize).clamp(1, size);
    let pad_x = (size - new_w) as f32 / 2.0;
    let pad_y = (size - new_h) as f32 / 2.0;

    let resized = frame::resize_bilinear(&frame.data, width, height, new_w, new_h);

    let x_start = pad_x.floor() as usize;
    let y_start = pad_y.floor() as usize;

    // Padding uses the mean, which normalizes to 0.0
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for y in 0..new_h {
        for x in 0..new_w {
            let pixel = resized[y * new_w + x] as f32;
            let normalized = (pixel - SCRFD_MEAN) / SCRFD_STD;
            for c in 0..3 {
                tensor[[0, c, y + y_start, x + x_start]] = normalized;
            }
        }
    }

    (tensor, Letterbox { scale, pad_x, pad_y })
}

/// Map output tensor names to stride slots.
///
/// Named exports ("score_8", "bbox_16", "kps_32", ...) are matched by name;
/// anything else falls back to the standard positional ordering:
///   [0-2] = scores, [3-5] = bboxes, [6-8] = kps (strides 8, 16, 32)
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?, find("kps", stride)?)))
        .collect();

    match named {
        Some(found) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [found[0], found[1], found[2]]
        }
        None => {
            tracing::info!(?names, "SCRFD: output names not recognized, using positional mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Raw tensors for one stride level.
struct StrideOutputs<'a> {
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

/// Decode detections above `threshold` for a single stride level, in frame coordinates.
fn decode_stride(
    outputs: &StrideOutputs<'_>,
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid_w = SCRFD_INPUT_SIZE / stride;
    let grid_h = SCRFD_INPUT_SIZE / stride;
    let num_anchors = grid_h * grid_w * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    let mut detections = Vec::new();

    for idx in 0..num_anchors {
        let score = outputs.scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let Some(off) = outputs.bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_x = (cell % grid_w) as f32 * s;
        let anchor_y = (cell / grid_w) as f32 * s;

        let (x1, y1) = letterbox.to_frame(anchor_x - off[0] * s, anchor_y - off[1] * s);
        let (x2, y2) = letterbox.to_frame(anchor_x + off[2] * s, anchor_y + off[3] * s);

        let landmarks: Option<[(f32, f32); 5]> = outputs.kps.get(idx * 10..idx * 10 + 10).map(|k| {
            std::array::from_fn(|i| letterbox.to_frame(anchor_x + k[i * 2] * s, anchor_y + k[i * 2 + 1] * s))
        });

        detections.push(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks,
        });
    }

    detections
}

/// Non-Maximum Suppression: keep the most confident of each overlapping group.
/// Output is sorted by descending confidence.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<BoundingBox> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

/// Compute Intersection-over-Union between two bounding boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.area() + b.area() - inter;

    if union > 0.0 { inter / union } else { 0.0 }
}
