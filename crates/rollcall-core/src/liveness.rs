//! Passive single-frame liveness scoring.
//!
//! A recaptured face (printed photo, phone or monitor replay) loses skin
//! micro-texture, picks up periodic screen patterns, reflects glare off glossy
//! surfaces and flattens the shading that gives a real face its depth. Each of
//! those is scored in [0, 1] and combined with a weighted geometric mean, so
//! one strongly spoof-like cue is enough to pull the confidence down.
//!
//! # Threat Coverage
//!
//! - **Blocks:** blurry prints, flat prints, screen replays with visible moiré,
//!   glossy photos under direct light.
//! - **Does not block:** high-quality 3D masks, sharp matte prints under
//!   diffuse light. Passive scoring is probabilistic; tune the threshold.

use crate::frame::{self, Frame};
use crate::types::{CueScores, FaceCrop, LivenessVerdict, SpoofCue};

/// Laplacian variance at which the texture cue saturates to 1.0.
const TEXTURE_REFERENCE_VARIANCE: f32 = 120.0;

/// Autocorrelation lags tested for periodic screen patterns (pixels).
const MOIRE_LAGS: std::ops::RangeInclusive<usize> = 2..=8;
/// Rows whose difference signal varies less than this carry no pattern information.
const MOIRE_MIN_ROW_VARIANCE: f32 = 4.0;
const MOIRE_FLOOR: f32 = 0.3;
const MOIRE_SPAN: f32 = 0.4;

/// Pixels at or above this level count as specular highlights.
const GLARE_LEVEL: u8 = 250;
const GLARE_FLOOR: f32 = 0.02;
const GLARE_SPAN: f32 = 0.10;

/// 5th–95th percentile spread (grey levels) below which shading looks flat.
const DEPTH_FLOOR: f32 = 30.0;
const DEPTH_SPAN: f32 = 70.0;

/// Cue scores are floored before the log so a single zero cannot produce -inf.
const CUE_EPSILON: f32 = 1e-3;

/// Scores a frame for presentation attacks.
pub trait LivenessScorer: Send {
    fn assess(&mut self, frame: &Frame, crop: &FaceCrop) -> LivenessVerdict;
}

/// Relative weight of each cue in the combined confidence. Should sum to 1.
#[derive(Debug, Clone, Copy)]
pub struct CueWeights {
    pub texture: f32,
    pub moire: f32,
    pub specular: f32,
    pub depth: f32,
}

impl Default for CueWeights {
    fn default() -> Self {
        Self {
            texture: 0.35,
            moire: 0.25,
            specular: 0.15,
            depth: 0.25,
        }
    }
}

/// Texture / frequency / reflectance liveness scorer.
pub struct TextureLiveness {
    threshold: f32,
    weights: CueWeights,
}

impl TextureLiveness {
    pub fn new(threshold: f32) -> Self {
        Self::with_weights(threshold, CueWeights::default())
    }

    pub fn with_weights(threshold: f32, weights: CueWeights) -> Self {
        Self { threshold, weights }
    }

    fn combine(&self, cues: &CueScores) -> f32 {
        let w = &self.weights;
        let total = w.texture + w.moire + w.specular + w.depth;
        if total <= 0.0 {
            return 0.0;
        }
        let log_sum = w.texture * cues.texture.max(CUE_EPSILON).ln()
            + w.moire * cues.moire.max(CUE_EPSILON).ln()
            + w.specular * cues.specular.max(CUE_EPSILON).ln()
            + w.depth * cues.depth.max(CUE_EPSILON).ln();
        (log_sum / total).exp().clamp(0.0, 1.0)
    }
}

impl LivenessScorer for TextureLiveness {
    fn assess(&mut self, frame: &Frame, crop: &FaceCrop) -> LivenessVerdict {
        let cues = score_cues(frame, crop);
        let confidence = self.combine(&cues);
        let is_live = confidence >= self.threshold;

        let reason = (!is_live).then(|| weakest_cue(&cues));

        tracing::debug!(
            confidence,
            texture = cues.texture,
            moire = cues.moire,
            specular = cues.specular,
            depth = cues.depth,
            is_live,
            "liveness scored"
        );

        LivenessVerdict {
            is_live,
            confidence,
            reason,
            cues,
        }
    }
}

/// Compute every cue. A crop whose buffer does not match its size scores zero.
pub fn score_cues(frame: &Frame, crop: &FaceCrop) -> CueScores {
    let side = crop.size as usize;
    if side < 3 || crop.pixels.len() != side * side {
        return CueScores {
            texture: 0.0,
            moire: 0.0,
            specular: 0.0,
            depth: 0.0,
        };
    }

    let lap_var = frame::laplacian_variance(&crop.pixels, side, side);
    let texture = (lap_var / TEXTURE_REFERENCE_VARIANCE).clamp(0.0, 1.0);

    let periodicity = periodicity(&crop.pixels, side);
    let moire = 1.0 - ((periodicity - MOIRE_FLOOR) / MOIRE_SPAN).clamp(0.0, 1.0);

    let glare = face_glare_fraction(frame, crop);
    let specular = 1.0 - ((glare - GLARE_FLOOR) / GLARE_SPAN).clamp(0.0, 1.0);

    let spread = percentile_spread(&crop.pixels, 0.05, 0.95);
    let depth = ((spread - DEPTH_FLOOR) / DEPTH_SPAN).clamp(0.0, 1.0);

    CueScores {
        texture,
        moire,
        specular,
        depth,
    }
}

/// First cue with the lowest score, in texture → moiré → specular → depth order.
fn weakest_cue(cues: &CueScores) -> SpoofCue {
    let ranked = [
        (SpoofCue::UniformTexture, cues.texture),
        (SpoofCue::MoirePattern, cues.moire),
        (SpoofCue::SpecularGlare, cues.specular),
        (SpoofCue::FlatDepth, cues.depth),
    ];
    let mut weakest = ranked[0];
    for candidate in &ranked[1..] {
        if candidate.1 < weakest.1 {
            weakest = *candidate;
        }
    }
    weakest.0
}

/// Strongest periodic component along rows or columns of a square buffer.
///
/// For every line, takes the mean-removed first differences and records the
/// highest normalized autocorrelation over [`MOIRE_LAGS`]. Returns the larger
/// of the row and column averages.
fn periodicity(pixels: &[u8], side: usize) -> f32 {
    let line_peak = |line: &[f32]| -> Option<f32> {
        let diffs: Vec<f32> = line.windows(2).map(|w| w[1] - w[0]).collect();
        let n = diffs.len();
        if n <= *MOIRE_LAGS.end() {
            return None;
        }
        let mean = diffs.iter().sum::<f32>() / n as f32;
        let centered: Vec<f32> = diffs.iter().map(|d| d - mean).collect();
        let variance = centered.iter().map(|d| d * d).sum::<f32>() / n as f32;
        if variance < MOIRE_MIN_ROW_VARIANCE {
            return None;
        }
        MOIRE_LAGS
            .map(|lag| {
                let cov: f32 = centered.iter().zip(&centered[lag..]).map(|(a, b)| a * b).sum();
                cov / (n - lag) as f32 / variance
            })
            .reduce(f32::max)
    };

    let average = |peaks: Vec<f32>| -> f32 {
        if peaks.is_empty() {
            0.0
        } else {
            peaks.iter().sum::<f32>() / peaks.len() as f32
        }
    };

    let mut line = vec![0.0f32; side];
    let mut row_peaks = Vec::with_capacity(side);
    let mut col_peaks = Vec::with_capacity(side);

    for y in 0..side {
        for (x, v) in line.iter_mut().enumerate() {
            *v = pixels[y * side + x] as f32;
        }
        row_peaks.extend(line_peak(&line));
    }
    for x in 0..side {
        for (y, v) in line.iter_mut().enumerate() {
            *v = pixels[y * side + x] as f32;
        }
        col_peaks.extend(line_peak(&line));
    }

    average(row_peaks).max(average(col_peaks))
}

/// Near-saturated fraction of the raw frame inside the face box.
///
/// The box is clamped to the frame; when nothing of it is left the aligned
/// crop is measured instead. Background highlights never count.
fn face_glare_fraction(frame: &Frame, crop: &FaceCrop) -> f32 {
    let (width, height) = (frame.width as usize, frame.height as usize);
    let b = &crop.bbox;
    let clamp = |v: f32, max: usize| v.max(0.0).min(max as f32) as usize;
    let (x0, x1) = (clamp(b.x, width), clamp(b.x + b.width, width));
    let (y0, y1) = (clamp(b.y, height), clamp(b.y + b.height, height));
    if x1 <= x0 || y1 <= y0 || frame.data.len() < width * height {
        return glare_fraction(&crop.pixels);
    }

    let area = (x1 - x0) * (y1 - y0);
    let bright: usize = (y0..y1)
        .map(|y| {
            frame.data[y * width + x0..y * width + x1]
                .iter()
                .filter(|&&p| p >= GLARE_LEVEL)
                .count()
        })
        .sum();
    bright as f32 / area as f32
}

fn glare_fraction(gray: &[u8]) -> f32 {
    if gray.is_empty() {
        return 0.0;
    }
    gray.iter().filter(|&&p| p >= GLARE_LEVEL).count() as f32 / gray.len() as f32
}

/// Grey-level distance between the `lo` and `hi` quantiles of the histogram.
fn percentile_spread(gray: &[u8], lo: f32, hi: f32) -> f32 {
    if gray.is_empty() {
        return 0.0;
    }
    let mut hist = [0usize; 256];
    for &p in gray {
        hist[p as usize] += 1;
    }

    let quantile = |q: f32| -> usize {
        let target = (q * gray.len() as f32).ceil().max(1.0) as usize;
        let mut seen = 0usize;
        for (level, &count) in hist.iter().enumerate() {
            seen += count;
            if seen >= target {
                return level;
            }
        }
        255
    };

    quantile(hi).saturating_sub(quantile(lo)) as f32
}
