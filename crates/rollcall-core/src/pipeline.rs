//! Per-capture screening: detect, then embed and score liveness in parallel.
//!
//! Matching is not part of the pipeline. The pipeline owns the models and
//! runs on the engine thread; matching runs against a store snapshot.

use crate::detector::{DetectionError, Detector};
use crate::embedder::{EmbedError, Embedder};
use crate::frame::Frame;
use crate::liveness::LivenessScorer;
use crate::types::{BoundingBox, Embedding, LivenessVerdict};
use serde::Serialize;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Detection(#[from] DetectionError),
    #[error(transparent)]
    Embedding(#[from] EmbedError),
    #[error("liveness check failed: confidence {:.3}", .0.confidence)]
    LivenessFailed(LivenessVerdict),
}

/// Wall-clock time spent in each stage, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StageTimings {
    pub detect_ms: f64,
    pub embed_ms: f64,
    pub liveness_ms: f64,
}

/// A live, embedded face ready for matching.
#[derive(Debug, Clone)]
pub struct ScreenedFace {
    pub embedding: Embedding,
    pub bbox: BoundingBox,
}

/// Everything known about one capture after screening, success or not.
#[derive(Debug)]
pub struct Screening {
    pub timings: StageTimings,
    /// Present whenever detection succeeded.
    pub liveness: Option<LivenessVerdict>,
    pub result: Result<ScreenedFace, PipelineError>,
}

pub struct Pipeline {
    detector: Box<dyn Detector>,
    embedder: Box<dyn Embedder>,
    liveness: Box<dyn LivenessScorer>,
}

impl Pipeline {
    pub fn new(
        detector: Box<dyn Detector>,
        embedder: Box<dyn Embedder>,
        liveness: Box<dyn LivenessScorer>,
    ) -> Self {
        Self {
            detector,
            embedder,
            liveness,
        }
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedder.dim()
    }

    /// Detect and embed a registration capture. Liveness is not scored.
    pub fn enroll(&mut self, frame: &Frame) -> Result<Embedding, PipelineError> {
        let crop = self.detector.detect(frame)?;
        let embedding = self.embedder.embed(&crop)?;
        tracing::debug!(dim = embedding.dim(), "enrollment embedding extracted");
        Ok(embedding)
    }

    /// Screen a verification capture.
    ///
    /// A failed liveness verdict wins over an embedding failure for the same
    /// crop.
    pub fn screen(&mut self, frame: &Frame) -> Screening {
        let mut timings = StageTimings::default();

        let started = Instant::now();
        let detected = self.detector.detect(frame);
        timings.detect_ms = elapsed_ms(started);

        let crop = match detected {
            Ok(crop) => crop,
            Err(e) => {
                tracing::debug!(error = %e, "detection rejected frame");
                return Screening {
                    timings,
                    liveness: None,
                    result: Err(e.into()),
                };
            }
        };

        let embedder = &mut self.embedder;
        let liveness = &mut self.liveness;
        let ((embedded, embed_ms), (verdict, liveness_ms)) = std::thread::scope(|s| {
            let worker = s.spawn(|| {
                let started = Instant::now();
                let embedded = embedder.embed(&crop);
                (embedded, elapsed_ms(started))
            });

            let started = Instant::now();
            let verdict = liveness.assess(frame, &crop);
            let liveness_ms = elapsed_ms(started);

            let embedded = worker
                .join()
                .unwrap_or_else(|_| (Err(EmbedError::Failed("embedder panicked".into())), 0.0));
            (embedded, (verdict, liveness_ms))
        });
        timings.embed_ms = embed_ms;
        timings.liveness_ms = liveness_ms;

        let result = if !verdict.is_live {
            Err(PipelineError::LivenessFailed(verdict.clone()))
        } else {
            embedded
                .map(|embedding| ScreenedFace {
                    embedding,
                    bbox: crop.bbox.clone(),
                })
                .map_err(PipelineError::from)
        };

        Screening {
            timings,
            liveness: Some(verdict),
            result,
        }
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CueScores, FaceCrop, SpoofCue};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn bbox() -> BoundingBox {
        BoundingBox {
            x: 10.0, y: 10.0, width: 50.0, height: 50.0,
            confidence: 0.9, landmarks: None,
        }
    }

    struct FixedDetector(Option<usize>);

    impl Detector for FixedDetector {
        fn detect(&mut self, _frame: &Frame) -> Result<FaceCrop, DetectionError> {
            match self.0 {
                Some(1) => Ok(FaceCrop {
                    pixels: vec![128; 4],
                    size: 2,
                    bbox: bbox(),
                    face_count: 1,
                }),
                Some(0) | None => Err(DetectionError::NoFaceFound),
                Some(count) => Err(DetectionError::MultipleFacesFound { count }),
            }
        }
    }

    struct CountingEmbedder {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Embedder for CountingEmbedder {
        fn embed(&mut self, _crop: &FaceCrop) -> Result<Embedding, EmbedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(EmbedError::Failed("boom".into()))
            } else {
                Ok(Embedding::new(vec![1.0, 0.0]))
            }
        }

        fn dim(&self) -> usize {
            2
        }
    }

    struct FixedLiveness(bool);

    impl LivenessScorer for FixedLiveness {
        fn assess(&mut self, _frame: &Frame, _crop: &FaceCrop) -> LivenessVerdict {
            let score = if self.0 { 0.9 } else { 0.1 };
            LivenessVerdict {
                is_live: self.0,
                confidence: score,
                reason: (!self.0).then_some(SpoofCue::MoirePattern),
                cues: CueScores { texture: score, moire: score, specular: score, depth: score },
            }
        }
    }

    fn pipeline(faces: usize, embed_fails: bool, live: bool) -> (Pipeline, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let pipeline = Pipeline::new(
            Box::new(FixedDetector(Some(faces))),
            Box::new(CountingEmbedder { calls: calls.clone(), fail: embed_fails }),
            Box::new(FixedLiveness(live)),
        );
        (pipeline, calls)
    }

    fn frame() -> Frame {
        Frame::new(vec![100; 16], 4, 4).unwrap()
    }

    #[test]
    fn test_screen_live_single_face() {
        let (mut p, calls) = pipeline(1, false, true);
        let screening = p.screen(&frame());
        let face = screening.result.unwrap();
        assert_eq!(face.embedding.values, vec![1.0, 0.0]);
        assert!(screening.liveness.unwrap().is_live);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_multiple_faces_never_embed() {
        let (mut p, calls) = pipeline(2, false, true);
        let screening = p.screen(&frame());
        assert!(matches!(
            screening.result,
            Err(PipelineError::Detection(DetectionError::MultipleFacesFound { count: 2 }))
        ));
        assert!(screening.liveness.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_spoof_is_rejected_with_verdict() {
        let (mut p, _) = pipeline(1, false, false);
        let screening = p.screen(&frame());
        match screening.result {
            Err(PipelineError::LivenessFailed(v)) => {
                assert_eq!(v.reason, Some(SpoofCue::MoirePattern));
            }
            other => panic!("expected liveness failure, got {other:?}"),
        }
    }

    #[test]
    fn test_liveness_failure_wins_over_embed_failure() {
        let (mut p, _) = pipeline(1, true, false);
        let screening = p.screen(&frame());
        assert!(matches!(screening.result, Err(PipelineError::LivenessFailed(_))));
    }

    #[test]
    fn test_embed_failure_on_live_face() {
        let (mut p, _) = pipeline(1, true, true);
        let screening = p.screen(&frame());
        assert!(matches!(screening.result, Err(PipelineError::Embedding(_))));
        assert!(screening.liveness.is_some());
    }

    #[test]
    fn test_enroll_skips_liveness() {
        let (mut p, calls) = pipeline(1, false, false);
        let embedding = p.enroll(&frame()).unwrap();
        assert_eq!(embedding.dim(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(p.embedding_dim(), 2);
    }

    #[test]
    fn test_enroll_propagates_no_face() {
        let (mut p, _) = pipeline(0, false, true);
        assert!(matches!(
            p.enroll(&frame()),
            Err(PipelineError::Detection(DetectionError::NoFaceFound))
        ));
    }
}
