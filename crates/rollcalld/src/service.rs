//! Attendance service: registration, verification and administration.
//!
//! Every verification that reaches a terminal outcome is written to the
//! attendance log with one insert, including rejections before matching.

use crate::attendance::{
    AttendanceLog, AttendanceRecord, IdentityPresence, LogQuery, LogStats, NewRecord, Outcome,
    Period, PresenceSummary,
};
use crate::db::{now_rfc3339, StoreError};
use crate::engine::{EngineError, EngineHandle};
use crate::store::{IdentityStore, IdentitySummary};
use rollcall_core::types::BoundingBox;
use rollcall_core::{
    DetectionError, Frame, FrameError, Identity, IdentityRef, LivenessVerdict, MatchDecision,
    MatchError, MatchResult, Matcher, PipelineError, StageTimings,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid frame: {0}")]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error("verification task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("batch of {requested} exceeds the limit of {limit}")]
    BatchTooLarge { requested: usize, limit: usize },
}

/// Largest synthetic batch accepted in one request unless configured otherwise.
pub const DEFAULT_SYNTHETIC_LIMIT: usize = 10_000;

/// Per-stage latency of one verification, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyBreakdown {
    pub detect_ms: f64,
    pub embed_ms: f64,
    pub liveness_ms: f64,
    pub match_ms: f64,
    pub total_ms: f64,
}

/// Reply to a verification request.
#[derive(Debug, Clone, Serialize)]
pub struct Verification {
    pub request_id: String,
    pub record_id: i64,
    pub outcome: Outcome,
    /// Matched identity, set only when accepted.
    pub identity: Option<IdentityRef>,
    pub decision: Option<MatchDecision>,
    pub similarity: Option<f32>,
    pub runner_up: Option<f32>,
    pub liveness: Option<LivenessVerdict>,
    /// Where the face was found in the frame, once it passed screening.
    pub face: Option<BoundingBox>,
    /// Why the attempt was rejected before matching.
    pub error: Option<String>,
    pub latency: LatencyBreakdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub id: String,
    pub display_name: String,
    pub samples: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub version: &'static str,
    pub identities: usize,
    pub synthetic: usize,
    pub embeddings: usize,
    pub embedding_dim: usize,
    pub similarity_threshold: f32,
}

/// What is known about an attempt by the time it is logged.
struct Attempt {
    request_id: Uuid,
    started: Instant,
    outcome: Outcome,
    matched: Option<MatchResult>,
    liveness: Option<LivenessVerdict>,
    face: Option<BoundingBox>,
    timings: StageTimings,
    match_ms: f64,
    error: Option<String>,
}

impl Attempt {
    fn new(started: Instant) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            started,
            outcome: Outcome::LowQuality,
            matched: None,
            liveness: None,
            face: None,
            timings: StageTimings::default(),
            match_ms: 0.0,
            error: None,
        }
    }
}

pub struct AttendanceService {
    engine: EngineHandle,
    store: IdentityStore,
    log: AttendanceLog,
    matcher: Box<dyn Matcher>,
    similarity_threshold: f32,
    synthetic_limit: usize,
}

impl AttendanceService {
    pub fn new(
        engine: EngineHandle,
        store: IdentityStore,
        log: AttendanceLog,
        matcher: Box<dyn Matcher>,
        similarity_threshold: f32,
    ) -> Self {
        Self {
            engine,
            store,
            log,
            matcher,
            similarity_threshold,
            synthetic_limit: DEFAULT_SYNTHETIC_LIMIT,
        }
    }

    /// Cap the number of synthetic identities one request may generate.
    pub fn with_synthetic_limit(mut self, limit: usize) -> Self {
        self.synthetic_limit = limit;
        self
    }

    /// Enroll a new identity (or replace an existing one) from an encoded image.
    pub async fn register(
        &self,
        id: &str,
        display_name: &str,
        image: &[u8],
    ) -> Result<Registration, ServiceError> {
        self.register_frame(id, display_name, Frame::decode(image)?).await
    }

    pub async fn register_frame(
        &self,
        id: &str,
        display_name: &str,
        frame: Frame,
    ) -> Result<Registration, ServiceError> {
        let embedding = self.engine.enroll(frame).await?;
        let mut identity = Identity::new(id, display_name, embedding);
        identity.enrolled_at = now_rfc3339();
        self.store.insert(identity).await?;

        Ok(Registration {
            id: id.to_string(),
            display_name: display_name.to_string(),
            samples: 1,
        })
    }

    /// Add an enrollment sample to an existing identity from an encoded image.
    pub async fn add_sample(&self, id: &str, image: &[u8]) -> Result<usize, ServiceError> {
        self.add_sample_frame(id, Frame::decode(image)?).await
    }

    pub async fn add_sample_frame(&self, id: &str, frame: Frame) -> Result<usize, ServiceError> {
        if !self.store.snapshot().contains(id) {
            return Err(StoreError::NotFound(id.to_string()).into());
        }
        let embedding = self.engine.enroll(frame).await?;
        Ok(self.store.add_sample(id, embedding).await?)
    }

    /// Verify an encoded image. Undecodable input is logged as `low_quality`.
    pub async fn verify_encoded(&self, image: &[u8]) -> Result<Verification, ServiceError> {
        let attempt = Attempt::new(Instant::now());
        match Frame::decode(image) {
            Ok(frame) => self.verify_attempt(frame, attempt).await,
            Err(e) => {
                tracing::debug!(error = %e, "undecodable verification frame");
                self.finish(Attempt {
                    outcome: Outcome::LowQuality,
                    error: Some(e.to_string()),
                    ..attempt
                })
                .await
            }
        }
    }

    pub async fn verify_frame(&self, frame: Frame) -> Result<Verification, ServiceError> {
        self.verify_attempt(frame, Attempt::new(Instant::now())).await
    }

    /// Verify on a task of its own so the attempt completes and is logged even
    /// if the caller stops waiting.
    pub async fn verify_detached(self: Arc<Self>, image: Vec<u8>) -> Result<Verification, ServiceError> {
        tokio::spawn(async move { self.verify_encoded(&image).await }).await?
    }

    async fn verify_attempt(
        &self,
        frame: Frame,
        mut attempt: Attempt,
    ) -> Result<Verification, ServiceError> {
        let screening = match self.engine.screen(frame).await {
            Ok(screening) => screening,
            Err(e) => {
                attempt.outcome = Outcome::DetectorFailed;
                attempt.error = Some(e.to_string());
                self.finish(attempt).await?;
                return Err(e.into());
            }
        };

        attempt.timings = screening.timings;
        attempt.liveness = screening.liveness;

        let face = match screening.result {
            Ok(face) => face,
            Err(e) => {
                attempt.outcome = outcome_for(&e);
                attempt.error = Some(e.to_string());
                return self.finish(attempt).await;
            }
        };

        attempt.face = Some(face.bbox);
        let gallery = self.store.snapshot();
        let started = Instant::now();
        let compared = self
            .matcher
            .compare(&face.embedding, &gallery, self.similarity_threshold);
        attempt.match_ms = started.elapsed().as_secs_f64() * 1000.0;

        match compared {
            Ok(result) => {
                attempt.outcome = match result.decision {
                    MatchDecision::Accept => Outcome::Accepted,
                    MatchDecision::NoMatch => Outcome::NoMatch,
                    MatchDecision::AmbiguousMatch => Outcome::Ambiguous,
                };
                attempt.matched = Some(result);
                self.finish(attempt).await
            }
            Err(e) => {
                tracing::error!(error = %e, "query embedding does not fit the gallery");
                attempt.outcome = Outcome::EmbeddingFailed;
                attempt.error = Some(e.to_string());
                self.finish(attempt).await?;
                Err(e.into())
            }
        }
    }

    /// Write the attempt to the log and build the reply.
    async fn finish(&self, attempt: Attempt) -> Result<Verification, ServiceError> {
        let latency = LatencyBreakdown {
            detect_ms: attempt.timings.detect_ms,
            embed_ms: attempt.timings.embed_ms,
            liveness_ms: attempt.timings.liveness_ms,
            match_ms: attempt.match_ms,
            total_ms: attempt.started.elapsed().as_secs_f64() * 1000.0,
        };

        let identity = attempt
            .matched
            .as_ref()
            .filter(|m| m.matched())
            .and_then(|m| m.identity.clone());
        let similarity = attempt.matched.as_ref().map(|m| m.similarity);

        let record_id = self
            .log
            .record(NewRecord {
                request_id: attempt.request_id,
                outcome: attempt.outcome,
                identity: identity.clone(),
                similarity,
                liveness_score: attempt.liveness.as_ref().map(|l| l.confidence),
                liveness_reason: attempt.liveness.as_ref().and_then(|l| l.reason),
                latency_ms: latency.total_ms,
            })
            .await?;

        tracing::info!(
            request_id = %attempt.request_id,
            outcome = %attempt.outcome,
            identity = identity.as_ref().map(|i| i.id.as_str()),
            similarity,
            liveness = attempt.liveness.as_ref().map(|l| l.confidence),
            total_ms = latency.total_ms,
            "verification recorded"
        );

        Ok(Verification {
            request_id: attempt.request_id.to_string(),
            record_id,
            outcome: attempt.outcome,
            identity,
            decision: attempt.matched.as_ref().map(|m| m.decision),
            similarity,
            runner_up: attempt.matched.as_ref().and_then(|m| m.runner_up),
            liveness: attempt.liveness,
            face: attempt.face,
            error: attempt.error,
            latency,
        })
    }

    pub async fn list(&self, include_synthetic: bool) -> Result<Vec<IdentitySummary>, ServiceError> {
        Ok(self.store.list(include_synthetic).await?)
    }

    pub async fn remove(&self, id: &str) -> Result<bool, ServiceError> {
        Ok(self.store.delete(id).await?)
    }

    pub async fn logs(&self, query: LogQuery) -> Result<Vec<AttendanceRecord>, ServiceError> {
        Ok(self.log.query(query).await?)
    }

    pub async fn export(&self, query: LogQuery) -> Result<String, ServiceError> {
        Ok(self.log.export_csv(query).await?)
    }

    pub async fn stats(&self, query: LogQuery) -> Result<LogStats, ServiceError> {
        Ok(self.log.stats(query).await?)
    }

    pub async fn presence(&self, id: &str, period: Period) -> Result<IdentityPresence, ServiceError> {
        Ok(self.log.presence(id, period).await?)
    }

    pub async fn summary(&self, period: Period) -> Result<PresenceSummary, ServiceError> {
        Ok(self.log.summary(period).await?)
    }

    pub async fn generate_synthetic(&self, count: usize) -> Result<usize, ServiceError> {
        if count > self.synthetic_limit {
            return Err(ServiceError::BatchTooLarge {
                requested: count,
                limit: self.synthetic_limit,
            });
        }
        Ok(self.store.generate_synthetic(count).await?)
    }

    pub async fn clear_synthetic(&self) -> Result<usize, ServiceError> {
        Ok(self.store.clear_synthetic().await?)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Identity>, ServiceError> {
        Ok(self.store.get(id).await?)
    }

    pub fn status(&self) -> Status {
        Status {
            version: env!("CARGO_PKG_VERSION"),
            identities: self.store.count(),
            synthetic: self.store.count_synthetic(),
            embeddings: self.store.snapshot().rows(),
            embedding_dim: self.engine.embedding_dim(),
            similarity_threshold: self.similarity_threshold,
        }
    }
}

/// Log outcome for an attempt rejected before matching.
fn outcome_for(error: &PipelineError) -> Outcome {
    match error {
        PipelineError::Detection(DetectionError::NoFaceFound) => Outcome::NoFace,
        PipelineError::Detection(DetectionError::MultipleFacesFound { .. }) => Outcome::MultiFace,
        PipelineError::Detection(DetectionError::LowImageQuality(_)) => Outcome::LowQuality,
        PipelineError::Detection(_) => Outcome::DetectorFailed,
        PipelineError::Embedding(_) => Outcome::EmbeddingFailed,
        PipelineError::LivenessFailed(_) => Outcome::LivenessFailed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::engine::spawn_engine;
    use rollcall_core::liveness::LivenessScorer;
    use rollcall_core::types::CueScores;
    use rollcall_core::{
        CosineMatcher, Detector, EmbedError, Embedder, Embedding, FaceCrop, Gallery, Pipeline,
        SpoofCue,
    };
    use rollcall_core::types::BoundingBox;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const DIM: usize = 4;

    /// Test frames encode the scene in their first bytes:
    /// `[face_count, capture_index, live, detect_delay_10ms, ...]`.
    fn scene(faces: u8, capture: u8, live: bool) -> Frame {
        let mut data = vec![90u8; 16];
        data[0] = faces;
        data[1] = capture;
        data[2] = live as u8;
        data[3] = 0;
        Frame::new(data, 4, 4).unwrap()
    }

    fn png(frame: &Frame) -> Vec<u8> {
        let gray = image::GrayImage::from_raw(frame.width, frame.height, frame.data.clone()).unwrap();
        let mut out = std::io::Cursor::new(Vec::new());
        gray.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    struct SceneDetector;

    impl Detector for SceneDetector {
        fn detect(&mut self, frame: &Frame) -> Result<FaceCrop, DetectionError> {
            std::thread::sleep(Duration::from_millis(frame.data[3] as u64 * 10));
            match frame.data[0] {
                0 => Err(DetectionError::NoFaceFound),
                1 => Ok(FaceCrop {
                    pixels: frame.data.clone(),
                    size: 4,
                    bbox: BoundingBox {
                        x: 0.0, y: 0.0, width: 4.0, height: 4.0,
                        confidence: 0.99, landmarks: None,
                    },
                    face_count: 1,
                }),
                n => Err(DetectionError::MultipleFacesFound { count: n as usize }),
            }
        }
    }

    struct TableEmbedder {
        table: Vec<Vec<f32>>,
        calls: Arc<AtomicUsize>,
    }

    impl Embedder for TableEmbedder {
        fn embed(&mut self, crop: &FaceCrop) -> Result<Embedding, EmbedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.table
                .get(crop.pixels[1] as usize)
                .map(|v| Embedding::new(v.clone()).normalized())
                .ok_or_else(|| EmbedError::Failed("unknown capture".into()))
        }

        fn dim(&self) -> usize {
            DIM
        }
    }

    struct SceneLiveness;

    impl LivenessScorer for SceneLiveness {
        fn assess(&mut self, _frame: &Frame, crop: &FaceCrop) -> LivenessVerdict {
            let live = crop.pixels[2] != 0;
            let score = if live { 0.93 } else { 0.12 };
            LivenessVerdict {
                is_live: live,
                confidence: score,
                reason: (!live).then_some(SpoofCue::MoirePattern),
                cues: CueScores { texture: score, moire: score, specular: score, depth: score },
            }
        }
    }

    struct CountingMatcher {
        inner: CosineMatcher,
        calls: Arc<AtomicUsize>,
    }

    impl Matcher for CountingMatcher {
        fn compare(
            &self,
            query: &Embedding,
            gallery: &Gallery,
            threshold: f32,
        ) -> Result<MatchResult, MatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.compare(query, gallery, threshold)
        }
    }

    struct Harness {
        service: Arc<AttendanceService>,
        conn: tokio_rusqlite::Connection,
        embed_calls: Arc<AtomicUsize>,
        match_calls: Arc<AtomicUsize>,
    }

    const CAPTURE_A: u8 = 0;
    const CAPTURE_NEAR_A: u8 = 1;
    const CAPTURE_AXIS: u8 = 2;
    const CAPTURE_WRONG_DIM: u8 = 3;

    async fn harness() -> Harness {
        let embed_calls = Arc::new(AtomicUsize::new(0));
        let match_calls = Arc::new(AtomicUsize::new(0));

        let table = vec![
            vec![1.0, 0.0, 0.0, 0.0],
            vec![0.99, 0.1, 0.0, 0.0],
            vec![1.0, 0.0, 0.0, 0.0],
            vec![1.0, 0.0, 0.0],
        ];
        let pipeline = Pipeline::new(
            Box::new(SceneDetector),
            Box::new(TableEmbedder { table, calls: embed_calls.clone() }),
            Box::new(SceneLiveness),
        );
        let engine = spawn_engine(pipeline).unwrap();

        let conn = db::open_in_memory().await.unwrap();
        let store = IdentityStore::open(conn.clone(), DIM).await.unwrap();
        let log = AttendanceLog::new(conn.clone());
        let matcher = CountingMatcher {
            inner: CosineMatcher::default(),
            calls: match_calls.clone(),
        };

        Harness {
            service: Arc::new(
                AttendanceService::new(engine, store, log, Box::new(matcher), 0.65)
                    .with_synthetic_limit(500),
            ),
            conn,
            embed_calls,
            match_calls,
        }
    }

    async fn enroll(h: &Harness, id: &str, values: Vec<f32>) {
        h.service
            .store
            .insert(Identity::new(id, format!("Student {id}"), Embedding::new(values)))
            .await
            .unwrap();
    }

    async fn only_record(h: &Harness) -> AttendanceRecord {
        let mut records = h.service.logs(LogQuery::default()).await.unwrap();
        assert_eq!(records.len(), 1);
        records.remove(0)
    }

    #[tokio::test]
    async fn test_live_capture_is_accepted() {
        let h = harness().await;
        enroll(&h, "A", vec![1.0, 0.0, 0.0, 0.0]).await;
        enroll(&h, "B", vec![0.0, 1.0, 0.0, 0.0]).await;

        let v = h.service.verify_frame(scene(1, CAPTURE_NEAR_A, true)).await.unwrap();
        assert_eq!(v.outcome, Outcome::Accepted);
        assert_eq!(v.identity.as_ref().map(|i| i.id.as_str()), Some("A"));
        assert!(v.similarity.unwrap() >= 0.99);
        assert!(v.latency.total_ms >= v.latency.match_ms);
        assert_eq!(v.face.as_ref().map(|b| b.width), Some(4.0));

        let record = only_record(&h).await;
        assert_eq!(record.id, v.record_id);
        assert_eq!(record.outcome, "accepted");
        assert_eq!(record.identity_id.as_deref(), Some("A"));
        assert_eq!(record.identity_name.as_deref(), Some("Student A"));
        assert_eq!(record.request_id, v.request_id);
    }

    #[tokio::test]
    async fn test_spoof_is_logged_without_matching() {
        let h = harness().await;
        enroll(&h, "A", vec![1.0, 0.0, 0.0, 0.0]).await;

        let v = h.service.verify_frame(scene(1, CAPTURE_A, false)).await.unwrap();
        assert_eq!(v.outcome, Outcome::LivenessFailed);
        assert!(v.identity.is_none());
        assert!(v.face.is_none());
        assert_eq!(h.match_calls.load(Ordering::SeqCst), 0);

        let record = only_record(&h).await;
        assert_eq!(record.outcome, "liveness_failed");
        assert_eq!(record.identity_id, None);
        assert_eq!(record.similarity, None);
        assert_eq!(record.liveness_reason.as_deref(), Some("moire pattern"));
    }

    #[tokio::test]
    async fn test_two_faces_are_rejected_before_embedding() {
        let h = harness().await;
        enroll(&h, "A", vec![1.0, 0.0, 0.0, 0.0]).await;

        let v = h.service.verify_frame(scene(2, CAPTURE_A, true)).await.unwrap();
        assert_eq!(v.outcome, Outcome::MultiFace);
        assert!(v.liveness.is_none());
        assert_eq!(h.embed_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.match_calls.load(Ordering::SeqCst), 0);
        assert_eq!(only_record(&h).await.outcome, "multi_face");
    }

    #[tokio::test]
    async fn test_equal_candidates_are_ambiguous() {
        let h = harness().await;
        let off = 0.51f32.sqrt();
        enroll(&h, "A", vec![0.7, off, 0.0, 0.0]).await;
        enroll(&h, "B", vec![0.7, 0.0, off, 0.0]).await;

        let v = h.service.verify_frame(scene(1, CAPTURE_AXIS, true)).await.unwrap();
        assert_eq!(v.outcome, Outcome::Ambiguous);
        assert_eq!(v.decision, Some(MatchDecision::AmbiguousMatch));
        assert!(v.identity.is_none());
        assert!((v.similarity.unwrap() - 0.70).abs() < 1e-4);

        let record = only_record(&h).await;
        assert_eq!(record.outcome, "ambiguous");
        assert_eq!(record.identity_id, None);
    }

    #[tokio::test]
    async fn test_no_face_and_unknown_face() {
        let h = harness().await;
        enroll(&h, "B", vec![0.0, 1.0, 0.0, 0.0]).await;

        let v = h.service.verify_frame(scene(0, CAPTURE_A, true)).await.unwrap();
        assert_eq!(v.outcome, Outcome::NoFace);

        let v = h.service.verify_frame(scene(1, CAPTURE_A, true)).await.unwrap();
        assert_eq!(v.outcome, Outcome::NoMatch);
        assert!(v.identity.is_none());

        let stats = h.service.stats(LogQuery::default()).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.accepted, 0);
    }

    #[tokio::test]
    async fn test_embedding_failure_is_logged() {
        let h = harness().await;
        let v = h.service.verify_frame(scene(1, 42, true)).await.unwrap();
        assert_eq!(v.outcome, Outcome::EmbeddingFailed);
        assert!(v.error.is_some());
        assert_eq!(only_record(&h).await.outcome, "embedding_failed");
    }

    #[tokio::test]
    async fn test_wrong_dimension_capture_is_logged_then_fails() {
        let h = harness().await;
        let err = h
            .service
            .verify_frame(scene(1, CAPTURE_WRONG_DIM, true))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Match(_)));
        assert_eq!(only_record(&h).await.outcome, "embedding_failed");
    }

    #[tokio::test]
    async fn test_undecodable_image_is_low_quality() {
        let h = harness().await;
        let v = h.service.clone().verify_detached(b"not an image".to_vec()).await.unwrap();
        assert_eq!(v.outcome, Outcome::LowQuality);
        assert_eq!(only_record(&h).await.outcome, "low_quality");
    }

    #[tokio::test]
    async fn test_register_then_verify() {
        let h = harness().await;
        let reg = h
            .service
            .register_frame("s1", "Ada", scene(1, CAPTURE_A, false))
            .await
            .unwrap();
        assert_eq!(reg.samples, 1);
        assert_eq!(h.service.status().identities, 1);

        let samples = h
            .service
            .add_sample_frame("s1", scene(1, CAPTURE_NEAR_A, true))
            .await
            .unwrap();
        assert_eq!(samples, 2);

        let v = h.service.verify_frame(scene(1, CAPTURE_A, true)).await.unwrap();
        assert_eq!(v.identity.map(|i| i.display_name), Some("Ada".to_string()));

        // registration attempts are not attendance
        assert_eq!(h.service.logs(LogQuery::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_register_rejects_two_faces() {
        let h = harness().await;
        let err = h
            .service
            .register_frame("s1", "Ada", scene(3, CAPTURE_A, true))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Engine(EngineError::Pipeline(PipelineError::Detection(
                DetectionError::MultipleFacesFound { count: 3 }
            )))
        ));
        assert_eq!(h.service.status().identities, 0);
    }

    #[tokio::test]
    async fn test_add_sample_requires_existing_identity() {
        let h = harness().await;
        let err = h
            .service
            .add_sample_frame("ghost", scene(1, CAPTURE_A, true))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Store(StoreError::NotFound(_))));
        assert_eq!(h.embed_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_history_survives_identity_removal() {
        let h = harness().await;
        enroll(&h, "A", vec![1.0, 0.0, 0.0, 0.0]).await;
        h.service.verify_frame(scene(1, CAPTURE_A, true)).await.unwrap();

        assert!(h.service.remove("A").await.unwrap());
        let record = only_record(&h).await;
        assert_eq!(record.identity_id.as_deref(), Some("A"));

        let v = h.service.verify_frame(scene(1, CAPTURE_A, true)).await.unwrap();
        assert_eq!(v.outcome, Outcome::NoMatch);
    }

    #[tokio::test]
    async fn test_synthetic_load_keeps_genuine_matches() {
        let h = harness().await;
        enroll(&h, "A", vec![1.0, 0.0, 0.0, 0.0]).await;
        h.service.generate_synthetic(100).await.unwrap();
        assert_eq!(h.service.status().synthetic, 100);

        let v = h.service.verify_frame(scene(1, CAPTURE_A, true)).await.unwrap();
        assert_eq!(v.outcome, Outcome::Accepted);
        assert_eq!(v.identity.unwrap().id, "A");

        assert_eq!(h.service.clear_synthetic().await.unwrap(), 100);
        let status = h.service.status();
        assert_eq!(status.identities, 1);
        assert_eq!(status.synthetic, 0);
    }

    #[tokio::test]
    async fn test_log_write_failure_is_fatal() {
        let h = harness().await;
        enroll(&h, "A", vec![1.0, 0.0, 0.0, 0.0]).await;
        h.conn
            .call(|c| Ok(c.execute_batch("DROP TABLE attendance_log")?))
            .await
            .unwrap();

        let err = h.service.verify_frame(scene(1, CAPTURE_A, true)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Store(StoreError::Write(_))), "{err:?}");
        assert_eq!(h.match_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.service.status().identities, 1);
    }

    #[tokio::test]
    async fn test_abandoned_verification_is_logged_once() {
        let h = harness().await;
        enroll(&h, "A", vec![1.0, 0.0, 0.0, 0.0]).await;

        let mut slow = scene(1, CAPTURE_A, true);
        slow.data[3] = 20;
        let pending = h.service.clone().verify_detached(png(&slow));
        assert!(tokio::time::timeout(Duration::from_millis(20), pending).await.is_err());
        // nothing is written until the attempt reaches an outcome
        assert!(h.service.logs(LogQuery::default()).await.unwrap().is_empty());

        let mut records = Vec::new();
        for _ in 0..250 {
            records = h.service.logs(LogQuery::default()).await.unwrap();
            if !records.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.service.logs(LogQuery::default()).await.unwrap().len(), 1);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, "accepted");
        assert_eq!(records[0].identity_id.as_deref(), Some("A"));
        assert_eq!(h.match_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_presence_after_check_ins() {
        let h = harness().await;
        enroll(&h, "A", vec![1.0, 0.0, 0.0, 0.0]).await;
        enroll(&h, "B", vec![0.0, 1.0, 0.0, 0.0]).await;
        h.service.verify_frame(scene(1, CAPTURE_A, true)).await.unwrap();
        h.service.verify_frame(scene(1, CAPTURE_NEAR_A, true)).await.unwrap();
        h.service.verify_frame(scene(1, CAPTURE_A, false)).await.unwrap();

        let a = h.service.presence("A", Period::default()).await.unwrap();
        assert!(a.present);
        assert_eq!(a.days_present, 1);
        assert_eq!(a.check_ins, 2);
        assert!(!h.service.presence("B", Period::default()).await.unwrap().present);

        let summary = h.service.summary(Period::default()).await.unwrap();
        assert_eq!(summary.present, 1);
        assert_eq!(summary.check_ins, 2);
    }

    #[tokio::test]
    async fn test_synthetic_batch_over_limit_is_refused() {
        let h = harness().await;
        let err = h.service.generate_synthetic(501).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::BatchTooLarge { requested: 501, limit: 500 }
        ));
        assert_eq!(h.service.status().synthetic, 0);

        assert_eq!(h.service.generate_synthetic(500).await.unwrap(), 500);
        assert_eq!(h.service.status().synthetic, 500);
    }
}
