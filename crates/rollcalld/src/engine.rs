use crate::config::Config;
use rollcall_core::{
    ArcFaceEmbedder, DetectionError, EmbedError, Embedding, FaceGate, Frame, Pipeline,
    PipelineError, Screening, ScrfdLocator, TextureLiveness,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectionError),
    #[error("embedder error: {0}")]
    Embedder(#[from] EmbedError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("cannot spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from request handlers to the engine thread.
enum EngineRequest {
    Enroll {
        frame: Frame,
        reply: oneshot::Sender<Result<Embedding, PipelineError>>,
    },
    Screen {
        frame: Frame,
        reply: oneshot::Sender<Screening>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    embedding_dim: usize,
}

impl EngineHandle {
    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    /// Detect and embed a registration frame.
    pub async fn enroll(&self, frame: Frame) -> Result<Embedding, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll {
                frame,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    /// Run detection, embedding and liveness on a verification frame.
    pub async fn screen(&self, frame: Frame) -> Result<Screening, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Screen {
                frame,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Load the SCRFD gate, the ArcFace embedder and the liveness scorer.
///
/// Fails fast at startup if a model file is missing or unreadable.
pub fn load_pipeline(config: &Config) -> Result<Pipeline, EngineError> {
    let detector_path = config.detector_model_path();
    let locator = ScrfdLocator::load(&detector_path, config.detector_confidence)?;
    tracing::info!(path = %detector_path, "SCRFD detector loaded");

    let embedder_path = config.embedder_model_path();
    let embedder = ArcFaceEmbedder::load(&embedder_path, config.embedding_dim)?;
    tracing::info!(path = %embedder_path, "ArcFace embedder loaded");

    Ok(Pipeline::new(
        Box::new(FaceGate::new(locator, config.gate_config())),
        Box::new(embedder),
        Box::new(TextureLiveness::new(config.liveness_threshold)),
    ))
}

/// Move the pipeline onto a dedicated OS thread and return a handle to it.
pub fn spawn_engine(mut pipeline: Pipeline) -> Result<EngineHandle, EngineError> {
    let embedding_dim = pipeline.embedding_dim();
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Enroll { frame, reply } => {
                        let _ = reply.send(pipeline.enroll(&frame));
                    }
                    EngineRequest::Screen { frame, reply } => {
                        let _ = reply.send(pipeline.screen(&frame));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx, embedding_dim })
}
