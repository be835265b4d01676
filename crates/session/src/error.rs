use hyperpaint_runtime_candle::EncoderError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PaintError {
    /// Checkpoint missing or pipeline construction failed. The session is idle again.
    #[error("resource error: {0}")]
    Resource(String),

    #[error("a generation is already running in this session")]
    Busy,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("generation cancelled")]
    Cancelled,

    #[error("request has a conditioning image but the session has no encoder")]
    MissingEncoder,

    #[error(transparent)]
    Encoder(#[from] EncoderError),

    #[error("progress out of order: expected step {expected}, got step {actual}")]
    ProgressOutOfOrder { expected: usize, actual: usize },

    #[error("pipeline stopped after {completed} of {step_count} steps")]
    IncompleteRun { completed: usize, step_count: usize },

    #[error("pipeline failed")]
    Pipeline(#[source] anyhow::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
