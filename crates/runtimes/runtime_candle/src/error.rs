use thiserror::Error;

/// Failures of a single `Encoder::encode` call. None are retried.
#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("failed to resize image: {0}")]
    ImageResize(String),

    #[error("failed to convert image to 8-bit RGB planes: {0}")]
    ImageConversion(String),

    #[error("failed to construct model input: {0}")]
    ModelInputConstruction(String),

    #[error("unexpected model output: {0}")]
    UnexpectedModelOutput(String),

    #[error("encoder prediction failed")]
    Prediction(#[source] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum DistributionError {
    #[error("latent parameters need at least {expected} channels, got {actual}")]
    TooFewChannels { expected: usize, actual: usize },

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}
