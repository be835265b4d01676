//! hyperpaint_runtime_candle - Image to latent encoding on candle
//!
//! This crate turns bitmaps into the normalized planar tensors an image
//! encoder expects, runs the encoder, and wraps its raw mean/log-variance
//! output in a diagonal Gaussian distribution.

mod distribution;
mod encoder;
mod error;
mod preprocess;

pub use distribution::{LatentDistribution, LatentDistributionParams, DEFAULT_LATENT_CHANNELS};
pub use encoder::{
    Encoder, EncoderConfig, EncoderModel, FeatureDescription, FeatureValue, LatentEncoder,
    ModuleEncoder,
};
pub use error::{DistributionError, EncoderError};
pub use preprocess::{ImagePreprocessor, Normalization, RgbPlanes, IMAGENET_MEAN, IMAGENET_STD};
