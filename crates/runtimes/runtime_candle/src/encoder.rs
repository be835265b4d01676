//! Image encoder: bitmap in, latent distribution out

use anyhow::Result;
use candle_core::{Device, Tensor};
use candle_nn::Module;
use image::DynamicImage;
use std::sync::{Mutex, PoisonError};

use crate::distribution::{LatentDistribution, LatentDistributionParams, DEFAULT_LATENT_CHANNELS};
use crate::error::{DistributionError, EncoderError};
use crate::preprocess::{ImagePreprocessor, Normalization};

/// Name and shape of a model input or output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureDescription {
    pub name: String,
    pub shape: Vec<usize>,
}

/// A value produced by a model
#[derive(Debug, Clone)]
pub enum FeatureValue {
    MultiArray(Tensor),
    Scalar(f64),
    Text(String),
}

impl FeatureValue {
    fn kind(&self) -> &'static str {
        match self {
            FeatureValue::MultiArray(_) => "multi-array",
            FeatureValue::Scalar(_) => "scalar",
            FeatureValue::Text(_) => "text",
        }
    }
}

/// An image encoder model that can describe its inputs
pub trait EncoderModel: Send {
    /// Declared inputs, in order. The first one receives the image.
    fn inputs(&self) -> Vec<FeatureDescription>;

    /// Run inference. Outputs are returned in the model's declared order.
    fn predict(&mut self, inputs: Vec<(String, Tensor)>) -> Result<Vec<(String, FeatureValue)>>;
}

/// Adapts any candle module with a fixed input shape to `EncoderModel`.
pub struct ModuleEncoder<M> {
    module: M,
    input: FeatureDescription,
    output_name: String,
    device: Device,
}

impl<M: Module + Send> ModuleEncoder<M> {
    pub fn new(module: M, input_name: &str, input_shape: Vec<usize>, device: Device) -> Self {
        Self {
            module,
            input: FeatureDescription {
                name: input_name.to_string(),
                shape: input_shape,
            },
            output_name: "latent_dist".to_string(),
            device,
        }
    }

    pub fn with_output_name(mut self, name: &str) -> Self {
        self.output_name = name.to_string();
        self
    }
}

impl<M: Module + Send> EncoderModel for ModuleEncoder<M> {
    fn inputs(&self) -> Vec<FeatureDescription> {
        vec![self.input.clone()]
    }

    fn predict(&mut self, inputs: Vec<(String, Tensor)>) -> Result<Vec<(String, FeatureValue)>> {
        let (_, input) = inputs
            .into_iter()
            .find(|(name, _)| *name == self.input.name)
            .ok_or_else(|| anyhow::anyhow!("missing input `{}`", self.input.name))?;

        let output = self.module.forward(&input.to_device(&self.device)?)?;
        Ok(vec![(self.output_name.clone(), FeatureValue::MultiArray(output))])
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EncoderConfig {
    pub normalization: Normalization,
    pub latent_channels: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            normalization: Normalization::IMAGENET,
            latent_channels: DEFAULT_LATENT_CHANNELS,
        }
    }
}

/// Object-safe view of an encoder, as held by the painter session
pub trait LatentEncoder: Send + Sync {
    fn encode(&self, image: &DynamicImage) -> std::result::Result<LatentDistribution, EncoderError>;
}

/// Encodes images into latent space.
///
/// The model sits behind a mutex, so predictions from several threads run
/// one after another, never concurrently. Its input description is read once
/// at construction, so preprocessing never waits on the lock.
pub struct Encoder<M> {
    model: Mutex<M>,
    input: Option<FeatureDescription>,
    preprocessor: ImagePreprocessor,
    latent_channels: usize,
}

impl<M: EncoderModel> Encoder<M> {
    pub fn new(model: M, config: EncoderConfig) -> Self {
        let input = model.inputs().into_iter().next();
        Self {
            model: Mutex::new(model),
            input,
            preprocessor: ImagePreprocessor::new(config.normalization),
            latent_channels: config.latent_channels,
        }
    }

    pub fn preprocessor(&self) -> &ImagePreprocessor {
        &self.preprocessor
    }

    /// Build the named model input for `image` at the model's declared size.
    pub fn prepare(&self, image: &DynamicImage) -> std::result::Result<(String, Tensor), EncoderError> {
        let input = self.input.as_ref().ok_or_else(|| {
            EncoderError::ModelInputConstruction("model declares no inputs".to_string())
        })?;
        let (width, height) = target_size(&input.shape)?;

        let resized = self.preprocessor.resize(image, width, height)?;
        let planes = self
            .preprocessor
            .rgb_planes(&DynamicImage::ImageRgba8(resized))?;
        let tensor = self.preprocessor.normalize(&planes)?;
        Ok((input.name.clone(), tensor))
    }

    pub fn encode(&self, image: &DynamicImage) -> std::result::Result<LatentDistribution, EncoderError> {
        let (input_name, tensor) = self.prepare(image)?;

        tracing::debug!(input = %input_name, dims = ?tensor.dims(), "Running image encoder");
        let outputs = self
            .model
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .predict(vec![(input_name, tensor)])
            .map_err(EncoderError::Prediction)?;

        let (name, value) = outputs.into_iter().next().ok_or_else(|| {
            EncoderError::UnexpectedModelOutput("model produced no outputs".to_string())
        })?;
        let tensor = match value {
            FeatureValue::MultiArray(tensor) => tensor,
            other => {
                return Err(EncoderError::UnexpectedModelOutput(format!(
                    "output `{}` is a {}, expected a multi-array",
                    name,
                    other.kind()
                )))
            }
        };

        let params = LatentDistributionParams::new(tensor, self.latent_channels)
            .map_err(|e| unexpected_output(&name, e))?;
        LatentDistribution::new(&params).map_err(|e| unexpected_output(&name, e))
    }
}

impl<M: EncoderModel> LatentEncoder for Encoder<M> {
    fn encode(&self, image: &DynamicImage) -> std::result::Result<LatentDistribution, EncoderError> {
        Encoder::encode(self, image)
    }
}

fn unexpected_output(name: &str, err: DistributionError) -> EncoderError {
    EncoderError::UnexpectedModelOutput(format!("output `{}`: {}", name, err))
}

/// Read `(width, height)` from a `[1, 3, W, H]` input shape.
fn target_size(shape: &[usize]) -> std::result::Result<(u32, u32), EncoderError> {
    match shape {
        [_, 3, width, height] => {
            let width = u32::try_from(*width).map_err(|_| {
                EncoderError::ModelInputConstruction(format!("input width {} overflows", width))
            })?;
            let height = u32::try_from(*height).map_err(|_| {
                EncoderError::ModelInputConstruction(format!("input height {} overflows", height))
            })?;
            Ok((width, height))
        }
        _ => Err(EncoderError::ModelInputConstruction(format!(
            "unsupported input shape {:?}, expected [1, 3, W, H]",
            shape
        ))),
    }
}
