//! Diagonal Gaussian latent distribution

use candle_core::{Result, Tensor};

use crate::error::DistributionError;

/// Latent channel count of the Stable Diffusion VAE
pub const DEFAULT_LATENT_CHANNELS: usize = 4;

/// Range applied to the log-variance before deriving std/variance
const LOGVAR_MIN: f64 = -30.0;
const LOGVAR_MAX: f64 = 20.0;

/// Raw encoder output: channels `[0, C)` are the mean, `[C, 2C)` the log-variance.
#[derive(Debug, Clone)]
pub struct LatentDistributionParams {
    tensor: Tensor,
    latent_channels: usize,
}

impl LatentDistributionParams {
    pub fn new(
        tensor: Tensor,
        latent_channels: usize,
    ) -> std::result::Result<Self, DistributionError> {
        let actual = tensor.dims().get(1).copied().unwrap_or(0);
        let expected = 2 * latent_channels;
        if latent_channels == 0 || actual < expected {
            return Err(DistributionError::TooFewChannels { expected, actual });
        }
        Ok(Self {
            tensor,
            latent_channels,
        })
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn latent_channels(&self) -> usize {
        self.latent_channels
    }
}

/// Per-element independent normal distribution over the latent space.
///
/// `mode()` is what the encoder hands to the pipeline; `sample()` is the
/// stochastic alternative.
#[derive(Debug, Clone)]
pub struct LatentDistribution {
    mean: Tensor,
    log_variance: Tensor,
}

impl LatentDistribution {
    pub fn new(params: &LatentDistributionParams) -> std::result::Result<Self, DistributionError> {
        let c = params.latent_channels;
        let mean = params.tensor.narrow(1, 0, c)?;
        let log_variance = params.tensor.narrow(1, c, c)?;
        Ok(Self { mean, log_variance })
    }

    pub fn mean(&self) -> &Tensor {
        &self.mean
    }

    /// Log-variance exactly as the encoder produced it (not clamped)
    pub fn log_variance(&self) -> &Tensor {
        &self.log_variance
    }

    /// The distribution's mode, i.e. the mean.
    pub fn mode(&self) -> Tensor {
        self.mean.clone()
    }

    fn clamped_log_variance(&self) -> Result<Tensor> {
        self.log_variance.clamp(LOGVAR_MIN, LOGVAR_MAX)
    }

    pub fn std(&self) -> Result<Tensor> {
        (self.clamped_log_variance()? * 0.5)?.exp()
    }

    pub fn variance(&self) -> Result<Tensor> {
        self.clamped_log_variance()?.exp()
    }

    /// Draw `mean + std * eps` with `eps ~ N(0, 1)`.
    pub fn sample(&self) -> Result<Tensor> {
        let noise = Tensor::randn(0f32, 1f32, self.mean.shape(), self.mean.device())?
            .to_dtype(self.mean.dtype())?;
        self.sample_with(&noise)
    }

    /// Reparameterized sample with caller-supplied standard normal noise.
    pub fn sample_with(&self, noise: &Tensor) -> Result<Tensor> {
        self.mean.broadcast_add(&self.std()?.broadcast_mul(noise)?)
    }

    /// KL divergence against N(0, 1), summed over every non-batch dimension.
    pub fn kl(&self) -> Result<Tensor> {
        let log_variance = self.clamped_log_variance()?;
        let terms = ((self.mean.sqr()? + log_variance.exp()?)? - log_variance)?;
        terms.affine(0.5, -0.5)?.flatten_from(1)?.sum(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn params(channels: usize, h: usize, w: usize) -> Tensor {
        Tensor::arange(0f32, (channels * h * w) as f32, &Device::Cpu)
            .unwrap()
            .reshape((1, channels, h, w))
            .unwrap()
    }

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn split_halves_the_channel_dimension() {
        let params = LatentDistributionParams::new(params(8, 3, 5), 4).unwrap();
        let dist = LatentDistribution::new(&params).unwrap();

        assert_eq!(dist.mean().dims(), &[1, 4, 3, 5]);
        assert_eq!(dist.log_variance().dims(), &[1, 4, 3, 5]);
    }

    #[test]
    fn mean_and_log_variance_come_from_the_right_channels() {
        let params = LatentDistributionParams::new(params(8, 1, 2), 4).unwrap();
        let dist = LatentDistribution::new(&params).unwrap();

        assert_eq!(values(dist.mean()), (0..8).map(|v| v as f32).collect::<Vec<_>>());
        assert_eq!(
            values(dist.log_variance()),
            (8..16).map(|v| v as f32).collect::<Vec<_>>()
        );
    }

    #[test]
    fn mode_is_exactly_the_mean() {
        let params = LatentDistributionParams::new(params(8, 4, 4), 4).unwrap();
        let dist = LatentDistribution::new(&params).unwrap();

        let mode = dist.mode();
        assert_eq!(mode.dims(), dist.mean().dims());
        assert_eq!(values(&mode), values(dist.mean()));
    }

    #[test]
    fn too_few_channels_is_rejected() {
        let err = LatentDistributionParams::new(params(6, 2, 2), 4).unwrap_err();
        assert!(matches!(
            err,
            DistributionError::TooFewChannels {
                expected: 8,
                actual: 6
            }
        ));
    }

    #[test]
    fn log_variance_is_not_clamped_but_std_is() {
        let data = Tensor::new(&[0f32, 100.0], &Device::Cpu)
            .unwrap()
            .reshape((1, 2, 1, 1))
            .unwrap();
        let params = LatentDistributionParams::new(data, 1).unwrap();
        let dist = LatentDistribution::new(&params).unwrap();

        assert_eq!(values(dist.log_variance()), vec![100.0]);
        let std = values(&dist.std().unwrap())[0];
        assert!((std - 10f32.exp()).abs() / 10f32.exp() < 1e-5);
    }

    #[test]
    fn sample_with_zero_noise_is_the_mean() {
        let params = LatentDistributionParams::new(params(8, 2, 2), 4).unwrap();
        let dist = LatentDistribution::new(&params).unwrap();

        let noise = Tensor::zeros((1, 4, 2, 2), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(values(&dist.sample_with(&noise).unwrap()), values(dist.mean()));
        assert_eq!(dist.sample().unwrap().dims(), &[1, 4, 2, 2]);
    }

    #[test]
    fn kl_of_standard_normal_is_zero() {
        let data = Tensor::zeros((2, 8, 3, 3), DType::F32, &Device::Cpu).unwrap();
        let params = LatentDistributionParams::new(data, 4).unwrap();
        let dist = LatentDistribution::new(&params).unwrap();

        let kl = dist.kl().unwrap();
        assert_eq!(kl.dims(), &[2]);
        assert!(values(&kl).iter().all(|v| v.abs() < 1e-6));
    }
}
