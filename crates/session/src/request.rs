use image::{DynamicImage, RgbImage};
use rand::Rng;
use tokio::sync::mpsc;

use crate::error::PaintError;
use crate::timer::Throughput;

/// Where a session sends step progress. Bounded, so a slow consumer slows
/// the run down instead of queueing decoded images without limit.
pub type ProgressSink = mpsc::Sender<GenerationProgress>;

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Image to condition on; encoded to a latent before the run
    pub init_image: Option<DynamicImage>,
    pub image_count: usize,
    pub step_count: usize,
    pub guidance_scale: f32,
    pub seed: u64,
    pub make_variations: bool,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            init_image: None,
            image_count: 1,
            step_count: 10,
            guidance_scale: 7.0,
            seed: 42,
            make_variations: false,
        }
    }

    /// Replace the seed with a uniform pick in `0..=max`.
    pub fn randomize_seed(&mut self, max: u64) -> u64 {
        self.seed = random_seed(max);
        self.seed
    }

    pub(crate) fn validate(&self) -> Result<(), PaintError> {
        if self.step_count == 0 {
            return Err(PaintError::InvalidRequest(
                "step count must be positive".to_string(),
            ));
        }
        if self.image_count == 0 {
            return Err(PaintError::InvalidRequest(
                "image count must be positive".to_string(),
            ));
        }
        if !self.guidance_scale.is_finite() {
            return Err(PaintError::InvalidRequest(format!(
                "guidance scale {} is not finite",
                self.guidance_scale
            )));
        }
        Ok(())
    }
}

pub fn random_seed(max: u64) -> u64 {
    rand::thread_rng().gen_range(0..=max)
}

/// One step of a run, as delivered to the progress sink
#[derive(Debug, Clone)]
pub struct GenerationProgress {
    pub step: usize,
    pub step_count: usize,
    /// Decoded images; empty on throttled steps
    pub images: Vec<Option<RgbImage>>,
    pub throughput: Option<Throughput>,
}

impl GenerationProgress {
    pub fn fraction(&self) -> f32 {
        self.step as f32 / self.step_count as f32
    }

    pub fn is_final(&self) -> bool {
        self.step == self.step_count
    }

    pub fn first_image(&self) -> Option<&RgbImage> {
        self.images.first().and_then(|i| i.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(GenerationRequest::new("a paintbrush").validate().is_ok());
    }

    #[test]
    fn zero_steps_is_invalid() {
        let mut request = GenerationRequest::new("x");
        request.step_count = 0;
        assert!(matches!(
            request.validate(),
            Err(PaintError::InvalidRequest(_))
        ));
    }

    #[test]
    fn zero_images_is_invalid() {
        let mut request = GenerationRequest::new("x");
        request.image_count = 0;
        assert!(matches!(
            request.validate(),
            Err(PaintError::InvalidRequest(_))
        ));
    }

    #[test]
    fn nan_guidance_is_invalid() {
        let mut request = GenerationRequest::new("x");
        request.guidance_scale = f32::NAN;
        assert!(request.validate().is_err());
    }

    #[test]
    fn randomized_seed_stays_in_range() {
        let mut request = GenerationRequest::new("x");
        for _ in 0..100 {
            assert!(request.randomize_seed(10) <= 10);
        }
        assert_eq!(request.randomize_seed(0), 0);
    }

    #[test]
    fn progress_helpers() {
        let progress = GenerationProgress {
            step: 5,
            step_count: 10,
            images: vec![None, Some(RgbImage::new(1, 1))],
            throughput: None,
        };
        assert_eq!(progress.fraction(), 0.5);
        assert!(!progress.is_final());
        assert!(progress.first_image().is_none());
    }
}
