//! Z-Image pipeline implementation
//!
//! Wraps candle-transformers' z_image module behind `GenerationPipeline`.

use anyhow::Result;
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::z_image::{
    calculate_shift, get_noise, postprocess_image, AutoEncoderKL, Config,
    FlowMatchEulerDiscreteScheduler, SchedulerConfig, TextEncoderConfig, VaeConfig,
    ZImageTextEncoder, ZImageTransformer2DModel,
};
use hyperpaint_runtime_api::{
    GenerationPipeline, PipelineConfig, PipelineRequest, StepCallback, StepState,
};
use image::RgbImage;
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;

/// Z-Image scheduler constants
const BASE_IMAGE_SEQ_LEN: usize = 256;
const MAX_IMAGE_SEQ_LEN: usize = 4096;
const BASE_SHIFT: f64 = 0.5;
const MAX_SHIFT: f64 = 1.15;

const LATENT_CHANNELS: usize = 16;
const VAE_ALIGN: usize = 16;

/// Z-Image generation pipeline
pub struct ZImagePipeline {
    tokenizer: Tokenizer,
    text_encoder: ZImageTextEncoder,
    transformer: ZImageTransformer2DModel,
    vae: AutoEncoderKL,
    device: Device,
    dtype: DType,
    width: usize,
    height: usize,
    guidance_scale: f32,
}

/// Text conditioning for one prompt
struct PromptEmbedding {
    features: Tensor,
    mask: Tensor,
}

fn shard_files(dir: &Path, pattern: impl Fn(usize) -> String) -> Vec<PathBuf> {
    (1..=3)
        .map(|i| dir.join(pattern(i)))
        .filter(|p| p.exists())
        .collect()
}

impl ZImagePipeline {
    /// Load Z-Image pipeline from a checkpoint directory
    pub fn load(config: &PipelineConfig, device: &Device) -> Result<Self> {
        let model_path = config.checkpoint.as_path();
        let dtype = device.bf16_default_to_f32();

        if !config.disable_safety {
            tracing::warn!("Z-Image checkpoints ship without a safety checker; outputs are unfiltered");
        }

        let tokenizer_path = model_path.join("tokenizer").join("tokenizer.json");
        if !tokenizer_path.exists() {
            anyhow::bail!("Tokenizer not found at {:?}", tokenizer_path);
        }
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {}", e))?;

        let text_encoder_dir = model_path.join("text_encoder");
        let text_encoder_config_path = text_encoder_dir.join("config.json");
        let text_encoder_cfg: TextEncoderConfig = if text_encoder_config_path.exists() {
            serde_json::from_reader(std::fs::File::open(&text_encoder_config_path)?)?
        } else {
            TextEncoderConfig::z_image()
        };

        let text_encoder_files =
            shard_files(&text_encoder_dir, |i| format!("model-{:05}-of-00003.safetensors", i));
        if text_encoder_files.is_empty() {
            anyhow::bail!("Text encoder weights not found in {:?}", text_encoder_dir);
        }
        let text_encoder_weights =
            unsafe { VarBuilder::from_mmaped_safetensors(&text_encoder_files, dtype, device)? };
        let text_encoder = ZImageTextEncoder::new(&text_encoder_cfg, text_encoder_weights)?;

        let transformer_dir = model_path.join("transformer");
        let transformer_config_path = transformer_dir.join("config.json");
        let transformer_cfg: Config = if transformer_config_path.exists() {
            serde_json::from_reader(std::fs::File::open(&transformer_config_path)?)?
        } else {
            Config::z_image_turbo()
        };

        let transformer_files = shard_files(&transformer_dir, |i| {
            format!("diffusion_pytorch_model-{:05}-of-00003.safetensors", i)
        });
        if transformer_files.is_empty() {
            anyhow::bail!("Transformer weights not found in {:?}", transformer_dir);
        }
        let transformer_weights =
            unsafe { VarBuilder::from_mmaped_safetensors(&transformer_files, dtype, device)? };
        let transformer = ZImageTransformer2DModel::new(&transformer_cfg, transformer_weights)?;

        let vae_config_path = model_path.join("vae").join("config.json");
        let vae_cfg: VaeConfig = if vae_config_path.exists() {
            serde_json::from_reader(std::fs::File::open(&vae_config_path)?)?
        } else {
            VaeConfig::z_image()
        };

        let vae_path = model_path.join("vae").join("diffusion_pytorch_model.safetensors");
        if !vae_path.exists() {
            anyhow::bail!("VAE weights not found at {:?}", vae_path);
        }
        let vae_weights = unsafe { VarBuilder::from_mmaped_safetensors(&[vae_path], dtype, device)? };
        let vae = AutoEncoderKL::new(&vae_cfg, vae_weights)?;

        Ok(Self {
            tokenizer,
            text_encoder,
            transformer,
            vae,
            device: device.clone(),
            dtype,
            width: config.width as usize,
            height: config.height as usize,
            guidance_scale: 1.0,
        })
    }

    /// Format prompt for Qwen3 chat template
    fn format_prompt(prompt: &str) -> String {
        format!(
            "<|im_start|>user\n{}<|im_end|>\n<|im_start|>assistant\n",
            prompt
        )
    }

    fn encode_prompt(&self, prompt: &str) -> Result<PromptEmbedding> {
        let formatted = Self::format_prompt(prompt);
        let tokens = self
            .tokenizer
            .encode(formatted.as_str(), true)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))?
            .get_ids()
            .to_vec();
        let len = tokens.len();

        let input_ids = Tensor::from_vec(tokens, (1, len), &self.device)?;
        let features = self.text_encoder.forward(&input_ids)?;
        let mask = Tensor::ones((1, len), DType::U8, &self.device)?;
        Ok(PromptEmbedding { features, mask })
    }

    fn latent_size(&self) -> Result<(usize, usize)> {
        if self.height % VAE_ALIGN != 0 || self.width % VAE_ALIGN != 0 {
            anyhow::bail!(
                "Image dimensions must be divisible by {}. Got {}x{}",
                VAE_ALIGN,
                self.width,
                self.height
            );
        }
        Ok((2 * (self.height / VAE_ALIGN), 2 * (self.width / VAE_ALIGN)))
    }

    /// One scheduler step for one image. `latents` carries a frame dimension.
    fn denoise_step(
        &self,
        latents: &Tensor,
        scheduler: &mut FlowMatchEulerDiscreteScheduler,
        cond: &PromptEmbedding,
        uncond: Option<&PromptEmbedding>,
    ) -> Result<Tensor> {
        let t = scheduler.current_timestep_normalized();
        let t_tensor = Tensor::from_vec(vec![t as f32], (1,), &self.device)?.to_dtype(self.dtype)?;

        let noise_pred = self
            .transformer
            .forward(latents, &t_tensor, &cond.features, &cond.mask)?;

        let noise_pred = match uncond {
            Some(uncond) => {
                let uncond_pred =
                    self.transformer
                        .forward(latents, &t_tensor, &uncond.features, &uncond.mask)?;
                let diff = (&noise_pred - &uncond_pred)?;
                (&uncond_pred + (diff * self.guidance_scale as f64)?)?
            }
            None => noise_pred,
        };

        // Z-Image predicts the negated velocity
        let noise_pred = noise_pred.neg()?;

        let prev = scheduler.step(&noise_pred.squeeze(2)?, &latents.squeeze(2)?)?;
        Ok(prev.unsqueeze(2)?)
    }

    fn decode(&self, latents: &Tensor) -> Result<RgbImage> {
        let image = self.vae.decode(&latents.squeeze(2)?)?;
        let image = postprocess_image(&image)?;
        let image = image.i(0)?;

        let (c, h, w) = image.dims3()?;
        if c != 3 {
            anyhow::bail!("Expected 3 channels from the VAE, got {}", c);
        }

        let pixels: Vec<u8> = image.permute((1, 2, 0))?.flatten_all()?.to_vec1()?;
        RgbImage::from_raw(w as u32, h as u32, pixels)
            .ok_or_else(|| anyhow::anyhow!("Decoded pixel buffer does not match {}x{}", w, h))
    }

    fn generate_internal(
        &self,
        request: &PipelineRequest,
        on_step: &mut StepCallback<'_>,
    ) -> Result<Vec<Option<RgbImage>>> {
        if request.init_latent.is_some() {
            anyhow::bail!("Z-Image pipeline does not accept a conditioning image");
        }
        if request.make_variations {
            tracing::debug!("make_variations has no effect without a conditioning image");
        }

        let num_steps = request.step_count;
        let cond = self.encode_prompt(&request.prompt)?;
        let uncond = if self.guidance_scale > 1.0 {
            Some(self.encode_prompt("")?)
        } else {
            None
        };

        let (latent_h, latent_w) = self.latent_size()?;
        let patch_size = self.transformer.config().all_patch_size[0];
        let image_seq_len = (latent_h / patch_size) * (latent_w / patch_size);
        let mu = calculate_shift(
            image_seq_len,
            BASE_IMAGE_SEQ_LEN,
            MAX_IMAGE_SEQ_LEN,
            BASE_SHIFT,
            MAX_SHIFT,
        );

        let mut latents = Vec::with_capacity(request.image_count);
        let mut schedulers = Vec::with_capacity(request.image_count);
        for i in 0..request.image_count {
            let seed = request.seed.wrapping_add(i as u64);
            if let Err(e) = self.device.set_seed(seed) {
                tracing::warn!("Device cannot be seeded, seed {} ignored: {}", seed, e);
            }
            let noise = get_noise(1, LATENT_CHANNELS, latent_h, latent_w, &self.device)?
                .to_dtype(self.dtype)?;
            latents.push(noise.unsqueeze(2)?);

            let mut scheduler = FlowMatchEulerDiscreteScheduler::new(SchedulerConfig::z_image_turbo());
            scheduler.set_timesteps(num_steps, Some(mu));
            schedulers.push(scheduler);
        }

        let mut final_images = None;
        for step in 1..=num_steps {
            for (latent, scheduler) in latents.iter_mut().zip(schedulers.iter_mut()) {
                *latent = self.denoise_step(latent, scheduler, &cond, uncond.as_ref())?;
            }

            let state = ZImageStep {
                pipeline: self,
                latents: &latents,
                step,
                step_count: num_steps,
                decoded: DecodedImages::default(),
            };
            if !on_step(&state as &dyn StepState)? {
                tracing::info!("Generation stopped after step {} of {}", step, num_steps);
                return Ok(Vec::new());
            }
            if step == num_steps {
                final_images = state.decoded.into_inner();
            }
        }

        match final_images {
            Some(images) => Ok(images),
            None => self.decode_all(&latents),
        }
    }

    fn decode_all(&self, latents: &[Tensor]) -> Result<Vec<Option<RgbImage>>> {
        latents
            .iter()
            .map(|latent| self.decode(latent).map(Some))
            .collect()
    }
}

/// Images decoded for one step. The final step's decode doubles as the run's result.
#[derive(Default)]
struct DecodedImages(RefCell<Option<Vec<Option<RgbImage>>>>);

impl DecodedImages {
    fn get_or_decode(
        &self,
        decode: impl FnOnce() -> Result<Vec<Option<RgbImage>>>,
    ) -> Result<Vec<Option<RgbImage>>> {
        if let Some(images) = self.0.borrow().as_ref() {
            return Ok(images.clone());
        }
        let images = decode()?;
        *self.0.borrow_mut() = Some(images.clone());
        Ok(images)
    }

    fn into_inner(self) -> Option<Vec<Option<RgbImage>>> {
        self.0.into_inner()
    }
}

struct ZImageStep<'a> {
    pipeline: &'a ZImagePipeline,
    latents: &'a [Tensor],
    step: usize,
    step_count: usize,
    decoded: DecodedImages,
}

impl StepState for ZImageStep<'_> {
    fn step(&self) -> usize {
        self.step
    }

    fn step_count(&self) -> usize {
        self.step_count
    }

    fn decode_images(&self) -> Result<Vec<Option<RgbImage>>> {
        self.decoded
            .get_or_decode(|| self.pipeline.decode_all(self.latents))
    }
}

impl GenerationPipeline for ZImagePipeline {
    fn name(&self) -> &str {
        "Z-Image-Turbo"
    }

    fn guidance_scale(&self) -> f32 {
        self.guidance_scale
    }

    fn set_guidance_scale(&mut self, scale: f32) {
        self.guidance_scale = scale;
    }

    fn generate_images(
        &mut self,
        request: &PipelineRequest,
        on_step: &mut StepCallback<'_>,
    ) -> Result<Vec<Option<RgbImage>>> {
        self.generate_internal(request, on_step)
    }
}

// Only the session's run task touches the pipeline, one run at a time.
unsafe impl Send for ZImagePipeline {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn decoded_images_are_reused() {
        let calls = Cell::new(0);
        let decoded = DecodedImages::default();
        let decode = || {
            calls.set(calls.get() + 1);
            Ok(vec![Some(RgbImage::new(2, 2))])
        };

        assert_eq!(decoded.get_or_decode(decode).unwrap().len(), 1);
        assert_eq!(decoded.get_or_decode(decode).unwrap().len(), 1);
        assert_eq!(calls.get(), 1);
        assert_eq!(decoded.into_inner().map(|images| images.len()), Some(1));
    }

    #[test]
    fn failed_decode_is_not_cached() {
        let decoded = DecodedImages::default();
        assert!(decoded
            .get_or_decode(|| anyhow::bail!("out of memory"))
            .is_err());
        assert!(decoded.into_inner().is_none());
    }

    #[test]
    fn undecoded_step_has_nothing_to_reuse() {
        assert!(DecodedImages::default().into_inner().is_none());
    }
}
