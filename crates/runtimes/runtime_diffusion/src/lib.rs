//! hyperpaint_runtime_diffusion - Diffusion pipeline runtime
//!
//! This crate provides the `GenerationPipeline` the painter session drives.
//! Supports Z-Image (S3-DiT) checkpoints on candle.

mod zimage;

use anyhow::Result;
use candle_core::Device;
use hyperpaint_runtime_api::{GenerationPipeline, PipelineConfig, PipelineLoader};
use std::path::Path;

pub use zimage::ZImagePipeline;

/// Builds pipelines from checkpoint directories
#[derive(Debug, Default, Clone, Copy)]
pub struct DiffusionLoader;

impl PipelineLoader for DiffusionLoader {
    fn load(&self, config: &PipelineConfig) -> Result<Box<dyn GenerationPipeline>> {
        if !is_zimage_checkpoint(&config.checkpoint)? {
            anyhow::bail!(
                "Not a Z-Image checkpoint: {:?}",
                config.checkpoint
            );
        }

        let device = select_device(config.use_gpu)?;
        tracing::info!("Device: {:?}", device);

        let pipeline = ZImagePipeline::load(config, &device)?;
        Ok(Box::new(pipeline))
    }
}

fn select_device(use_gpu: bool) -> Result<Device> {
    if !use_gpu {
        tracing::info!("Using CPU device (GPU disabled in config)");
        return Ok(Device::Cpu);
    }
    #[cfg(feature = "metal")]
    {
        tracing::info!("Using Metal device");
        Ok(Device::new_metal(0)?)
    }
    #[cfg(all(feature = "cuda", not(feature = "metal")))]
    {
        tracing::info!("Using CUDA device");
        Ok(Device::new_cuda(0)?)
    }
    #[cfg(not(any(feature = "metal", feature = "cuda")))]
    {
        tracing::info!("Using CPU device (no GPU features enabled)");
        Ok(Device::Cpu)
    }
}

/// Whether a checkpoint directory holds a Z-Image model, judged by its
/// transformer config or else its directory name
pub fn is_zimage_checkpoint(checkpoint: &Path) -> Result<bool> {
    let transformer_config = checkpoint.join("transformer").join("config.json");
    if transformer_config.exists() {
        let config_str = std::fs::read_to_string(&transformer_config)?;
        if config_str.contains("ZImage") || config_str.contains("z_image") {
            return Ok(true);
        }
    }

    let dir_name = checkpoint
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_lowercase();

    Ok(dir_name.contains("z-image") || dir_name.contains("zimage"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn detects_zimage_from_transformer_config() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("transformer")).unwrap();
        fs::write(
            dir.path().join("transformer").join("config.json"),
            r#"{"_class_name": "ZImageTransformer2DModel"}"#,
        )
        .unwrap();

        assert!(is_zimage_checkpoint(dir.path()).unwrap());
    }

    #[test]
    fn detects_zimage_from_directory_name() {
        let dir = tempfile::tempdir().unwrap();
        let zimage = dir.path().join("Z-Image-Turbo");
        fs::create_dir_all(&zimage).unwrap();

        assert!(is_zimage_checkpoint(&zimage).unwrap());
    }

    #[test]
    fn other_checkpoints_are_not_zimage() {
        let dir = tempfile::tempdir().unwrap();
        let other = dir.path().join("coreml-stable-diffusion");
        fs::create_dir_all(&other).unwrap();
        fs::write(other.join("flux1-dev.safetensors"), b"").unwrap();

        assert!(!is_zimage_checkpoint(&other).unwrap());
    }

    #[test]
    fn loader_rejects_other_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let flux = dir.path().join("flux-dev");
        fs::create_dir_all(&flux).unwrap();

        let config = PipelineConfig {
            checkpoint: flux,
            disable_safety: false,
            use_gpu: false,
            width: 512,
            height: 512,
        };
        let err = DiffusionLoader.load(&config).err().unwrap();
        assert!(err.to_string().contains("Not a Z-Image checkpoint"));
    }
}
