//! hyperpaint_runtime_api - Generation pipeline traits and types
//!
//! This crate defines the contract between the painter session and the
//! diffusion pipeline that actually produces images. Each pipeline
//! implementation (Z-Image on candle, test doubles, ...) implements these traits.

use anyhow::Result;
use candle_core::Tensor;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle of a painter session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    /// No run in flight
    Idle,
    /// Building the pipeline from a checkpoint
    Compiling,
    /// A generation request is in flight
    Running,
    /// Decoding intermediate images for a progress event
    Displaying,
}

impl SessionStatus {
    pub fn is_busy(self) -> bool {
        self != SessionStatus::Idle
    }
}

/// Configuration used to construct a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Directory holding the precompiled checkpoint bundle
    pub checkpoint: PathBuf,
    /// Skip the safety checker if the pipeline has one
    pub disable_safety: bool,
    pub use_gpu: bool,
    pub width: u32,
    pub height: u32,
}

/// Parameters of a single run, resolved by the session
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub prompt: String,
    /// Latent of the conditioning image, if any
    pub init_latent: Option<Tensor>,
    pub image_count: usize,
    pub step_count: usize,
    pub seed: u64,
    pub make_variations: bool,
}

/// Snapshot of the denoising loop handed to the step callback
pub trait StepState {
    /// 1-based index of the step that just finished
    fn step(&self) -> usize;

    fn step_count(&self) -> usize;

    /// Decode the current latents to pixels. One entry per requested image;
    /// `None` where an image is not available (e.g. filtered by a safety checker).
    fn decode_images(&self) -> Result<Vec<Option<RgbImage>>>;
}

/// Callback invoked after every denoising step. Returning `Ok(false)` asks the
/// pipeline to stop early; an error aborts the run and is returned as-is.
pub type StepCallback<'a> = dyn FnMut(&dyn StepState) -> Result<bool> + 'a;

/// The diffusion pipeline driven by the painter session
pub trait GenerationPipeline: Send {
    /// Get the pipeline name
    fn name(&self) -> &str;

    fn guidance_scale(&self) -> f32;

    /// Run-scoped configuration, set before a run starts
    fn set_guidance_scale(&mut self, scale: f32);

    /// Generate `request.image_count` images, calling `on_step` once per step
    /// in increasing order.
    fn generate_images(
        &mut self,
        request: &PipelineRequest,
        on_step: &mut StepCallback<'_>,
    ) -> Result<Vec<Option<RgbImage>>>;
}

/// Builds pipelines from checkpoints
pub trait PipelineLoader: Send + Sync {
    fn load(&self, config: &PipelineConfig) -> Result<Box<dyn GenerationPipeline>>;
}
