//! Image generation command

use anyhow::Result;
use chrono::Local;
use clap::Args;
use hyperpaint_core::models::checkpoint_dir_name;
use hyperpaint_core::{CheckpointRegistry, Config};
use hyperpaint_runtime_diffusion::DiffusionLoader;
use hyperpaint_session::{
    GenerationProgress, GenerationRequest, PaintError, Painter, PainterConfig, SessionStatus,
};
use image::RgbImage;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;

#[derive(Args)]
pub struct GenerateArgs {
    /// Text prompt for image generation
    pub prompt: String,

    /// Checkpoint to use: a registered name or a directory
    #[arg(short, long)]
    pub checkpoint: Option<String>,

    /// Number of inference steps
    #[arg(short, long)]
    pub steps: Option<usize>,

    /// Guidance scale for CFG
    #[arg(short, long)]
    pub guidance_scale: Option<f32>,

    /// Random seed for reproducibility
    #[arg(long, conflicts_with = "random_seed")]
    pub seed: Option<u64>,

    /// Pick a fresh seed for this run
    #[arg(long)]
    pub random_seed: bool,

    /// Number of images to generate
    #[arg(short = 'n', long)]
    pub images: Option<usize>,

    /// Decode a preview every N steps (0 = final step only)
    #[arg(long)]
    pub display_every: Option<usize>,

    /// Directory to write the final images to
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Directory to write intermediate previews to
    #[arg(long)]
    pub preview_dir: Option<PathBuf>,

    /// Image width in pixels
    #[arg(long)]
    pub width: Option<u32>,

    /// Image height in pixels
    #[arg(long)]
    pub height: Option<u32>,

    /// Skip the safety checker
    #[arg(long)]
    pub disable_safety: bool,

    /// Run on CPU instead of GPU
    #[arg(long)]
    pub cpu: bool,
}

pub async fn execute(args: GenerateArgs) -> Result<()> {
    let config = Config::load()?;
    let checkpoint = resolve_checkpoint(&config, args.checkpoint.as_deref())?;

    let painter_config = PainterConfig {
        checkpoint: Some(checkpoint.clone()),
        display_every: args.display_every.unwrap_or(config.paint.display_every),
        disable_safety: args.disable_safety || config.paint.disable_safety,
        use_gpu: !args.cpu && config.paint.use_gpu,
        width: args.width.unwrap_or(config.paint.width),
        height: args.height.unwrap_or(config.paint.height),
    };

    let mut request = GenerationRequest::new(args.prompt);
    request.step_count = args.steps.unwrap_or(config.generation.steps);
    request.guidance_scale = args.guidance_scale.unwrap_or(config.generation.guidance_scale);
    request.image_count = args.images.unwrap_or(config.generation.image_count);
    request.seed = args.seed.unwrap_or(config.generation.seed);
    if args.random_seed {
        request.randomize_seed(config.generation.max_seed);
    }

    println!("Image Generation");
    println!("================");
    println!("Checkpoint: {}", checkpoint.display());
    println!("Prompt: {}", request.prompt);
    println!("Size: {}x{}", painter_config.width, painter_config.height);
    println!("Steps: {}", request.step_count);
    println!("Guidance scale: {}", request.guidance_scale);
    println!("Seed: {}", request.seed);
    println!();

    let output_dir = resolve_output_dir(args.output)?;
    if let Some(dir) = &args.preview_dir {
        std::fs::create_dir_all(dir)?;
    }

    let painter = Painter::new(painter_config, Arc::new(DiffusionLoader));
    {
        let painter = painter.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() && painter.cancel() {
                eprintln!("\nCancelling after the current step...");
            }
        });
    }

    let (tx, rx) = mpsc::channel(2);
    let render = tokio::spawn(render_progress(
        rx,
        painter.subscribe(),
        request.step_count,
        args.preview_dir,
    ));

    let start = Instant::now();
    let result = painter.generate(request, Some(tx)).await;
    let images = settle(result, render.await)?;
    println!("Generation completed in {:.2}s", start.elapsed().as_secs_f64());

    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    for (i, image) in images.iter().enumerate() {
        match image {
            Some(image) => {
                let path = output_dir.join(format!("image_{}_{}.png", timestamp, i));
                image.save(&path)?;
                println!("Saved: {}", path.display());
            }
            None => println!("Image {} was withheld by the safety checker", i),
        }
    }

    Ok(())
}

/// The run's outcome decides success; a broken progress display only warns.
fn settle(
    result: Result<Vec<Option<RgbImage>>, PaintError>,
    rendered: Result<Result<()>, JoinError>,
) -> Result<Vec<Option<RgbImage>>> {
    match rendered {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("Progress display failed: {:#}", e),
        Err(e) => tracing::warn!("Progress display task failed: {}", e),
    }
    Ok(result?)
}

async fn render_progress(
    mut progress: mpsc::Receiver<GenerationProgress>,
    mut status: watch::Receiver<SessionStatus>,
    step_count: usize,
    preview_dir: Option<PathBuf>,
) -> Result<()> {
    let pb = ProgressBar::new(step_count as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );
    pb.enable_steady_tick(Duration::from_millis(120));

    loop {
        tokio::select! {
            Ok(()) = status.changed() => {
                let current = *status.borrow_and_update();
                match current {
                    SessionStatus::Compiling => pb.set_message("building pipeline"),
                    SessionStatus::Displaying => pb.set_message("decoding"),
                    SessionStatus::Running | SessionStatus::Idle => {}
                }
            }
            event = progress.recv() => {
                let Some(event) = event else { break };
                pb.set_position(event.step as u64);
                if let Some(throughput) = event.throughput {
                    pb.set_message(format!("{:.2} steps/sec", throughput.mean));
                }
                if let Some(dir) = &preview_dir {
                    save_previews(dir, &event)?;
                }
            }
        }
    }

    pb.finish_and_clear();
    Ok(())
}

fn save_previews(dir: &Path, event: &GenerationProgress) -> Result<()> {
    for (i, image) in event.images.iter().enumerate() {
        if let Some(image) = image {
            image.save(dir.join(format!("step_{:03}_{}.png", event.step, i)))?;
        }
    }
    Ok(())
}

/// A `--checkpoint` flag wins over `paint.checkpoint`; with neither, use the
/// default repository's directory under the storage path.
fn resolve_checkpoint(config: &Config, reference: Option<&str>) -> Result<PathBuf> {
    let registry = CheckpointRegistry::load()?;
    let reference = reference
        .map(str::to_string)
        .or_else(|| config.paint.checkpoint.clone());

    Ok(match reference {
        Some(reference) => registry.resolve(&reference),
        None => config
            .checkpoints_dir()
            .join(checkpoint_dir_name(&config.models.repo_id, None)),
    })
}

/// Resolve output directory, defaulting to ~/Pictures/hyperpaint/
fn resolve_output_dir(output: Option<PathBuf>) -> Result<PathBuf> {
    let dir = match output {
        Some(dir) => dir,
        None => dirs::picture_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hyperpaint"),
    };
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
