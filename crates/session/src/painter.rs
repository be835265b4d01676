//! Generation orchestration
//!
//! A `Painter` owns the pipeline for one session. The pipeline is built from
//! the checkpoint on the first run and reused afterwards; runs execute on
//! tokio's blocking pool and hand their progress back over a channel.
//!
//! Session status moves `Idle -> Compiling -> Running -> (Displaying <-> Running)* -> Idle`,
//! with `Compiling` skipped while a pipeline for the current checkpoint exists.

use hyperpaint_runtime_api::{
    GenerationPipeline, PipelineConfig, PipelineLoader, PipelineRequest, SessionStatus, StepState,
};
use hyperpaint_runtime_candle::LatentEncoder;
use image::RgbImage;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::PaintError;
use crate::request::{GenerationProgress, GenerationRequest, ProgressSink};
use crate::timer::SampleTimer;

/// Construction-time settings of a painter session
#[derive(Debug, Clone)]
pub struct PainterConfig {
    /// Checkpoint bundle the pipeline is built from
    pub checkpoint: Option<PathBuf>,
    /// Decode intermediate images every N steps; 0 decodes the final step only
    pub display_every: usize,
    pub disable_safety: bool,
    pub use_gpu: bool,
    pub width: u32,
    pub height: u32,
}

impl Default for PainterConfig {
    fn default() -> Self {
        Self {
            checkpoint: None,
            display_every: 3,
            disable_safety: false,
            use_gpu: true,
            width: 1024,
            height: 1024,
        }
    }
}

/// Whether step `step` of `step_count` decodes images. The final step always does.
pub fn should_display(step: usize, step_count: usize, display_every: usize) -> bool {
    step == step_count || (display_every > 0 && step % display_every == 0)
}

struct Session {
    checkpoint: Option<PathBuf>,
    pipeline: Option<Box<dyn GenerationPipeline>>,
    loaded_from: Option<PathBuf>,
    cancel: Option<CancellationToken>,
}

struct Shared {
    config: PainterConfig,
    loader: Arc<dyn PipelineLoader>,
    encoder: Option<Arc<dyn LatentEncoder>>,
    session: Mutex<Session>,
    status: watch::Sender<SessionStatus>,
}

impl Shared {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: SessionStatus) {
        self.status.send_replace(status);
    }
}

/// What a successful claim hands to the run
struct Claim {
    pipeline: Option<Box<dyn GenerationPipeline>>,
    checkpoint: PathBuf,
    cancel: CancellationToken,
}

/// Cancels the run if the `generate` future is dropped before it finishes.
/// The session stays busy until the background side has actually stopped.
struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Returns the session to `Idle` when the background side of a run ends,
/// panics included.
struct IdleOnExit<'a> {
    shared: &'a Shared,
}

impl Drop for IdleOnExit<'_> {
    fn drop(&mut self) {
        let mut session = self.shared.session();
        session.cancel = None;
        self.shared.set_status(SessionStatus::Idle);
    }
}

impl Shared {
    /// Background side of a claimed run: build the pipeline if needed, run
    /// the job and hand the pipeline back to the session.
    fn run_claimed(&self, claim: Claim, job: Job) -> Result<Vec<Option<RgbImage>>, PaintError> {
        let _idle = IdleOnExit { shared: self };

        let mut pipeline = match claim.pipeline {
            Some(pipeline) => pipeline,
            None => self.compile(claim.checkpoint)?,
        };
        if job.cancel.is_cancelled() {
            self.session().pipeline = Some(pipeline);
            return Err(PaintError::Cancelled);
        }
        self.set_status(SessionStatus::Running);

        tracing::info!(
            pipeline = pipeline.name(),
            steps = job.request.step_count,
            images = job.request.image_count,
            seed = job.request.seed,
            "Starting generation"
        );

        let result = job.run(pipeline.as_mut(), &self.status);
        self.session().pipeline = Some(pipeline);

        match &result {
            Ok(_) => tracing::info!("Generation finished"),
            Err(e) => tracing::warn!("Generation failed: {}", e),
        }
        result
    }

    fn compile(&self, checkpoint: PathBuf) -> Result<Box<dyn GenerationPipeline>, PaintError> {
        let config = PipelineConfig {
            checkpoint: checkpoint.clone(),
            disable_safety: self.config.disable_safety,
            use_gpu: self.config.use_gpu,
            width: self.config.width,
            height: self.config.height,
        };

        tracing::info!("Creating pipeline from {:?}", checkpoint);
        match self.loader.load(&config) {
            Ok(pipeline) => {
                tracing::info!("Created pipeline {}", pipeline.name());
                self.session().loaded_from = Some(checkpoint);
                Ok(pipeline)
            }
            Err(e) => {
                tracing::error!("Failed to create pipeline: {:#}", e);
                Err(PaintError::Resource(format!(
                    "failed to create pipeline: {:#}",
                    e
                )))
            }
        }
    }
}

/// Owns the generation pipeline of one session. Clones share the session.
#[derive(Clone)]
pub struct Painter {
    shared: Arc<Shared>,
}

impl Painter {
    pub fn new(config: PainterConfig, loader: Arc<dyn PipelineLoader>) -> Self {
        Self::build(config, loader, None)
    }

    /// A painter that can condition runs on an input image
    pub fn with_encoder(
        config: PainterConfig,
        loader: Arc<dyn PipelineLoader>,
        encoder: Arc<dyn LatentEncoder>,
    ) -> Self {
        Self::build(config, loader, Some(encoder))
    }

    fn build(
        config: PainterConfig,
        loader: Arc<dyn PipelineLoader>,
        encoder: Option<Arc<dyn LatentEncoder>>,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus::Idle);
        let session = Session {
            checkpoint: config.checkpoint.clone(),
            pipeline: None,
            loaded_from: None,
            cancel: None,
        };
        Self {
            shared: Arc::new(Shared {
                config,
                loader,
                encoder,
                session: Mutex::new(session),
                status,
            }),
        }
    }

    pub fn config(&self) -> &PainterConfig {
        &self.shared.config
    }

    pub fn status(&self) -> SessionStatus {
        *self.shared.status.borrow()
    }

    /// Watch session status changes
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status.subscribe()
    }

    pub fn checkpoint(&self) -> Option<PathBuf> {
        self.shared.session().checkpoint.clone()
    }

    /// Use a different checkpoint from the next run on. The pipeline is
    /// rebuilt only if the path actually changed.
    pub fn set_checkpoint(&self, checkpoint: PathBuf) {
        let mut session = self.shared.session();
        if session.checkpoint.as_ref() != Some(&checkpoint) {
            tracing::info!("Checkpoint changed to {:?}", checkpoint);
            session.checkpoint = Some(checkpoint);
        }
    }

    pub fn is_pipeline_loaded(&self) -> bool {
        self.shared.session().pipeline.is_some()
    }

    /// Cancel the run in flight, if any. It stops at the next step boundary.
    pub fn cancel(&self) -> bool {
        match &self.shared.session().cancel {
            Some(token) => {
                tracing::info!("Cancelling generation");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Run a generation request and return one entry per requested image.
    ///
    /// Fails fast with `PaintError::Busy` while another run of this session is
    /// in flight. Progress for every step, in order, goes to `progress`.
    /// Dropping the returned future cancels the run at its next step boundary.
    pub async fn generate(
        &self,
        request: GenerationRequest,
        progress: Option<ProgressSink>,
    ) -> Result<Vec<Option<RgbImage>>, PaintError> {
        request.validate()?;

        let claim = self.claim()?;
        let _cancel_on_drop = CancelOnDrop(claim.cancel.clone());

        let job = Job {
            request,
            display_every: self.shared.config.display_every,
            encoder: self.shared.encoder.clone(),
            sink: progress,
            cancel: claim.cancel.clone(),
        };
        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || shared.run_claimed(claim, job)).await?
    }

    /// Atomically move `Idle` to `Compiling` or `Running`.
    fn claim(&self) -> Result<Claim, PaintError> {
        let mut session = self.shared.session();
        if self.status().is_busy() {
            return Err(PaintError::Busy);
        }

        let checkpoint = match &session.checkpoint {
            Some(path) if path.exists() => path.clone(),
            other => {
                tracing::warn!("Checkpoint not found: {:?}", other);
                return Err(PaintError::Resource("Couldn't find checkpoint".to_string()));
            }
        };

        let reusable = session.loaded_from.as_ref() == Some(&checkpoint);
        let pipeline = if reusable {
            session.pipeline.take()
        } else {
            session.pipeline = None;
            session.loaded_from = None;
            None
        };

        let cancel = CancellationToken::new();
        session.cancel = Some(cancel.clone());
        self.shared.set_status(if pipeline.is_some() {
            SessionStatus::Running
        } else {
            SessionStatus::Compiling
        });

        Ok(Claim {
            pipeline,
            checkpoint,
            cancel,
        })
    }
}

/// Everything the background side of a run needs
struct Job {
    request: GenerationRequest,
    display_every: usize,
    encoder: Option<Arc<dyn LatentEncoder>>,
    sink: Option<ProgressSink>,
    cancel: CancellationToken,
}

impl Job {
    fn run(
        self,
        pipeline: &mut dyn GenerationPipeline,
        status: &watch::Sender<SessionStatus>,
    ) -> Result<Vec<Option<RgbImage>>, PaintError> {
        let Job {
            request,
            display_every,
            encoder,
            sink,
            cancel,
        } = self;

        let init_latent = match (&request.init_image, &encoder) {
            (None, _) => None,
            (Some(image), Some(encoder)) => Some(encoder.encode(image)?.mode()),
            (Some(_), None) => return Err(PaintError::MissingEncoder),
        };

        let pipeline_request = PipelineRequest {
            prompt: request.prompt,
            init_latent,
            image_count: request.image_count,
            step_count: request.step_count,
            seed: request.seed,
            make_variations: request.make_variations,
        };
        pipeline.set_guidance_scale(request.guidance_scale);

        let mut reporter = StepReporter {
            step_count: request.step_count,
            display_every,
            completed: 0,
            timer: SampleTimer::new(),
            sink,
            receiver_gone: false,
            cancel,
            cancelled: false,
            status,
        };
        reporter.timer.start();

        let images = pipeline
            .generate_images(&pipeline_request, &mut |state: &dyn StepState| {
                reporter.on_step(state)
            })
            .map_err(|e| match e.downcast::<PaintError>() {
                Ok(paint_error) => paint_error,
                Err(e) => PaintError::Pipeline(e),
            })?;

        if reporter.cancelled {
            return Err(PaintError::Cancelled);
        }
        if reporter.completed != reporter.step_count {
            return Err(PaintError::IncompleteRun {
                completed: reporter.completed,
                step_count: reporter.step_count,
            });
        }
        Ok(images)
    }
}

/// Checks ordering, times steps, throttles decodes and forwards progress.
struct StepReporter<'a> {
    step_count: usize,
    display_every: usize,
    completed: usize,
    timer: SampleTimer,
    sink: Option<ProgressSink>,
    receiver_gone: bool,
    cancel: CancellationToken,
    cancelled: bool,
    status: &'a watch::Sender<SessionStatus>,
}

impl StepReporter<'_> {
    fn on_step(&mut self, state: &dyn StepState) -> anyhow::Result<bool> {
        if self.cancel.is_cancelled() {
            self.cancelled = true;
            return Ok(false);
        }

        let step = state.step();
        let expected = self.completed + 1;
        if step != expected || step > self.step_count {
            return Err(PaintError::ProgressOutOfOrder {
                expected,
                actual: step,
            }
            .into());
        }
        self.completed = step;

        if self.timer.stop().is_ok() {
            if let Ok(throughput) = self.timer.throughput() {
                tracing::debug!(
                    step,
                    step_count = self.step_count,
                    mean = throughput.mean,
                    median = throughput.median,
                    last = throughput.last,
                    "step/sec"
                );
            }
        }

        let images = if should_display(step, self.step_count, self.display_every) {
            self.status.send_replace(SessionStatus::Displaying);
            let decoded = state.decode_images();
            self.status.send_replace(SessionStatus::Running);
            decoded?
        } else {
            Vec::new()
        };

        self.deliver(GenerationProgress {
            step,
            step_count: self.step_count,
            images,
            throughput: self.timer.throughput().ok(),
        });

        if step != self.step_count {
            self.timer.start();
        }
        Ok(true)
    }

    fn deliver(&mut self, progress: GenerationProgress) {
        let Some(sink) = &self.sink else {
            return;
        };
        if sink.blocking_send(progress).is_err() && !self.receiver_gone {
            tracing::warn!("Progress receiver dropped; continuing without progress updates");
            self.receiver_gone = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_hits_multiples_and_final_step() {
        let shown: Vec<usize> = (1..=10).filter(|&s| should_display(s, 10, 3)).collect();
        assert_eq!(shown, vec![3, 6, 9, 10]);
    }

    #[test]
    fn throttle_zero_shows_only_final_step() {
        let shown: Vec<usize> = (1..=5).filter(|&s| should_display(s, 5, 0)).collect();
        assert_eq!(shown, vec![5]);
    }

    #[test]
    fn throttle_one_shows_every_step() {
        assert!((1..=4).all(|s| should_display(s, 4, 1)));
    }
}
