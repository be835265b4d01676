//! hyperpaint_session - Painter session
//!
//! This crate owns the generation pipeline for a session:
//! - Lazily builds the pipeline from a checkpoint and reuses it
//! - Runs one generation at a time in the background
//! - Forwards throttled step progress with throughput telemetry

mod error;
mod painter;
mod request;
mod timer;

pub use error::PaintError;
pub use painter::{should_display, Painter, PainterConfig};
pub use request::{random_seed, GenerationProgress, GenerationRequest, ProgressSink};
pub use timer::{SampleTimer, Throughput, TimerError};

pub use hyperpaint_runtime_api::SessionStatus;
