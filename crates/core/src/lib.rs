//! hyperpaint_core - Core library for checkpoint management
//!
//! This crate provides:
//! - The `config.toml` settings shared by the CLI and the painter session
//! - HuggingFace checkpoint downloads
//! - Local checkpoint registry

pub mod config;
pub mod downloaders;
pub mod models;
pub mod registry;

pub use config::Config;
pub use models::{CheckpointInfo, CheckpointSource};
pub use registry::CheckpointRegistry;
