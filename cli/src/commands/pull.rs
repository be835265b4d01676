use anyhow::Result;
use hyperpaint_core::downloaders::{Downloader, HuggingFaceDownloader};
use hyperpaint_core::{CheckpointRegistry, Config};
use std::path::PathBuf;

pub async fn execute(repo: Option<&str>, variant: Option<&str>, storage: Option<PathBuf>) -> Result<()> {
    let config = Config::load()?;
    let repo = repo.unwrap_or(&config.models.repo_id);
    let storage = storage.unwrap_or_else(|| config.checkpoints_dir());

    match variant {
        Some(variant) => println!("Pulling checkpoint: {} ({})", repo, variant),
        None => println!("Pulling checkpoint: {}", repo),
    }

    let downloader = HuggingFaceDownloader::new(config.models.hf_token.clone())?;
    let checkpoint = downloader.download(repo, variant, &storage).await?;

    let mut registry = CheckpointRegistry::load()?;
    registry.add(checkpoint.clone())?;

    println!("\nCheckpoint downloaded successfully!");
    println!("  Name: {}", checkpoint.name);
    println!("  Source: {}", checkpoint.source.describe());
    println!("  Files: {}", checkpoint.files.len());
    println!("  Size: {:.2} GB", checkpoint.size_bytes as f64 / 1_073_741_824.0);
    println!("  Path: {:?}", checkpoint.path);

    Ok(())
}
