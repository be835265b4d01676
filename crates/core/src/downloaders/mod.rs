pub mod huggingface;

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

use crate::models::CheckpointInfo;

#[async_trait]
pub trait Downloader: Send + Sync {
    /// Download a checkpoint (optionally one sub-folder of it) into `storage`.
    async fn download(
        &self,
        repo_id: &str,
        variant: Option<&str>,
        storage: &Path,
    ) -> Result<CheckpointInfo>;
}

pub use huggingface::HuggingFaceDownloader;
