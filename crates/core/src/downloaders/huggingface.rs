use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;
use serde::Deserialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use super::Downloader;
use crate::models::{checkpoint_dir_name, CheckpointInfo, CheckpointSource};

const HF_API_BASE: &str = "https://huggingface.co/api";
const HF_CDN_BASE: &str = "https://huggingface.co";

pub struct HuggingFaceDownloader {
    client: Client,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HfRepoInfo {
    pub id: String,
    #[serde(default)]
    pub siblings: Vec<HfSibling>,
}

#[derive(Debug, Deserialize)]
pub struct HfSibling {
    pub rfilename: String,
}

impl HuggingFaceDownloader {
    pub fn new(token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("hyperpaint/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client, token })
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    pub async fn get_repo_info(&self, repo_id: &str) -> Result<HfRepoInfo> {
        let url = format!("{}/models/{}", HF_API_BASE, repo_id);

        let response = self
            .get(&url)
            .send()
            .await
            .context("Failed to fetch repository info")?;

        if !response.status().is_success() {
            anyhow::bail!("Repository '{}' not found on HuggingFace", repo_id);
        }

        let info: HfRepoInfo = response.json().await?;
        Ok(info)
    }

    async fn download_file(&self, repo_id: &str, filename: &str, dest_path: &Path) -> Result<u64> {
        let url = format!("{}/{}/resolve/main/{}", HF_CDN_BASE, repo_id, filename);

        let response = self
            .get(&url)
            .send()
            .await
            .context("Failed to start download")?;

        if !response.status().is_success() {
            anyhow::bail!("Failed to download {}: {}", filename, response.status());
        }

        let total_size = response.content_length().unwrap_or(0);

        let pb = ProgressBar::new(total_size);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}")?
                .progress_chars("#>-"),
        );
        pb.set_message(filename.to_string());

        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = File::create(dest_path)?;
        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Error downloading chunk")?;
            file.write_all(&chunk)?;
            downloaded += chunk.len() as u64;
            pb.set_position(downloaded);
        }

        pb.finish_with_message(format!("Downloaded {}", filename));
        Ok(downloaded)
    }

    async fn download_all(
        &self,
        repo_id: &str,
        files: &[(String, String)],
        destination: &Path,
    ) -> Result<u64> {
        let mut total_size = 0u64;
        for (remote, local) in files {
            total_size += self
                .download_file(repo_id, remote, &destination.join(local))
                .await?;
        }
        Ok(total_size)
    }
}

/// Pick the repository files under `variant/` (or every file when no variant
/// is given) and map each to its path relative to the checkpoint directory.
pub fn select_files(info: &HfRepoInfo, variant: Option<&str>) -> Vec<(String, String)> {
    let prefix = variant
        .map(|v| v.trim_matches('/'))
        .filter(|v| !v.is_empty())
        .map(|v| format!("{}/", v));

    info.siblings
        .iter()
        .filter(|s| s.rfilename != ".gitattributes")
        .filter_map(|s| match &prefix {
            Some(prefix) => s
                .rfilename
                .strip_prefix(prefix.as_str())
                .map(|local| (s.rfilename.clone(), local.to_string())),
            None => Some((s.rfilename.clone(), s.rfilename.clone())),
        })
        .collect()
}

#[async_trait]
impl Downloader for HuggingFaceDownloader {
    async fn download(
        &self,
        repo_id: &str,
        variant: Option<&str>,
        storage: &Path,
    ) -> Result<CheckpointInfo> {
        let name = checkpoint_dir_name(repo_id, variant);
        let destination = storage.join(&name);
        if destination.exists() {
            anyhow::bail!("Checkpoint already exists at {}", destination.display());
        }

        println!("Fetching repository info from HuggingFace...");
        let info = self.get_repo_info(repo_id).await?;

        let files = select_files(&info, variant);
        if files.is_empty() {
            anyhow::bail!(
                "No files found in '{}' under variant {:?}",
                info.id,
                variant.unwrap_or("")
            );
        }

        println!(
            "Downloading {} file(s) to {}",
            files.len(),
            destination.display()
        );
        fs::create_dir_all(&destination)?;

        let size_bytes = match self.download_all(repo_id, &files, &destination).await {
            Ok(size) => size,
            Err(e) => {
                // A partial checkpoint would be mistaken for a complete one later
                if let Err(cleanup) = fs::remove_dir_all(&destination) {
                    tracing::warn!("Failed to remove partial checkpoint: {}", cleanup);
                }
                return Err(e);
            }
        };

        Ok(CheckpointInfo {
            name,
            source: CheckpointSource::HuggingFace {
                repo_id: repo_id.to_string(),
                variant: variant.map(|v| v.to_string()),
            },
            path: destination,
            size_bytes,
            files: files.into_iter().map(|(_, local)| local).collect(),
            downloaded_at: chrono::Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(files: &[&str]) -> HfRepoInfo {
        HfRepoInfo {
            id: "apple/coreml-stable-diffusion-v1-4".to_string(),
            siblings: files
                .iter()
                .map(|f| HfSibling {
                    rfilename: f.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn variant_selects_only_its_folder() {
        let info = repo(&[
            ".gitattributes",
            "README.md",
            "original/compiled/Unet.mlmodelc/model.mil",
            "original/packages/Unet.mlpackage",
            "split_einsum/compiled/Unet.mlmodelc/model.mil",
        ]);

        let files = select_files(&info, Some("original/compiled"));
        assert_eq!(
            files,
            vec![(
                "original/compiled/Unet.mlmodelc/model.mil".to_string(),
                "Unet.mlmodelc/model.mil".to_string()
            )]
        );
    }

    #[test]
    fn no_variant_selects_everything_but_gitattributes() {
        let info = repo(&[".gitattributes", "README.md", "vae/config.json"]);
        let files = select_files(&info, None);
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|(remote, local)| remote == local));
    }
}
