use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub name: String,
    pub source: CheckpointSource,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub files: Vec<String>,
    pub downloaded_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum CheckpointSource {
    HuggingFace {
        repo_id: String,
        variant: Option<String>,
    },
    Local,
}

impl CheckpointSource {
    pub fn describe(&self) -> String {
        match self {
            CheckpointSource::HuggingFace {
                repo_id,
                variant: Some(variant),
            } => format!("{} ({})", repo_id, variant),
            CheckpointSource::HuggingFace { repo_id, variant: None } => repo_id.clone(),
            CheckpointSource::Local => "local".to_string(),
        }
    }
}

/// Directory name for a pulled checkpoint: `<repo name>` or `<repo name>_<variant>`
/// with path separators in the variant flattened to underscores.
pub fn checkpoint_dir_name(repo_id: &str, variant: Option<&str>) -> String {
    let repo_name = repo_id.rsplit('/').next().unwrap_or(repo_id);
    match variant {
        Some(variant) if !variant.is_empty() => {
            format!("{}_{}", repo_name, variant.trim_matches('/').replace('/', "_"))
        }
        _ => repo_name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_name_flattens_variant() {
        assert_eq!(
            checkpoint_dir_name("apple/coreml-stable-diffusion-v1-4", Some("original/compiled")),
            "coreml-stable-diffusion-v1-4_original_compiled"
        );
    }

    #[test]
    fn dir_name_without_variant_is_repo_name() {
        assert_eq!(
            checkpoint_dir_name("Tongyi-MAI/Z-Image-Turbo", None),
            "Z-Image-Turbo"
        );
        assert_eq!(checkpoint_dir_name("local-model", Some("")), "local-model");
    }
}
