use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Painter session settings
    #[serde(default)]
    pub paint: PaintConfig,

    /// Defaults for generation requests
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Checkpoint storage settings
    #[serde(default)]
    pub models: ModelsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaintConfig {
    /// Checkpoint directory or registry name used when none is given
    #[serde(default)]
    pub checkpoint: Option<String>,

    /// Decode intermediate images every N steps (0 = final step only)
    #[serde(default = "default_display_every")]
    pub display_every: usize,

    /// Skip the pipeline's safety checker
    #[serde(default)]
    pub disable_safety: bool,

    /// Use GPU acceleration (Metal on macOS, CUDA on Linux)
    #[serde(default = "default_use_gpu")]
    pub use_gpu: bool,

    /// Output width in pixels
    #[serde(default = "default_size")]
    pub width: u32,

    /// Output height in pixels
    #[serde(default = "default_size")]
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_steps")]
    pub steps: usize,

    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f32,

    #[serde(default = "default_seed")]
    pub seed: u64,

    #[serde(default = "default_image_count")]
    pub image_count: usize,

    /// Upper bound (inclusive) for randomized seeds
    #[serde(default = "default_max_seed")]
    pub max_seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Directory to store checkpoints (default: ~/.config/hyperpaint/checkpoints/)
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,

    /// HuggingFace token for private repositories
    #[serde(default)]
    pub hf_token: Option<String>,

    /// Repository pulled when none is given
    #[serde(default = "default_repo_id")]
    pub repo_id: String,
}

fn default_storage_path() -> PathBuf {
    Config::base_dir()
        .map(|p| p.join("checkpoints"))
        .unwrap_or_else(|_| PathBuf::from("~/.config/hyperpaint/checkpoints"))
}

fn default_display_every() -> usize {
    3
}

fn default_use_gpu() -> bool {
    true
}

fn default_size() -> u32 {
    1024
}

fn default_steps() -> usize {
    10
}

fn default_guidance_scale() -> f32 {
    7.0
}

fn default_seed() -> u64 {
    42
}

fn default_image_count() -> usize {
    1
}

fn default_max_seed() -> u64 {
    u32::MAX as u64
}

fn default_repo_id() -> String {
    "Tongyi-MAI/Z-Image-Turbo".to_string()
}

impl Default for PaintConfig {
    fn default() -> Self {
        Self {
            checkpoint: None,
            display_every: default_display_every(),
            disable_safety: false,
            use_gpu: default_use_gpu(),
            width: default_size(),
            height: default_size(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            steps: default_steps(),
            guidance_scale: default_guidance_scale(),
            seed: default_seed(),
            image_count: default_image_count(),
            max_seed: default_max_seed(),
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            hf_token: None,
            repo_id: default_repo_id(),
        }
    }
}

impl Config {
    /// Get the base directory: ~/.config/hyperpaint/
    pub fn base_dir() -> Result<PathBuf> {
        let home = std::env::var("HOME")
            .map(PathBuf::from)
            .or_else(|_| std::env::var("USERPROFILE").map(PathBuf::from))
            .map_err(|_| anyhow::anyhow!("Could not determine home directory"))?;
        Ok(home.join(".config").join("hyperpaint"))
    }

    /// Load config from default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load config from a file, falling back to defaults when it is missing
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save config to default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Get the config file path: ~/.config/hyperpaint/config.toml
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("config.toml"))
    }

    /// Get the registry file path: ~/.config/hyperpaint/registry.json
    pub fn registry_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("registry.json"))
    }

    /// Get the checkpoints directory from config
    pub fn checkpoints_dir(&self) -> PathBuf {
        self.models.storage_path.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("config.toml")).unwrap();

        assert_eq!(config.paint.display_every, 3);
        assert!(!config.paint.disable_safety);
        assert_eq!(config.generation.steps, 10);
        assert_eq!(config.generation.guidance_scale, 7.0);
        assert_eq!(config.generation.seed, 42);
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[paint]\ndisplay_every = 5\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.paint.display_every, 5);
        assert!(config.paint.use_gpu);
        assert_eq!(config.generation.image_count, 1);
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.paint.checkpoint = Some("sd-v1-4".to_string());
        config.generation.max_seed = 1000;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.paint.checkpoint.as_deref(), Some("sd-v1-4"));
        assert_eq!(loaded.generation.max_seed, 1000);
    }
}
