use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::models::CheckpointInfo;

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct CheckpointRegistry {
    checkpoints: HashMap<String, CheckpointInfo>,
    #[serde(skip)]
    registry_path: PathBuf,
}

impl CheckpointRegistry {
    pub fn load() -> Result<Self> {
        let base_dir = Config::base_dir()?;
        fs::create_dir_all(&base_dir)?;
        Self::load_from(&Config::registry_path()?)
    }

    pub fn load_from(registry_path: &Path) -> Result<Self> {
        let mut registry = if registry_path.exists() {
            let content = fs::read_to_string(registry_path)?;
            serde_json::from_str(&content)?
        } else {
            CheckpointRegistry::default()
        };

        registry.registry_path = registry_path.to_path_buf();
        Ok(registry)
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&self)?;
        fs::write(&self.registry_path, content)?;
        Ok(())
    }

    pub fn add(&mut self, checkpoint: CheckpointInfo) -> Result<()> {
        self.checkpoints.insert(checkpoint.name.clone(), checkpoint);
        self.save()?;
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<Option<CheckpointInfo>> {
        let removed = self.checkpoints.remove(name);
        self.save()?;
        Ok(removed)
    }

    pub fn get(&self, name: &str) -> Option<&CheckpointInfo> {
        self.checkpoints.get(name)
    }

    pub fn list(&self) -> Vec<&CheckpointInfo> {
        let mut list: Vec<_> = self.checkpoints.values().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Resolve a checkpoint reference: a registered name wins over a path.
    ///
    /// The returned path is not checked for existence; a missing checkpoint is
    /// reported by the painter session when it tries to build the pipeline.
    pub fn resolve(&self, reference: &str) -> PathBuf {
        match self.get(reference) {
            Some(info) => info.path.clone(),
            None => PathBuf::from(reference),
        }
    }
}
