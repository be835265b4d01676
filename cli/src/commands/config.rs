use anyhow::Result;
use hyperpaint_core::Config;

pub fn execute(key: Option<&str>, value: Option<&str>) -> Result<()> {
    let mut config = Config::load()?;

    match (key, value) {
        // Show all config
        (None, None) => {
            println!("Configuration file: {:?}\n", Config::config_path()?);
            println!("[paint]");
            println!(
                "  checkpoint = {}",
                config.paint.checkpoint.as_deref().unwrap_or("(default)")
            );
            println!("  display_every = {}", config.paint.display_every);
            println!("  disable_safety = {}", config.paint.disable_safety);
            println!("  use_gpu = {}", config.paint.use_gpu);
            println!("  width = {}", config.paint.width);
            println!("  height = {}", config.paint.height);
            println!();
            println!("[generation]");
            println!("  steps = {}", config.generation.steps);
            println!("  guidance_scale = {}", config.generation.guidance_scale);
            println!("  seed = {}", config.generation.seed);
            println!("  image_count = {}", config.generation.image_count);
            println!("  max_seed = {}", config.generation.max_seed);
            println!();
            println!("[models]");
            println!("  storage_path = {:?}", config.models.storage_path.display().to_string());
            println!(
                "  hf_token = {}",
                config.models.hf_token.as_ref().map(|_| "***").unwrap_or("(not set)")
            );
            println!("  repo_id = \"{}\"", config.models.repo_id);
        }

        (Some(key), None) => {
            let value = get_config_value(&config, key)?;
            println!("{}", value);
        }

        (Some(key), Some(value)) => {
            set_config_value(&mut config, key, value)?;
            config.save()?;
            println!("Set {} = {}", key, value);
        }

        (None, Some(_)) => anyhow::bail!("A value needs a key"),
    }

    Ok(())
}

fn get_config_value(config: &Config, key: &str) -> Result<String> {
    match key {
        "paint.checkpoint" => Ok(config.paint.checkpoint.clone().unwrap_or_default()),
        "paint.display_every" => Ok(config.paint.display_every.to_string()),
        "paint.disable_safety" => Ok(config.paint.disable_safety.to_string()),
        "paint.use_gpu" => Ok(config.paint.use_gpu.to_string()),
        "paint.width" => Ok(config.paint.width.to_string()),
        "paint.height" => Ok(config.paint.height.to_string()),
        "generation.steps" => Ok(config.generation.steps.to_string()),
        "generation.guidance_scale" => Ok(config.generation.guidance_scale.to_string()),
        "generation.seed" => Ok(config.generation.seed.to_string()),
        "generation.image_count" => Ok(config.generation.image_count.to_string()),
        "generation.max_seed" => Ok(config.generation.max_seed.to_string()),
        "models.storage_path" => Ok(config.models.storage_path.display().to_string()),
        "models.hf_token" => Ok(config
            .models
            .hf_token
            .as_ref()
            .map(|_| "***".to_string())
            .unwrap_or_default()),
        "models.repo_id" => Ok(config.models.repo_id.clone()),
        _ => anyhow::bail!("Unknown config key: {}", key),
    }
}

fn set_config_value(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "paint.checkpoint" => {
            config.paint.checkpoint = if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            }
        }
        "paint.display_every" => config.paint.display_every = value.parse()?,
        "paint.disable_safety" => config.paint.disable_safety = value.parse()?,
        "paint.use_gpu" => config.paint.use_gpu = value.parse()?,
        "paint.width" => config.paint.width = value.parse()?,
        "paint.height" => config.paint.height = value.parse()?,
        "generation.steps" => config.generation.steps = value.parse()?,
        "generation.guidance_scale" => config.generation.guidance_scale = value.parse()?,
        "generation.seed" => config.generation.seed = value.parse()?,
        "generation.image_count" => config.generation.image_count = value.parse()?,
        "generation.max_seed" => config.generation.max_seed = value.parse()?,
        "models.storage_path" => config.models.storage_path = value.into(),
        "models.hf_token" => {
            config.models.hf_token = if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            }
        }
        "models.repo_id" => config.models.repo_id = value.to_string(),
        _ => anyhow::bail!("Unknown config key: {}", key),
    }
    Ok(())
}
