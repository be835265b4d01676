mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hyperpaint")]
#[command(author, version, about = "Generate images from text prompts on local hardware", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate images from a text prompt
    Generate(commands::generate::GenerateArgs),

    /// Pull a checkpoint from HuggingFace
    Pull {
        /// Repository identifier (defaults to `models.repo_id`)
        repo: Option<String>,

        /// Sub-folder of the repository to download (e.g. "original/compiled")
        #[arg(short, long)]
        variant: Option<String>,

        /// Download into this directory instead of `models.storage_path`
        #[arg(long)]
        storage: Option<PathBuf>,
    },

    /// List pulled checkpoints
    #[command(alias = "ls")]
    Checkpoints,

    /// View or set configuration
    Config {
        /// Config key (e.g., "paint.display_every", "generation.steps")
        key: Option<String>,

        /// Value to set (if omitted, shows current value)
        value: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Generate(args) => {
            commands::generate::execute(args).await?;
        }
        Commands::Pull {
            repo,
            variant,
            storage,
        } => {
            commands::pull::execute(repo.as_deref(), variant.as_deref(), storage).await?;
        }
        Commands::Checkpoints => {
            commands::checkpoints::execute()?;
        }
        Commands::Config { key, value } => {
            commands::config::execute(key.as_deref(), value.as_deref())?;
        }
    }

    Ok(())
}
