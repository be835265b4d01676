use anyhow::Result;
use hyperpaint_core::CheckpointRegistry;

pub fn execute() -> Result<()> {
    let registry = CheckpointRegistry::load()?;
    let checkpoints = registry.list();

    if checkpoints.is_empty() {
        println!("No checkpoints installed.");
        println!("\nRun `hyperpaint pull <repo>` to download one.");
        return Ok(());
    }

    println!("{:<48} {:<40} {:<10} {}", "NAME", "SOURCE", "SIZE", "DOWNLOADED");
    println!("{}", "-".repeat(110));

    for checkpoint in checkpoints {
        let size = format!("{:.2} GB", checkpoint.size_bytes as f64 / 1_073_741_824.0);
        let date = checkpoint.downloaded_at.format("%Y-%m-%d").to_string();
        println!(
            "{:<48} {:<40} {:<10} {}",
            checkpoint.name,
            checkpoint.source.describe(),
            size,
            date
        );
    }

    Ok(())
}
