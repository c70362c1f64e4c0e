use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use tally_node::{init_logging, NodeConfig, TallyNode};

#[derive(Parser)]
#[command(name = "tally-node", about = "Ledger and wagered settlement engine", version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Write the default configuration to the given path and exit
    #[arg(long)]
    init_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(path) = cli.init_config {
        NodeConfig::default().save_to_file(&path)?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => NodeConfig::from_file(path)?,
        None => NodeConfig::default(),
    };
    config.apply_env_overrides();

    init_logging(&config.logging, cli.verbose)?;

    let node = TallyNode::new(config).await?;
    info!(
        open_rooms = node.arena().open_rooms().await.len(),
        "Node running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("🛑 Shutting down");
    Ok(())
}
