//! hubsync-hub: central server for hubsync

use std::path::PathBuf;

use clap::Parser;
use clap::builder::Styles;
use clap::builder::styling::{AnsiColor, Effects};
use color_eyre::Result;
use tokio::net::TcpListener;
use tracing::info;

use hubsync_core::SyncConfig;
use hubsync_hub::Hub;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

#[derive(Parser)]
#[command(name = "hubsync-hub")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Central hub holding the authoritative copy of a synced tree")]
struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:9527")]
    listen: String,

    /// Repository root (defaults to ~/hubsync-repo)
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Config file (defaults to <root>/.hubsync.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let root = cli.root.unwrap_or_else(default_root);
    let config = match &cli.config {
        Some(path) => SyncConfig::from_file(path)?,
        None => SyncConfig::load(&root)?,
    };
    info!(
        "Chunk size {} bytes, {} ignore patterns",
        config.chunk_size,
        config.ignore.len()
    );

    let hub = Hub::open(&root, config)?;
    let listener = TcpListener::bind(&cli.listen).await?;
    hub.serve(listener).await?;

    Ok(())
}

fn default_root() -> PathBuf {
    std::env::var_os("HOME")
        .map_or_else(|| PathBuf::from("."), PathBuf::from)
        .join("hubsync-repo")
}
