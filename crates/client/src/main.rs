//! hubsync: keep a local directory in sync with a hubsync hub
//!
//! - BLAKE3 content hashing, last-writer-wins reconciliation
//! - Chunked, resumable transfers
//! - File watching with debouncing
//! - Automatic redial with backoff

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::builder::styling::{AnsiColor, Effects};
use clap::{Parser, Subcommand, builder::Styles};
use color_eyre::Result;
use tracing::info;

use hubsync_client::{Client, SyncProgress, debug_log, resolve_identity};
use hubsync_core::{Store, SyncConfig};

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

#[derive(Parser)]
#[command(name = "hubsync")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Keep a local directory in sync with a hubsync hub")]
#[command(long_about = r#"
hubsync mirrors a directory tree through a central hub.

Every client pushes its edits to the hub and receives edits made by the
others. When both sides changed a file, the most recently modified copy wins.

Examples:
  hubsync --hub hub.lan:9527 --repo ~/notes          Sync and keep watching
  hubsync --hub hub.lan:9527 --repo ~/notes sync     Reconcile once and exit
  hubsync --repo ~/notes scan --format json          Print the local snapshot
"#)]
struct Cli {
    /// Hub address
    #[arg(long, default_value = "localhost:9527", global = true)]
    hub: String,

    /// Local repository path
    #[arg(long, default_value = ".", global = true)]
    repo: PathBuf,

    /// Client identity (defaults to the host name)
    #[arg(long, global = true)]
    id: Option<String>,

    /// Config file (defaults to <repo>/.hubsync.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile, then watch and continuously sync changes (default)
    Watch,

    /// Reconcile once and exit
    Sync,

    /// Scan the repository and print its snapshot
    Scan {
        /// Output format (json, summary)
        #[arg(short, long, default_value = "summary")]
        format: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let session = debug_log::init(cli.verbose);
    info!("Debug log: {}", session.log_path.display());

    let config = match &cli.config {
        Some(path) => SyncConfig::from_file(path)?,
        None => SyncConfig::load(&cli.repo)?,
    };

    match cli.command.unwrap_or(Commands::Watch) {
        Commands::Scan { format } => scan_command(&cli.repo, &config, &format)?,
        Commands::Sync => {
            let client = client(&cli.hub, &cli.repo, cli.id.as_deref(), config)?;
            let (_session, _inbound, report) = client.connect_and_sync().await?;
            if !report.failed.is_empty() {
                color_eyre::eyre::bail!("{} transfers failed", report.failed.len());
            }
        }
        Commands::Watch => {
            let client = client(&cli.hub, &cli.repo, cli.id.as_deref(), config)?;
            client.run().await?;
        }
    }

    drop(session);
    Ok(())
}

fn client(hub: &str, repo: &Path, id: Option<&str>, config: SyncConfig) -> Result<Client> {
    let identity = resolve_identity(id);
    info!("Syncing {} with {hub} as {identity}", repo.display());
    let client =
        Client::new(hub, repo, &identity, config)?.with_observer(Arc::new(SyncProgress::new()));
    Ok(client)
}

fn scan_command(repo: &Path, config: &SyncConfig, format: &str) -> Result<()> {
    info!("Scanning {}...", repo.display());

    let store = Store::open(repo)?.with_ignores(config.ignore.clone());
    let report = store.scan_all()?;
    let snapshot = report.snapshot;

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&snapshot.to_wire())?;
            println!("{json}");
        }
        _ => {
            eprintln!("Files: {}", snapshot.len());
            eprintln!(
                "Total size: {}",
                humansize::format_size(snapshot.total_size(), humansize::BINARY)
            );
            if report.skipped > 0 {
                eprintln!("Skipped: {}", report.skipped);
            }

            if snapshot.len() <= 20 {
                eprintln!("\nFiles:");
                for (path, record) in &snapshot.files {
                    eprintln!("  {path} ({} bytes, {})", record.size, record.hash);
                }
            }
        }
    }

    Ok(())
}
