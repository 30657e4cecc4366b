//! Per-session debug log for the hubsync client
//!
//! Every run writes a trace log to `hubsync-{session_id}.log` in
//! `$HUBSYNC_LOG_DIR` (or the system temp dir), while the console only
//! shows info (or debug with `-v`) above the progress bars.

use std::path::PathBuf;

use tracing_subscriber::Layer as _;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use uuid::Uuid;

use crate::progress::ProgressWriter;

/// Crates traced into the file log unless `RUST_LOG` says otherwise
const FILE_FILTER: &str =
    "warn,hubsync=trace,hubsync_client=trace,hubsync_core=trace,hubsync_transport=trace";

/// Keeps the log writer alive; drop it last
pub struct LogSession {
    pub id: Uuid,
    pub log_path: PathBuf,
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

fn log_dir() -> PathBuf {
    std::env::var_os("HUBSYNC_LOG_DIR").map_or_else(std::env::temp_dir, PathBuf::from)
}

/// Install the file and console layers
pub fn init(verbose: bool) -> LogSession {
    let id = Uuid::new_v4();
    let dir = log_dir();
    let file_name = format!("hubsync-{id}.log");
    let log_path = dir.join(&file_name);

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(&dir, &file_name));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(FILE_FILTER)),
        );

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(ProgressWriter)
        .with_target(false)
        .with_filter(if verbose {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .init();

    LogSession {
        id,
        log_path,
        _guard: guard,
    }
}
