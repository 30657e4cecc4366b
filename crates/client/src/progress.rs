//! Cargo-style progress output for hubsync
//!
//! Displays progress in the familiar cargo format:
//! ```text
//!    Scanning 952 files (67.44 MiB)
//!     Syncing [===========>             ] 500/812 notes/a.md
//!  Downloaded notes/a.md (1.20 KiB)
//!      Synced 812 files in 3.2s
//! ```

use std::io::Write as _;
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Instant;

use hubsync_core::SyncError;
use hubsync_core::reconcile::DiffPayload;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::client::{Direction, SyncObserver, SyncReport};

/// Status verbs for cargo-style output (right-aligned to 12 chars)
struct Status;

impl Status {
    const SCANNING: &str = "Scanning";
    const DOWNLOADED: &str = "Downloaded";
    const UPLOADED: &str = "Uploaded";
    const FAILED: &str = "Failed";
    const SYNCED: &str = "Synced";
    const UP_TO_DATE: &str = "Up to date";
}

/// Shared draw target so log lines and bars do not tear each other
fn multi() -> &'static MultiProgress {
    static MULTI: OnceLock<MultiProgress> = OnceLock::new();
    MULTI.get_or_init(MultiProgress::new)
}

/// Print a cargo-style status line
fn print_status(status: &str, message: &str, style: &console::Style) {
    let line = format!("{:>12} {}", style.apply_to(status), message);
    multi().suspend(|| {
        let _ = writeln!(console::Term::stderr(), "{line}");
    });
}

fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

/// `tracing` writer that prints above any active progress bar
#[derive(Clone, Copy, Default)]
pub struct ProgressWriter;

impl std::io::Write for ProgressWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        multi().suspend(|| std::io::stderr().write_all(buf))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for ProgressWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        *self
    }
}

/// Progress tracker for a reconciliation pass
pub struct SyncProgress {
    start: Mutex<Instant>,
    bar: Mutex<Option<ProgressBar>>,
}

impl SyncProgress {
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: Mutex::new(Instant::now()),
            bar: Mutex::new(None),
        }
    }

    /// Show the "Scanning N files" line
    pub fn scanning(&self, files: usize, total_bytes: u64) {
        print_status(
            Status::SCANNING,
            &format!("{files} files ({})", format_size(total_bytes)),
            &console::Style::new().green().bold(),
        );
    }

    fn file_sync_bar(total_files: u64) -> ProgressBar {
        let pb = multi().add(ProgressBar::new(total_files));
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} {msg:>12} [{bar:25.cyan/dim}] {pos}/{len} {prefix:.dim}")
        {
            pb.set_style(style.progress_chars("=> "));
        }
        pb.set_message("Syncing");
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        pb
    }

    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        if let Some(bar) = self
            .bar
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            f(bar);
        }
    }

    fn elapsed(&self) -> String {
        let elapsed = self
            .start
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed();
        if elapsed.as_secs() >= 1 {
            format!("{:.2}s", elapsed.as_secs_f64())
        } else {
            format!("{}ms", elapsed.as_millis())
        }
    }
}

impl Default for SyncProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncObserver for SyncProgress {
    fn scanned(&self, files: usize, total_bytes: u64) {
        *self.start.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
        self.scanning(files, total_bytes);
    }

    fn planned(&self, plan: &DiffPayload) {
        if plan.is_empty() {
            return;
        }
        let bar = Self::file_sync_bar(plan.len() as u64);
        *self.bar.lock().unwrap_or_else(PoisonError::into_inner) = Some(bar);
    }

    fn transferred(&self, path: &str, direction: Direction, bytes: u64) {
        let verb = match direction {
            Direction::Download => Status::DOWNLOADED,
            Direction::Upload => Status::UPLOADED,
        };
        print_status(
            verb,
            &format!("{path} ({})", format_size(bytes)),
            &console::Style::new().cyan().bold(),
        );
        self.with_bar(|bar| {
            bar.set_prefix(path.to_string());
            bar.inc(1);
        });
    }

    fn failed(&self, path: &str, _direction: Direction, error: &SyncError) {
        print_status(
            Status::FAILED,
            &format!("{path}: {error}"),
            &console::Style::new().red().bold(),
        );
        self.with_bar(|bar| bar.inc(1));
    }

    fn finished(&self, report: &SyncReport) {
        if let Some(bar) = self.bar.lock().unwrap_or_else(PoisonError::into_inner).take() {
            bar.finish_and_clear();
        }

        let elapsed = self.elapsed();
        let done = report.downloaded.len() + report.uploaded.len();
        if done == 0 && report.failed.is_empty() {
            print_status(
                Status::UP_TO_DATE,
                &format!("checked in {elapsed}"),
                &console::Style::new().green().bold(),
            );
        } else if report.failed.is_empty() {
            print_status(
                Status::SYNCED,
                &format!(
                    "{done} files ({} down, {} up, {}) in {elapsed}",
                    report.downloaded.len(),
                    report.uploaded.len(),
                    format_size(report.bytes)
                ),
                &console::Style::new().green().bold(),
            );
        } else {
            print_status(
                "Finished",
                &format!(
                    "{done} successful, {} failed in {elapsed}",
                    report.failed.len()
                ),
                &console::Style::new().yellow().bold(),
            );
        }
    }
}
