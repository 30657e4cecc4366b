//! Best-effort directory scanning via the `ignore` crate

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use ignore::WalkBuilder;
use ignore::overrides::{Override, OverrideBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::CONFIG_FILE;
use crate::error::{Result, SyncError};
use crate::hash::ContentHash;

/// Suffix of a write-in-progress sibling file
pub const TEMP_SUFFIX: &str = ".tmp";

/// Content state of one file at scan time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Relative path from the store root, `/`-separated
    pub path: String,
    /// Content hash (BLAKE3)
    pub hash: ContentHash,
    /// Modification time
    pub modified: DateTime<Utc>,
    /// File size in bytes
    pub size: u64,
}

impl FileRecord {
    /// Two records describe the same content iff their hashes match
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

/// Result of a scan: the records found plus how many files were skipped
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub records: Vec<FileRecord>,
    pub skipped: usize,
}

/// Scanner for directory trees
///
/// Every regular file is included except temp siblings, the `.git`
/// directory, the root's own config file and any configured ignore globs.
pub struct Scanner {
    root: PathBuf,
    /// Extra glob patterns to exclude
    extra_ignores: Vec<String>,
}

impl Scanner {
    /// Create a new scanner for the given root directory
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extra_ignores: Vec::new(),
        }
    }

    /// Add an extra ignore glob
    #[must_use]
    pub fn ignore(mut self, pattern: impl Into<String>) -> Self {
        self.extra_ignores.push(pattern.into());
        self
    }

    /// Build the override matcher excluding temp files and ignore globs
    fn excludes(&self) -> Result<Override> {
        let mut overrides = OverrideBuilder::new(&self.root);
        let mut add = |glob: &str| {
            overrides
                .add(&format!("!{glob}"))
                .map(|_| ())
                .map_err(|e| SyncError::Protocol(format!("bad ignore pattern {glob:?}: {e}")))
        };
        add(&format!("*{TEMP_SUFFIX}"))?;
        // Each side keeps its own settings
        add(&format!("/{CONFIG_FILE}"))?;
        for pattern in &self.extra_ignores {
            add(pattern)?;
        }
        overrides
            .build()
            .map_err(|e| SyncError::Protocol(format!("bad ignore patterns: {e}")))
    }

    /// Create a configured walk builder
    fn walk_builder(&self) -> Result<WalkBuilder> {
        let mut builder = WalkBuilder::new(&self.root);
        builder
            .hidden(false)
            .ignore(false)
            .parents(false)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .require_git(false)
            .overrides(self.excludes()?)
            .filter_entry(|e| e.file_name() != ".git");
        Ok(builder)
    }

    /// Scan the directory and return every file record
    ///
    /// Files that disappear or cannot be read mid-scan are skipped and
    /// counted rather than failing the whole scan.
    pub fn scan(&self) -> Result<ScanOutcome> {
        let mut outcome = ScanOutcome::default();

        for result in self.walk_builder()?.build() {
            let entry = match result {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("Skipping unreadable entry: {e}");
                    outcome.skipped += 1;
                    continue;
                }
            };

            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }

            match self.record(entry.path()) {
                Ok(record) => outcome.records.push(record),
                Err(e) => {
                    debug!("Skipping {}: {e}", entry.path().display());
                    outcome.skipped += 1;
                }
            }
        }

        // Sort for deterministic ordering
        outcome.records.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(outcome)
    }

    /// Build the record for one absolute file path
    fn record(&self, path: &Path) -> Result<FileRecord> {
        let metadata = std::fs::metadata(path).map_err(|e| SyncError::io(path, e))?;
        let modified = metadata.modified().map_err(|e| SyncError::io(path, e))?;
        let hash = ContentHash::from_file(path)?;
        let relative = path
            .strip_prefix(&self.root)
            .map_err(|_| SyncError::InvalidPath(path.display().to_string()))?;

        Ok(FileRecord {
            path: wire_path(relative),
            hash,
            modified: modified.into(),
            size: metadata.len(),
        })
    }

    /// List every directory under the root, the root included
    pub fn directories(&self) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();

        for result in self.walk_builder()?.build() {
            let Ok(entry) = result else { continue };
            if entry.file_type().is_some_and(|t| t.is_dir()) {
                dirs.push(entry.into_path());
            }
        }

        dirs.sort();
        Ok(dirs)
    }
}

/// Render a relative path with `/` separators regardless of platform
#[must_use]
pub fn wire_path(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn paths(outcome: &ScanOutcome) -> Vec<&str> {
        outcome.records.iter().map(|r| r.path.as_str()).collect()
    }

    #[test]
    fn test_scan_simple_directory() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("file1.txt"), "hello").unwrap();
        fs::write(dir.path().join("file2.txt"), "world").unwrap();

        let outcome = Scanner::new(dir.path()).scan().unwrap();

        assert_eq!(paths(&outcome), vec!["file1.txt", "file2.txt"]);
        assert_eq!(outcome.skipped, 0);
        assert_eq!(outcome.records[0].hash, ContentHash::from_bytes(b"hello"));
        assert_eq!(outcome.records[0].size, 5);
    }

    #[test]
    fn test_scan_nested_uses_forward_slashes() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("sub/dir")).unwrap();
        fs::write(dir.path().join("root.txt"), "root").unwrap();
        fs::write(dir.path().join("sub/dir/deep.txt"), "deep").unwrap();

        let outcome = Scanner::new(dir.path()).scan().unwrap();

        assert_eq!(paths(&outcome), vec!["root.txt", "sub/dir/deep.txt"]);
    }

    #[test]
    fn test_scan_includes_gitignored_and_hidden_files() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/HEAD"), "ref").unwrap();
        fs::write(dir.path().join(".gitignore"), "*.log\n").unwrap();
        fs::write(dir.path().join("build.log"), "log").unwrap();
        fs::create_dir(dir.path().join(".obsidian")).unwrap();
        fs::write(dir.path().join(".obsidian/app.json"), "{}").unwrap();

        let outcome = Scanner::new(dir.path()).scan().unwrap();

        assert_eq!(
            paths(&outcome),
            vec![".gitignore", ".obsidian/app.json", "build.log"]
        );
    }

    #[test]
    fn test_scan_skips_temp_siblings_and_ignores() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.md"), "a").unwrap();
        fs::write(dir.path().join("a.md.tmp"), "partial").unwrap();
        fs::write(dir.path().join("cache.bin"), "bin").unwrap();

        let outcome = Scanner::new(dir.path()).ignore("*.bin").scan().unwrap();

        assert_eq!(paths(&outcome), vec!["a.md"]);
    }

    #[test]
    fn test_scan_skips_root_config_file() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("notes")).unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "chunk_size = 4").unwrap();
        fs::write(dir.path().join("notes").join(CONFIG_FILE), "just a note").unwrap();

        let outcome = Scanner::new(dir.path()).scan().unwrap();

        assert_eq!(paths(&outcome), vec!["notes/.hubsync.toml"]);
    }

    #[test]
    fn test_scan_twice_is_identical() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("notes")).unwrap();
        fs::write(dir.path().join("notes/a.md"), "hello").unwrap();
        fs::write(dir.path().join("b.md"), "b").unwrap();

        let scanner = Scanner::new(dir.path());
        let first = scanner.scan().unwrap();
        let second = scanner.scan().unwrap();

        assert_eq!(first.records, second.records);
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_file_is_counted_not_fatal() {
        use std::os::unix::fs::PermissionsExt as _;

        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("ok.txt"), "ok").unwrap();
        let locked = dir.path().join("locked.txt");
        fs::write(&locked, "secret").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        // Root ignores permission bits, in which case nothing is skipped
        if fs::File::open(&locked).is_ok() {
            return;
        }

        let outcome = Scanner::new(dir.path()).scan().unwrap();
        assert_eq!(paths(&outcome), vec!["ok.txt"]);
        assert_eq!(outcome.skipped, 1);
    }

    #[test]
    fn test_directories_include_root_and_children() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("a/file.txt"), "x").unwrap();

        let dirs = Scanner::new(dir.path()).directories().unwrap();

        assert_eq!(
            dirs,
            vec![
                dir.path().to_path_buf(),
                dir.path().join("a"),
                dir.path().join("a/b"),
            ]
        );
    }
}
