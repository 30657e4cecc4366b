//! Content store: all durable file I/O for one root directory
//!
//! Writes land in a `path.tmp` sibling (`path.<tag>.tmp` when several
//! writers may stage the same path) and become visible through a single
//! rename, so readers see either the old or the new file.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::hash::ContentHash;
use crate::scan::{Scanner, TEMP_SUFFIX};
use crate::snapshot::Snapshot;

/// Bytes read from a file range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub data: Vec<u8>,
    /// Fewer bytes remained than were asked for
    pub eof: bool,
    /// Length of the whole file at read time
    pub total_size: u64,
}

/// Result of a full-tree scan
#[derive(Debug, Default)]
pub struct ScanReport {
    pub snapshot: Snapshot,
    /// Files that could not be read and were left out
    pub skipped: usize,
}

/// File store rooted at one directory
pub struct Store {
    root: PathBuf,
    ignores: Vec<String>,
    /// One write lock per relative path
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Store {
    /// Open a store, creating the root directory if needed
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| SyncError::io(&root, e))?;
        Ok(Self {
            root,
            ignores: Vec::new(),
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Exclude extra glob patterns from scans
    #[must_use]
    pub fn with_ignores(mut self, patterns: impl IntoIterator<Item = String>) -> Self {
        self.ignores.extend(patterns);
        self
    }

    /// Root directory of this store
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a relative `/`-separated path to an absolute one under the root
    ///
    /// Rejects empty paths, absolute paths and `..` components.
    pub fn resolve(&self, rel: &str) -> Result<PathBuf> {
        let candidate = Path::new(rel);
        let mut resolved = self.root.clone();
        let mut parts = 0;

        for component in candidate.components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    parts += 1;
                }
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(SyncError::InvalidPath(rel.to_string()));
                }
            }
        }

        if parts == 0 {
            return Err(SyncError::InvalidPath(rel.to_string()));
        }
        Ok(resolved)
    }

    /// Relative `/`-separated path for an absolute path under the root
    #[must_use]
    pub fn relative(&self, absolute: &Path) -> Option<String> {
        let rel = absolute.strip_prefix(&self.root).ok()?;
        let rel = crate::scan::wire_path(rel);
        (!rel.is_empty()).then_some(rel)
    }

    /// Temp sibling for `rel`; a tag keeps concurrent transfers apart
    fn temp_path(&self, rel: &str, tag: Option<&str>) -> Result<PathBuf> {
        let mut path = self.resolve(rel)?.into_os_string();
        if let Some(tag) = tag {
            path.push(".");
            path.push(tag);
        }
        path.push(TEMP_SUFFIX);
        Ok(PathBuf::from(path))
    }

    /// Run `work` holding the write lock for `rel`
    ///
    /// The lock entry is dropped again once nobody else holds it.
    fn with_path_lock<T>(&self, rel: &str, work: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(rel.to_string()).or_default())
        };
        let result = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            work()
        };
        drop(lock);

        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(rel).is_some_and(|entry| Arc::strong_count(entry) == 1) {
            locks.remove(rel);
        }
        result
    }

    /// Hash the committed file at `rel`
    pub fn hash(&self, rel: &str) -> Result<ContentHash> {
        ContentHash::from_file(&self.resolve(rel)?)
    }

    /// Hash the in-progress temp sibling of `rel`
    pub fn hash_pending(&self, rel: &str) -> Result<ContentHash> {
        ContentHash::from_file(&self.temp_path(rel, None)?)
    }

    /// Write `bytes` at `offset` of the temp sibling, creating it if absent
    ///
    /// Writes to the same path are serialized.
    pub fn write_chunk(&self, rel: &str, offset: u64, bytes: &[u8]) -> Result<()> {
        self.write_staged(rel, None, offset, bytes)
    }

    /// Like [`Store::write_chunk`], into the temp sibling owned by `tag`
    pub fn write_staged(&self, rel: &str, tag: Option<&str>, offset: u64, bytes: &[u8]) -> Result<()> {
        let tmp = self.temp_path(rel, tag)?;
        self.with_path_lock(rel, || {
            if let Some(parent) = tmp.parent() {
                std::fs::create_dir_all(parent).map_err(|e| SyncError::io(parent, e))?;
            }

            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&tmp)
                .map_err(|e| SyncError::io(&tmp, e))?;
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| SyncError::io(&tmp, e))?;
            file.write_all(bytes).map_err(|e| SyncError::io(&tmp, e))?;
            Ok(())
        })
    }

    /// Rename the temp sibling over the final path
    pub fn commit(&self, rel: &str) -> Result<()> {
        self.with_path_lock(rel, || self.rename_into_place(rel, None))
    }

    /// Trim the temp sibling to `total_size` then commit it
    ///
    /// Drops any tail left behind by an earlier, longer transfer.
    pub fn commit_sized(&self, rel: &str, total_size: u64) -> Result<()> {
        self.commit_staged(rel, None, total_size)
    }

    /// Like [`Store::commit_sized`], for the temp sibling owned by `tag`
    pub fn commit_staged(&self, rel: &str, tag: Option<&str>, total_size: u64) -> Result<()> {
        let tmp = self.temp_path(rel, tag)?;
        self.with_path_lock(rel, || {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&tmp)
                .map_err(|e| SyncError::io(&tmp, e))?;
            file.set_len(total_size)
                .map_err(|e| SyncError::io(&tmp, e))?;
            file.sync_all().map_err(|e| SyncError::io(&tmp, e))?;
            drop(file);

            self.rename_into_place(rel, tag)
        })
    }

    fn rename_into_place(&self, rel: &str, tag: Option<&str>) -> Result<()> {
        let tmp = self.temp_path(rel, tag)?;
        let dest = self.resolve(rel)?;
        std::fs::rename(&tmp, &dest).map_err(|e| SyncError::io(&tmp, e))?;
        debug!("Committed {rel}");
        Ok(())
    }

    /// Remove a leftover temp sibling, ignoring a missing one
    pub fn discard(&self, rel: &str) -> Result<()> {
        self.discard_staged(rel, None)
    }

    /// Like [`Store::discard`], for the temp sibling owned by `tag`
    pub fn discard_staged(&self, rel: &str, tag: Option<&str>) -> Result<()> {
        let tmp = self.temp_path(rel, tag)?;
        self.with_path_lock(rel, || match std::fs::remove_file(&tmp) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::io(&tmp, e)),
        })
    }

    /// Read up to `size` bytes at `offset`
    ///
    /// A short read at the end of the file is reported through `eof`, not
    /// as an error.
    pub fn read_chunk(&self, rel: &str, offset: u64, size: u64) -> Result<Chunk> {
        let path = self.resolve(rel)?;
        let mut file = File::open(&path).map_err(|e| SyncError::io(&path, e))?;
        let total_size = file
            .metadata()
            .map_err(|e| SyncError::io(&path, e))?
            .len();

        file.seek(SeekFrom::Start(offset))
            .map_err(|e| SyncError::io(&path, e))?;

        let mut data = Vec::new();
        file.take(size)
            .read_to_end(&mut data)
            .map_err(|e| SyncError::io(&path, e))?;

        let eof = (data.len() as u64) < size;
        Ok(Chunk {
            data,
            eof,
            total_size,
        })
    }

    /// Hash every file in the tree
    ///
    /// Unreadable files are skipped and counted.
    pub fn scan_all(&self) -> Result<ScanReport> {
        let outcome = self.scanner().scan()?;
        if outcome.skipped > 0 {
            warn!(
                "Scan of {} skipped {} unreadable entries",
                self.root.display(),
                outcome.skipped
            );
        }
        Ok(ScanReport {
            snapshot: Snapshot::from_records(outcome.records),
            skipped: outcome.skipped,
        })
    }

    /// Every directory in the tree, root included, for watch registration
    pub fn list_directories(&self) -> Result<Vec<PathBuf>> {
        self.scanner().directories()
    }

    fn scanner(&self) -> Scanner {
        self.ignores
            .iter()
            .fold(Scanner::new(&self.root), |scanner, pattern| {
                scanner.ignore(pattern.clone())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use tempfile::TempDir;

    fn store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let (dir, store) = store();
        assert_eq!(
            store.resolve("notes/a.md").unwrap(),
            dir.path().join("notes/a.md")
        );
        assert_eq!(store.resolve("./a.md").unwrap(), dir.path().join("a.md"));

        for bad in ["", ".", "../outside", "notes/../../x", "/etc/passwd"] {
            assert!(
                matches!(store.resolve(bad), Err(SyncError::InvalidPath(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_write_chunks_then_commit() {
        let (dir, store) = store();

        store.write_chunk("notes/a.md", 0, b"hel").unwrap();
        store.write_chunk("notes/a.md", 3, b"lo").unwrap();
        assert!(!dir.path().join("notes/a.md").exists());
        assert!(dir.path().join("notes/a.md.tmp").exists());

        store.commit("notes/a.md").unwrap();

        assert_eq!(fs::read(dir.path().join("notes/a.md")).unwrap(), b"hello");
        assert!(!dir.path().join("notes/a.md.tmp").exists());
        assert_eq!(
            store.hash("notes/a.md").unwrap(),
            ContentHash::from_bytes(b"hello")
        );
    }

    #[test]
    fn test_out_of_order_chunks_extend_file() {
        let (dir, store) = store();

        store.write_chunk("a.bin", 4, b"5678").unwrap();
        store.write_chunk("a.bin", 0, b"1234").unwrap();
        store.commit("a.bin").unwrap();

        assert_eq!(fs::read(dir.path().join("a.bin")).unwrap(), b"12345678");
    }

    #[test]
    fn test_commit_without_temp_fails() {
        let (_dir, store) = store();
        assert!(matches!(store.commit("ghost.md"), Err(SyncError::Io { .. })));
    }

    #[test]
    fn test_commit_sized_trims_stale_tail() {
        let (dir, store) = store();

        // An aborted longer transfer left bytes behind
        store.write_chunk("a.md", 0, b"old content that is long").unwrap();
        store.write_chunk("a.md", 0, b"new").unwrap();
        store.commit_sized("a.md", 3).unwrap();

        assert_eq!(fs::read(dir.path().join("a.md")).unwrap(), b"new");
    }

    #[test]
    fn test_commit_sized_empty_file() {
        let (dir, store) = store();
        store.write_chunk("empty.md", 0, b"").unwrap();
        store.commit_sized("empty.md", 0).unwrap();
        assert_eq!(fs::read(dir.path().join("empty.md")).unwrap(), b"");
    }

    #[test]
    fn test_tagged_transfers_do_not_share_temp() {
        let (dir, store) = store();

        store.write_staged("x.bin", Some("c1"), 0, b"AAAA").unwrap();
        store.write_staged("x.bin", Some("c2"), 0, b"BBB").unwrap();
        store.commit_staged("x.bin", Some("c2"), 3).unwrap();
        assert_eq!(fs::read(dir.path().join("x.bin")).unwrap(), b"BBB");

        store.write_staged("x.bin", Some("c1"), 4, b"aaaa").unwrap();
        store.commit_staged("x.bin", Some("c1"), 8).unwrap();
        assert_eq!(fs::read(dir.path().join("x.bin")).unwrap(), b"AAAAaaaa");

        assert!(!dir.path().join("x.bin.c1.tmp").exists());
        assert_eq!(store.scan_all().unwrap().snapshot.len(), 1);
    }

    #[test]
    fn test_path_locks_are_released() {
        let (_dir, store) = store();

        store.write_chunk("a.md", 0, b"a").unwrap();
        store.commit("a.md").unwrap();
        store.write_staged("b.md", Some("c1"), 0, b"b").unwrap();
        store.discard_staged("b.md", Some("c1")).unwrap();

        assert!(store.locks.lock().unwrap().is_empty());
    }

    #[test]
    fn test_read_chunk_short_read_is_eof() {
        let (dir, store) = store();
        fs::write(dir.path().join("a.md"), b"hello world").unwrap();

        let first = store.read_chunk("a.md", 0, 5).unwrap();
        assert_eq!(first.data, b"hello");
        assert!(!first.eof);
        assert_eq!(first.total_size, 11);

        let last = store.read_chunk("a.md", 6, 100).unwrap();
        assert_eq!(last.data, b"world");
        assert!(last.eof);

        let past = store.read_chunk("a.md", 50, 10).unwrap();
        assert!(past.data.is_empty());
        assert!(past.eof);
    }

    #[test]
    fn test_read_missing_file_is_io_error() {
        let (_dir, store) = store();
        assert!(matches!(
            store.read_chunk("nope.md", 0, 10),
            Err(SyncError::Io { .. })
        ));
    }

    #[test]
    fn test_discard_removes_temp() {
        let (dir, store) = store();
        store.write_chunk("a.md", 0, b"partial").unwrap();
        store.discard("a.md").unwrap();
        assert!(!dir.path().join("a.md.tmp").exists());
        // Discarding twice is fine
        store.discard("a.md").unwrap();
    }

    #[test]
    fn test_scan_all_ignores_pending_writes() {
        let (dir, store) = store();
        fs::write(dir.path().join("done.md"), b"done").unwrap();
        store.write_chunk("pending.md", 0, b"half").unwrap();

        let report = store.scan_all().unwrap();

        assert_eq!(report.snapshot.len(), 1);
        assert!(report.snapshot.get("done.md").is_some());
        assert_eq!(report.skipped, 0);
    }

    #[test]
    fn test_with_ignores_applies_to_scan() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path())
            .unwrap()
            .with_ignores(vec![".trash/**".to_string()]);
        fs::create_dir_all(dir.path().join(".trash")).unwrap();
        fs::write(dir.path().join(".trash/old.md"), b"old").unwrap();
        fs::write(dir.path().join("keep.md"), b"keep").unwrap();

        let report = store.scan_all().unwrap();
        assert_eq!(report.snapshot.files.keys().collect::<Vec<_>>(), vec!["keep.md"]);
    }

    #[test]
    fn test_relative_paths() {
        let (dir, store) = store();
        assert_eq!(
            store.relative(&dir.path().join("notes/a.md")).as_deref(),
            Some("notes/a.md")
        );
        assert_eq!(store.relative(dir.path()), None);
        assert_eq!(store.relative(Path::new("/somewhere/else")), None);
    }

    #[test]
    fn test_readers_never_observe_partial_commit() {
        let (dir, store) = store();
        let store = Arc::new(store);
        let old = vec![b'a'; 256 * 1024];
        let new = vec![b'b'; 256 * 1024];
        fs::write(dir.path().join("big.bin"), &old).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let reader = {
            let path = dir.path().join("big.bin");
            let done = Arc::clone(&done);
            let (old, new) = (old.clone(), new.clone());
            thread::spawn(move || {
                while !done.load(Ordering::SeqCst) {
                    let seen = fs::read(&path).unwrap();
                    assert!(seen == old || seen == new, "observed a partial file");
                }
            })
        };

        for (i, chunk) in new.chunks(16 * 1024).enumerate() {
            store
                .write_chunk("big.bin", (i * 16 * 1024) as u64, chunk)
                .unwrap();
        }
        store.commit_sized("big.bin", new.len() as u64).unwrap();
        done.store(true, Ordering::SeqCst);
        reader.join().unwrap();

        assert_eq!(fs::read(dir.path().join("big.bin")).unwrap(), new);
    }

    #[test]
    fn test_concurrent_writers_same_path() {
        let (dir, store) = store();
        let store = Arc::new(store);

        let handles: Vec<_> = (0u8..8)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let chunk = vec![i; 1024];
                    store
                        .write_chunk("shared.bin", u64::from(i) * 1024, &chunk)
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        store.commit("shared.bin").unwrap();

        let data = fs::read(dir.path().join("shared.bin")).unwrap();
        assert_eq!(data.len(), 8 * 1024);
        for (i, block) in data.chunks(1024).enumerate() {
            assert!(block.iter().all(|&b| usize::from(b) == i));
        }
    }
}
