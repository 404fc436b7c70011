//! Filesystem-backed delivery queue.
//!
//! The store is a set of records split over two directory trees under a
//! root:
//!
//! - `pending/<key>` - persisted, not yet delivered
//! - `seen/<key>` - delivered; kept so the record is never queued again
//!
//! A key lives in at most one of the two trees. Promotion from pending to
//! seen is a single `rename`, so a crash leaves a record either still
//! pending (and delivered again later) or fully seen, never both and never
//! neither. New pending files are written under `staging/` first and
//! renamed into place, so readers never observe a partial file.
//!
//! Several processes may share a root. Writing the same key twice is
//! harmless since the content is derived from the same record.

mod entries;
mod entry;

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::record::{Key, Record};

pub use entries::Entries;

const PENDING_DIR: &str = "pending";
const SEEN_DIR: &str = "seen";
const STAGING_DIR: &str = "staging";

/// Disambiguates staging files created within the same nanosecond.
static STAGE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Errors returned by [`DeliveryStore`] operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `pop` found nothing pending.
    #[error("no pending records")]
    Empty,

    /// The key is not currently pending.
    #[error("'{0}' is not pending")]
    NotFound(Key),

    /// Filesystem failure other than the expected not-found cases.
    #[error("failed to {op} '{}': {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The key and an existing entry are path prefixes of one another, so
    /// both cannot be stored as files.
    #[error("'{key}' collides with '{}'", path.display())]
    Conflict { key: Key, path: PathBuf },

    /// A pending file that cannot be read back as a record.
    #[error("corrupt record at '{}': {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
}

fn io_error<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> StoreError + 'a {
    move |source| StoreError::Io {
        op,
        path: path.to_path_buf(),
        source,
    }
}

/// Whether an I/O error just means "nothing at this path".
///
/// A key whose parent is a regular file (e.g. `a/b` while `a` is a record)
/// reports `NotADirectory` rather than `NotFound`.
pub(crate) fn is_missing(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
    )
}

/// Finds what keeps `key` from being stored as a file under `tree`: a file
/// at one of its ancestors, or a directory at the key itself.
fn conflict_in(tree: &Path, key: &Key) -> Result<Option<PathBuf>, StoreError> {
    let segments: Vec<&str> = key.as_str().split('/').collect();
    let mut path = tree.to_path_buf();
    for (i, segment) in segments.iter().enumerate() {
        path.push(segment);
        let is_key = i + 1 == segments.len();
        match fs::metadata(&path) {
            Ok(meta) if is_key == meta.is_dir() => return Ok(Some(path)),
            Ok(_) => {}
            Err(e) if is_missing(&e) => return Ok(None),
            Err(e) => return Err(io_error("inspect", &path)(e)),
        }
    }
    Ok(None)
}

/// Persistent pending/seen record set rooted at a directory.
#[derive(Debug, Clone)]
pub struct DeliveryStore {
    root: PathBuf,
    pending: PathBuf,
    seen: PathBuf,
    staging: PathBuf,
}

impl DeliveryStore {
    /// Describes a store under `root` without touching the filesystem.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            pending: root.join(PENDING_DIR),
            seen: root.join(SEEN_DIR),
            staging: root.join(STAGING_DIR),
            root,
        }
    }

    /// Creates the store directories under `root` if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self::new(root);
        store.initialize()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ensures the pending, seen and staging directories exist.
    ///
    /// Existing directories are fine; any other failure is returned.
    pub fn initialize(&self) -> Result<(), StoreError> {
        for dir in [&self.pending, &self.seen, &self.staging] {
            fs::create_dir_all(dir).map_err(io_error("create directory", dir))?;
        }
        tracing::debug!(root = %self.root.display(), "Store initialized");
        Ok(())
    }

    /// Whether the record is pending or already seen.
    pub fn contains(&self, record: &Record) -> Result<bool, StoreError> {
        self.contains_key(record.key())
    }

    /// Whether a record file exists for `key` under either tree.
    pub fn contains_key(&self, key: &Key) -> Result<bool, StoreError> {
        for tree in [&self.pending, &self.seen] {
            let path = tree.join(key.to_path());
            match fs::metadata(&path) {
                Ok(meta) if meta.is_file() => return Ok(true),
                Ok(_) => {}
                Err(e) if is_missing(&e) => {}
                Err(e) => return Err(io_error("inspect", &path)(e)),
            }
        }
        Ok(false)
    }

    /// Queues a record unless it is already pending or seen.
    ///
    /// Returns `true` if the record was newly written.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Conflict`] if a pending or seen entry sits on one of
    ///   the key's parents, or the key is a directory of other records.
    ///   Nothing is written.
    /// - [`StoreError::Io`] if the record cannot be written
    pub fn add(&self, record: &Record) -> Result<bool, StoreError> {
        if self.contains(record)? {
            tracing::trace!(key = %record.key(), "Record already known, skipping");
            return Ok(false);
        }
        for tree in [&self.pending, &self.seen] {
            if let Some(path) = conflict_in(tree, record.key())? {
                return Err(StoreError::Conflict {
                    key: record.key().clone(),
                    path,
                });
            }
        }

        let target = self.pending.join(record.key().to_path());
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(io_error("create directory", parent))?;
        }

        let staged = self.stage(&entry::encode(record))?;
        if let Err(e) = fs::rename(&staged, &target) {
            let _ = fs::remove_file(&staged);
            return Err(io_error("move staged record to", &target)(e));
        }

        tracing::debug!(key = %record.key(), url = %record.url(), "Queued record");
        Ok(true)
    }

    /// Adds every record, returning how many were new.
    ///
    /// Records refused with [`StoreError::Conflict`] are logged and skipped.
    pub fn update<'a, I>(&self, records: I) -> Result<usize, StoreError>
    where
        I: IntoIterator<Item = &'a Record>,
    {
        let mut added = 0;
        for record in records {
            if self.add_or_skip(record)? {
                added += 1;
            }
        }
        Ok(added)
    }

    /// [`add`](Self::add), treating a key conflict as "not added".
    pub fn add_or_skip(&self, record: &Record) -> Result<bool, StoreError> {
        match self.add(record) {
            Err(StoreError::Conflict { key, path }) => {
                tracing::warn!(
                    key = %key,
                    conflict = %path.display(),
                    "Skipping record whose key collides with a stored entry"
                );
                Ok(false)
            }
            result => result,
        }
    }

    /// Writes `content` to a fresh file under `staging/` and returns its path.
    fn stage(&self, content: &str) -> Result<PathBuf, StoreError> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let seq = STAGE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = self
            .staging
            .join(format!("{}.{:016x}.{}", std::process::id(), nanos, seq));

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(io_error("create staging file", &path))?;

        let written = file
            .write_all(content.as_bytes())
            .and_then(|()| file.sync_all());
        if let Err(e) = written {
            drop(file);
            let _ = fs::remove_file(&path);
            return Err(io_error("write staging file", &path)(e));
        }

        Ok(path)
    }

    /// Lazily walks the pending tree, one record per file.
    ///
    /// Order follows the filesystem and is only stable within one walk.
    pub fn iter(&self) -> Result<Entries, StoreError> {
        Entries::new(&self.pending)
    }

    /// Number of pending records.
    pub fn count(&self) -> Result<usize, StoreError> {
        self.iter()?.try_fold(0, |n, entry| entry.map(|_| n + 1))
    }

    /// First pending record that [`pop`](Self::pop) would take, left in place.
    pub fn peek(&self) -> Result<Record, StoreError> {
        for entry in self.iter()? {
            let record = entry?;
            if conflict_in(&self.seen, record.key())?.is_none() {
                return Ok(record);
            }
        }
        Err(StoreError::Empty)
    }

    /// Takes the first pending record and marks it seen.
    ///
    /// Records promoted by another process between listing and renaming
    /// are passed over, as are records whose key collides with a seen
    /// entry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Empty`] if nothing is pending.
    pub fn pop(&self) -> Result<Record, StoreError> {
        for entry in self.iter()? {
            let record = entry?;
            match self.remove(&record) {
                Ok(()) => return Ok(record),
                Err(StoreError::NotFound(key)) => {
                    tracing::debug!(key = %key, "Record taken concurrently, trying the next one");
                }
                Err(StoreError::Conflict { key, path }) => {
                    tracing::warn!(
                        key = %key,
                        conflict = %path.display(),
                        "Pending record cannot be marked seen, leaving it pending"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::Empty)
    }

    /// Marks a pending record seen.
    pub fn remove(&self, record: &Record) -> Result<(), StoreError> {
        self.remove_key(record.key())
    }

    /// Moves `pending/<key>` to `seen/<key>` with a single rename.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if `key` is not pending
    /// - [`StoreError::Conflict`] if a seen entry blocks `seen/<key>`
    /// - [`StoreError::Io`] for any other filesystem failure
    pub fn remove_key(&self, key: &Key) -> Result<(), StoreError> {
        let source = self.pending.join(key.to_path());
        let target = self.seen.join(key.to_path());

        // A directory at the key holds other records and must not be moved.
        match fs::symlink_metadata(&source) {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(StoreError::NotFound(key.clone())),
            Err(e) if is_missing(&e) => return Err(StoreError::NotFound(key.clone())),
            Err(e) => return Err(io_error("inspect", &source)(e)),
        }
        if let Some(path) = conflict_in(&self.seen, key)? {
            return Err(StoreError::Conflict {
                key: key.clone(),
                path,
            });
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(io_error("create directory", parent))?;
        }

        match fs::rename(&source, &target) {
            Ok(()) => {
                tracing::debug!(key = %key, "Marked record seen");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound(key.clone())),
            Err(e) => Err(io_error("move record to", &target)(e)),
        }
    }

    /// Deletes every pending and seen record and recreates empty trees.
    pub fn clear(&self) -> Result<(), StoreError> {
        for dir in [&self.pending, &self.seen, &self.staging] {
            match fs::remove_dir_all(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_error("remove directory", dir)(e)),
            }
        }
        tracing::info!(root = %self.root.display(), "Store cleared");
        self.initialize()
    }

    #[cfg(test)]
    pub(crate) fn pending_path(&self, key: &Key) -> PathBuf {
        self.pending.join(key.to_path())
    }

    #[cfg(test)]
    pub(crate) fn seen_path(&self, key: &Key) -> PathBuf {
        self.seen.join(key.to_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, DeliveryStore) {
        let dir = TempDir::new().unwrap();
        let store = DeliveryStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn record(path: &str) -> Record {
        Record::new(
            format!("http://example.com/{path}"),
            format!("http://cdn.example.com/{path}.mp3"),
        )
        .unwrap()
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let (dir, store) = test_store();
        store.initialize().unwrap();
        assert!(dir.path().join("pending").is_dir());
        assert!(dir.path().join("seen").is_dir());
    }

    #[test]
    fn test_initialize_fails_when_root_is_a_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("not-a-dir");
        fs::write(&file, "x").unwrap();
        let err = DeliveryStore::open(&file).unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
    }

    #[test]
    fn test_nested_key_creates_parents() {
        let (_dir, store) = test_store();
        let r = record("a/b/c/d");
        assert!(store.add(&r).unwrap());
        assert!(store.pending_path(r.key()).is_file());
    }

    #[test]
    fn test_staging_left_empty_after_add() {
        let (dir, store) = test_store();
        store.add(&record("x")).unwrap();
        let staged: Vec<_> = fs::read_dir(dir.path().join("staging")).unwrap().collect();
        assert!(staged.is_empty());
    }

    #[test]
    fn test_directory_key_is_not_a_record() {
        let (_dir, store) = test_store();
        store.add(&record("show/ep1")).unwrap();
        let show = Key::parse("show").unwrap();
        assert!(!store.contains_key(&show).unwrap());
        assert!(matches!(
            store.remove_key(&show),
            Err(StoreError::NotFound(_))
        ));
        // The nested record stays pending.
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_key_below_a_record_is_absent() {
        let (_dir, store) = test_store();
        store.add(&record("show")).unwrap();
        let below = Key::parse("show/ep1").unwrap();
        assert!(!store.contains_key(&below).unwrap());
        assert!(matches!(
            store.remove_key(&below),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_remove_seen_record_is_not_found() {
        let (_dir, store) = test_store();
        let r = record("once");
        store.add(&r).unwrap();
        store.remove(&r).unwrap();
        assert!(matches!(store.remove(&r), Err(StoreError::NotFound(_))));
        assert!(store.seen_path(r.key()).is_file());
    }

    #[test]
    fn test_peek_leaves_record_pending() {
        let (_dir, store) = test_store();
        let r = record("peeked");
        store.add(&r).unwrap();
        assert_eq!(store.peek().unwrap(), r);
        assert!(store.pending_path(r.key()).is_file());
        assert!(matches!(
            DeliveryStore::open(store.root().join("other")).unwrap().peek(),
            Err(StoreError::Empty)
        ));
    }

    #[test]
    fn test_update_counts_new_records() {
        let (_dir, store) = test_store();
        let records = [record("1"), record("2"), record("1")];
        assert_eq!(store.update(&records).unwrap(), 2);
        assert_eq!(store.update(&records).unwrap(), 0);
    }

    #[test]
    fn test_add_below_seen_record_is_refused() {
        let (_dir, store) = test_store();
        store.add(&record("show")).unwrap();
        store.pop().unwrap();

        let below = record("show/ep1");
        match store.add(&below) {
            Err(StoreError::Conflict { key, path }) => {
                assert_eq!(&key, below.key());
                assert_eq!(path, store.seen_path(&Key::parse("show").unwrap()));
            }
            other => panic!("Expected Conflict, got {:?}", other),
        }
        assert!(!store.pending_path(below.key()).exists());

        // The queue keeps working for unrelated records.
        store.add(&record("other")).unwrap();
        assert_eq!(store.pop().unwrap(), record("other"));
        assert!(matches!(store.pop(), Err(StoreError::Empty)));
    }

    #[test]
    fn test_add_over_seen_directory_is_refused() {
        let (_dir, store) = test_store();
        store.add(&record("show/ep1")).unwrap();
        store.pop().unwrap();

        assert!(matches!(
            store.add(&record("show")),
            Err(StoreError::Conflict { .. })
        ));
        assert_eq!(store.update(&[record("show"), record("news")]).unwrap(), 1);
    }

    #[test]
    fn test_add_over_pending_directory_is_refused() {
        let (_dir, store) = test_store();
        store.add(&record("show/ep1")).unwrap();
        assert!(matches!(
            store.add(&record("show")),
            Err(StoreError::Conflict { .. })
        ));
        assert!(!store.add_or_skip(&record("show")).unwrap());
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_pop_skips_record_blocked_by_seen_entry() {
        let (dir, store) = test_store();
        // A layout left behind by an earlier release that did not check keys.
        fs::write(dir.path().join("seen").join("show"), "http://cdn/show.mp3\n").unwrap();
        fs::create_dir_all(dir.path().join("pending").join("show")).unwrap();
        fs::write(
            dir.path().join("pending").join("show").join("ep1"),
            "http://cdn/ep1.mp3\n",
        )
        .unwrap();

        assert!(matches!(store.peek(), Err(StoreError::Empty)));
        assert!(matches!(store.pop(), Err(StoreError::Empty)));

        store.add(&record("next")).unwrap();
        assert_eq!(store.peek().unwrap(), record("next"));
        assert_eq!(store.pop().unwrap(), record("next"));
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let (dir, store) = test_store();
        fs::write(dir.path().join("pending").join("broken"), "link only\n").unwrap();
        let err = store.peek().unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }
}
