use std::fs::{self, ReadDir};
use std::path::{Path, PathBuf};

use super::{entry, io_error, is_missing, StoreError};
use crate::record::{Key, Record};

/// Depth-first walk over a pending tree, reading one record per file.
///
/// Files that vanish mid-walk (taken by another process) are skipped.
pub struct Entries {
    root: PathBuf,
    stack: Vec<ReadDir>,
}

impl Entries {
    pub(super) fn new(root: &Path) -> Result<Self, StoreError> {
        let top = fs::read_dir(root).map_err(io_error("list", root))?;
        Ok(Self {
            root: root.to_path_buf(),
            stack: vec![top],
        })
    }

    fn read(&self, path: &Path) -> Result<Record, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };

        let relative = path
            .strip_prefix(&self.root)
            .map_err(|e| corrupt(e.to_string()))?;
        let key = Key::from_path(relative).map_err(|e| corrupt(e.to_string()))?;
        let content = fs::read_to_string(path).map_err(io_error("read", path))?;
        entry::decode(key, &content).map_err(corrupt)
    }
}

impl Iterator for Entries {
    type Item = Result<Record, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let dir = self.stack.last_mut()?;
            let entry = match dir.next() {
                None => {
                    self.stack.pop();
                    continue;
                }
                Some(Err(e)) => return Some(Err(io_error("list", &self.root)(e))),
                Some(Ok(entry)) => entry,
            };

            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(e) if is_missing(&e) => continue,
                Err(e) => return Some(Err(io_error("inspect", &path)(e))),
            };

            if file_type.is_dir() {
                match fs::read_dir(&path) {
                    Ok(children) => self.stack.push(children),
                    Err(e) if is_missing(&e) => {}
                    Err(e) => return Some(Err(io_error("list", &path)(e))),
                }
                continue;
            }
            if !file_type.is_file() {
                tracing::debug!(path = %path.display(), "Ignoring non-file entry in pending tree");
                continue;
            }

            match self.read(&path) {
                Err(StoreError::Io { source, .. }) if is_missing(&source) => continue,
                result => return Some(result),
            }
        }
    }
}
