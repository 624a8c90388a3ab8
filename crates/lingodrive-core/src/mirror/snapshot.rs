//! Local snapshot directory
//!
//! Files are written to a temporary sibling and renamed into place, so a
//! reader of the snapshot never sees a half-written file.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::debug;

use crate::drive::validate_path;
use crate::error::{DriveError, DriveResult};

const TEMP_SUFFIX: &str = ".lingodrive-tmp";

/// A directory holding the materialized mirror of one drive
#[derive(Debug, Clone)]
pub struct LocalSnapshot {
    root: PathBuf,
    written: BTreeSet<String>,
}

impl LocalSnapshot {
    /// Snapshot rooted at `root`; the directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            written: BTreeSet::new(),
        }
    }

    /// Snapshot rooted at `root`, treating files already there as written.
    ///
    /// The next pass then removes whatever the current tree no longer holds,
    /// including files left by an earlier process. Leftover temporary files
    /// are deleted.
    pub async fn open(root: impl Into<PathBuf>) -> DriveResult<Self> {
        let mut snapshot = Self::new(root);
        let mut dirs = vec![(snapshot.root.clone(), String::new())];

        while let Some((dir, prefix)) = dirs.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let Ok(name) = entry.file_name().into_string() else {
                    continue;
                };
                let path = format!("{}{}", prefix, name);
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    dirs.push((entry.path(), format!("{}/", path)));
                } else if name.ends_with(TEMP_SUFFIX) {
                    let _ = tokio::fs::remove_file(entry.path()).await;
                } else {
                    snapshot.written.insert(path);
                }
            }
        }

        debug!(root = %snapshot.root.display(), files = snapshot.written.len(), "Snapshot opened");
        Ok(snapshot)
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Paths written by the last completed pass
    pub fn written(&self) -> &BTreeSet<String> {
        &self.written
    }

    pub(crate) fn set_written(&mut self, written: BTreeSet<String>) {
        self.written = written;
    }

    fn resolve(&self, path: &str) -> DriveResult<PathBuf> {
        validate_path(path)?;
        Ok(path.split('/').fold(self.root.clone(), |acc, part| acc.join(part)))
    }

    /// Atomically write one file.
    pub async fn write_file(&self, path: &str, data: &[u8]) -> DriveResult<()> {
        let target = self.resolve(path)?;
        let parent = target
            .parent()
            .ok_or_else(|| DriveError::InvalidOperation(format!("No parent for {}", path)))?;
        tokio::fs::create_dir_all(parent).await?;

        let mut temp_name = target
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        temp_name.push(TEMP_SUFFIX);
        let temp = parent.join(temp_name);

        tokio::fs::write(&temp, data).await?;
        if let Err(e) = tokio::fs::rename(&temp, &target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Read one file, `None` if absent.
    pub async fn read_file(&self, path: &str) -> DriveResult<Option<Bytes>> {
        read_optional(&self.resolve(path)?).await
    }

    /// Remove one file and any directories left empty by it.
    pub async fn remove_file(&self, path: &str) -> DriveResult<()> {
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!(path, "Removed stale snapshot file");

        let mut dir = target.parent();
        while let Some(current) = dir {
            if current == self.root {
                break;
            }
            // Fails on non-empty directories, which ends the walk.
            if tokio::fs::remove_dir(current).await.is_err() {
                break;
            }
            dir = current.parent();
        }
        Ok(())
    }
}

/// Read a file, mapping "not found" to `None`.
pub(crate) async fn read_optional(path: &Path) -> DriveResult<Option<Bytes>> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(Some(Bytes::from(data))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
