//! Checkpoint directory with atomic file replacement
//!
//! Every write goes to a uniquely named temporary file that is synced to disk
//! and then renamed over its target, so a reader never sees a partial file.
//! The directory is synced after the rename so the new entry survives a
//! power loss.

use bytes::Bytes;
use runtime_core::Result;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::template::CHECKPOINT_EXTENSION;

/// Directory holding the checkpoints of one run
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Absolute location of `name` inside the store
    pub fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn temp_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!(".{}.{}.tmp", name, Uuid::new_v4()))
    }

    /// Create the directory if missing
    pub async fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    /// Write `data` to `name`, replacing any previous file atomically
    #[instrument(skip(self, data), fields(dir = %self.dir.display(), size = data.len()))]
    pub async fn write_atomic(&self, name: &str, data: &Bytes) -> Result<u64> {
        let target = self.path_of(name);
        let temp = self.temp_path(name);

        fs::create_dir_all(&self.dir).await?;

        let written = async {
            let mut file = fs::File::create(&temp).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp, &target).await
        }
        .await;

        if let Err(e) = written {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        self.sync_dir().await?;

        debug!(path = %target.display(), "Checkpoint file replaced");
        Ok(data.len() as u64)
    }

    /// Flush the directory entries themselves to disk
    #[cfg(unix)]
    pub async fn sync_dir(&self) -> Result<()> {
        fs::File::open(&self.dir).await?.sync_all().await?;
        Ok(())
    }

    /// No-op where directories cannot be opened as files
    #[cfg(not(unix))]
    pub async fn sync_dir(&self) -> Result<()> {
        Ok(())
    }

    pub async fn read(&self, name: &str) -> Result<Bytes> {
        Ok(Bytes::from(fs::read(self.path_of(name)).await?))
    }

    pub async fn exists(&self, name: &str) -> bool {
        fs::metadata(self.path_of(name)).await.is_ok()
    }

    /// Remove `name`; a missing file is not an error
    pub async fn remove(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.path_of(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of the checkpoint files in the directory, sorted
    pub async fn list_checkpoints(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if name.ends_with(CHECKPOINT_EXTENSION) && !name.starts_with('.') {
                    names.push(name.to_string());
                }
            }
        }

        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_write_and_replace() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        store.write_atomic("last.ckpt", &Bytes::from_static(b"one")).await.unwrap();
        store.write_atomic("last.ckpt", &Bytes::from_static(b"two")).await.unwrap();

        assert_eq!(store.read("last.ckpt").await.unwrap(), Bytes::from_static(b"two"));
        // no temp files left behind
        let mut entries = std::fs::read_dir(dir.path()).unwrap();
        assert!(entries.all(|e| !e.unwrap().file_name().to_string_lossy().ends_with(".tmp")));
    }

    #[tokio::test]
    async fn test_sync_dir() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.sync_dir().await.unwrap();

        let missing = CheckpointStore::new(dir.path().join("missing"));
        assert!(missing.sync_dir().await.is_err() || cfg!(not(unix)));

        store.write_atomic("last.ckpt", &Bytes::from_static(b"one")).await.unwrap();
        assert!(store.exists("last.ckpt").await);
    }

    #[tokio::test]
    async fn test_list_and_remove() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("nested"));
        assert!(store.list_checkpoints().await.unwrap().is_empty());

        store.write_atomic("b.ckpt", &Bytes::from_static(b"b")).await.unwrap();
        store.write_atomic("a.ckpt", &Bytes::from_static(b"a")).await.unwrap();
        store.write_atomic("notes.txt", &Bytes::from_static(b"x")).await.unwrap();

        assert_eq!(store.list_checkpoints().await.unwrap(), vec!["a.ckpt", "b.ckpt"]);

        store.remove("a.ckpt").await.unwrap();
        store.remove("a.ckpt").await.unwrap();
        assert!(!store.exists("a.ckpt").await);
        assert!(store.exists("b.ckpt").await);
    }
}
