//! Checkpoint manager for periodic and final training checkpoints

use bytes::Bytes;
use chrono::Utc;
use runtime_core::{
    CheckpointConfig, CheckpointMetadata, CheckpointTrigger, CheckpointType, Epoch, Error,
    Result, Step,
};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

use crate::format::{decode, encode, CheckpointHeader};
use crate::store::CheckpointStore;
use crate::template::{format_checkpoint_name, last_checkpoint_name, split_filepath};

/// A checkpoint file that is fully on disk but not yet the canonical one
#[derive(Debug, Clone)]
pub struct WrittenCheckpoint {
    pub name: String,
    pub bytes: Bytes,
    pub metadata: CheckpointMetadata,
}

/// Checkpoint read back from disk
#[derive(Debug, Clone)]
pub struct LoadedCheckpoint {
    pub path: PathBuf,
    pub header: CheckpointHeader,
    pub payload: Bytes,
}

/// Checkpoint manager handling naming, triggers, the canonical `last.ckpt`
/// and retention of periodic files
#[derive(Debug)]
pub struct CheckpointManager {
    /// Configuration
    config: CheckpointConfig,

    /// Checkpoint directory
    store: CheckpointStore,

    /// Filename template, e.g. `sample-{epoch:02d}`
    template: String,

    /// Periodic checkpoints written by this manager, oldest first
    saved: VecDeque<CheckpointMetadata>,
}

impl CheckpointManager {
    /// Create a manager for `config.filepath`; nothing is touched on disk yet
    pub fn new(config: CheckpointConfig) -> Result<Self> {
        let every = match config.trigger {
            CheckpointTrigger::EveryEpochs(n) | CheckpointTrigger::EverySteps(n) => n,
        };
        if every == 0 {
            return Err(Error::config("checkpoint trigger interval must be positive"));
        }
        if config.keep_count == Some(0) {
            return Err(Error::config("keep_count must keep at least one checkpoint"));
        }

        let (dir, template) = split_filepath(&config.filepath)?;
        Ok(Self {
            config,
            store: CheckpointStore::new(dir),
            template,
            saved: VecDeque::new(),
        })
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    pub fn dir(&self) -> &Path {
        self.store.dir()
    }

    /// Content type written by this manager
    pub fn checkpoint_type(&self) -> CheckpointType {
        if self.config.weights_only {
            CheckpointType::ModelOnly
        } else {
            CheckpointType::Full
        }
    }

    /// Create the directory, refusing to clobber existing checkpoints unless resuming
    #[instrument(skip(self), fields(dir = %self.dir().display()))]
    pub async fn preflight(&self) -> Result<()> {
        let existing = self.store.list_checkpoints().await?;
        if !existing.is_empty() {
            if !self.config.resume {
                return Err(Error::CheckpointDirNotEmpty {
                    path: self.config.filepath.display().to_string(),
                });
            }
            info!(count = existing.len(), "Resuming into existing checkpoint directory");
        }
        self.store.ensure_dir().await
    }

    /// Check if a save is due after `epochs_completed` epochs
    pub fn should_save_epoch(&self, epochs_completed: Epoch) -> bool {
        matches!(self.config.trigger, CheckpointTrigger::EveryEpochs(n) if epochs_completed > 0 && epochs_completed % n == 0)
    }

    /// Check if a save is due at `global_step`
    pub fn should_save_step(&self, global_step: Step) -> bool {
        matches!(self.config.trigger, CheckpointTrigger::EverySteps(n) if global_step > 0 && global_step % n == 0)
    }

    /// Periodic file name for the given counters
    pub fn checkpoint_name(&self, epoch: Epoch, step: Step) -> String {
        format_checkpoint_name(&self.template, epoch, step)
    }

    /// Write and publish a periodic checkpoint
    pub async fn save(&mut self, epoch: Epoch, step: Step, payload: &[u8]) -> Result<CheckpointMetadata> {
        let name = self.checkpoint_name(epoch, step);
        let written = self.write(&name, epoch, step, payload).await?;
        self.finalize(written).await
    }

    /// Write the canonical checkpoint only, as done once training ends
    pub async fn save_last(&mut self, epoch: Epoch, step: Step, payload: &[u8]) -> Result<CheckpointMetadata> {
        let written = self.write(&last_checkpoint_name(), epoch, step, payload).await?;
        info!(path = %written.metadata.path, epoch, step, "Final checkpoint saved");
        Ok(written.metadata)
    }

    /// Durably write `name` without touching the canonical checkpoint
    #[instrument(skip(self, payload), fields(size = payload.len()))]
    pub async fn write(&self, name: &str, epoch: Epoch, step: Step, payload: &[u8]) -> Result<WrittenCheckpoint> {
        let mut header = CheckpointHeader::new(step, epoch, self.checkpoint_type());
        header
            .metadata
            .insert("template".to_string(), self.template.clone());
        let bytes = encode(&header, payload)?;

        let start = std::time::Instant::now();
        let size_bytes = self.store.write_atomic(name, &bytes).await?;
        let path = self.store.path_of(name);

        debug!(
            path = %path.display(),
            size_bytes,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Checkpoint written"
        );

        Ok(WrittenCheckpoint {
            name: name.to_string(),
            metadata: CheckpointMetadata {
                path: path.to_string_lossy().to_string(),
                step,
                epoch,
                size_bytes,
                created_at: Utc::now(),
                checkpoint_type: header.checkpoint_type,
                metadata: header.metadata,
            },
            bytes,
        })
    }

    /// Make `written` the canonical checkpoint, then apply retention.
    ///
    /// `last.ckpt` is replaced by rename, and older periodic files are only
    /// removed after that, so a crash at any point leaves a loadable
    /// canonical checkpoint.
    pub async fn finalize(&mut self, written: WrittenCheckpoint) -> Result<CheckpointMetadata> {
        let last = last_checkpoint_name();
        if written.name != last {
            self.store.write_atomic(&last, &written.bytes).await?;
            self.saved.retain(|m| m.path != written.metadata.path);
            self.saved.push_back(written.metadata.clone());
        }

        info!(
            path = %written.metadata.path,
            epoch = written.metadata.epoch,
            step = written.metadata.step,
            size_bytes = written.metadata.size_bytes,
            "Checkpoint saved"
        );

        self.cleanup_old_checkpoints().await;
        Ok(written.metadata)
    }

    /// Periodic checkpoints still on disk, oldest first
    pub fn saved(&self) -> impl Iterator<Item = &CheckpointMetadata> {
        self.saved.iter()
    }

    async fn cleanup_old_checkpoints(&mut self) {
        let Some(keep) = self.config.keep_count else {
            return;
        };

        while self.saved.len() > keep {
            let Some(oldest) = self.saved.pop_front() else {
                break;
            };
            let name = Path::new(&oldest.path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();

            match self.store.remove(&name).await {
                Ok(()) => debug!(path = %oldest.path, "Deleted old checkpoint"),
                Err(e) => warn!(path = %oldest.path, error = %e, "Failed to delete old checkpoint"),
            }
        }
    }

    /// Path of the canonical checkpoint in `dir`
    pub fn latest_checkpoint<P: AsRef<Path>>(dir: P) -> Result<PathBuf> {
        let path = dir.as_ref().join(last_checkpoint_name());
        if !path.is_file() {
            return Err(Error::NoCheckpointForRecovery {
                path: path.display().to_string(),
            });
        }
        Ok(path)
    }

    /// Read and validate a checkpoint file
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<LoadedCheckpoint> {
        let path = path.as_ref().to_path_buf();
        let path_str = path.display().to_string();

        let data = match tokio::fs::read(&path).await {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NoCheckpointForRecovery { path: path_str })
            }
            Err(e) => return Err(e.into()),
        };

        let (header, payload) = decode(&path_str, data)?;
        debug!(path = %path_str, epoch = header.epoch, step = header.step, "Checkpoint loaded");
        Ok(LoadedCheckpoint {
            path,
            header,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(dir: &Path, template: &str) -> CheckpointConfig {
        CheckpointConfig::new(dir.join(template))
    }

    #[tokio::test]
    async fn test_save_publishes_last() {
        let dir = tempdir().unwrap();
        let mut manager = CheckpointManager::new(config(dir.path(), "sample-{epoch:02d}")).unwrap();
        manager.preflight().await.unwrap();

        let meta = manager.save(1, 4, b"state-1").await.unwrap();
        assert!(meta.path.ends_with("sample-epoch=1.ckpt"));

        let latest = CheckpointManager::latest_checkpoint(dir.path()).unwrap();
        let loaded = CheckpointManager::load(&latest).await.unwrap();
        assert_eq!(loaded.payload, Bytes::from_static(b"state-1"));
        assert_eq!(loaded.header.epoch, 1);
        assert_eq!(loaded.header.step, 4);
        assert_eq!(
            loaded.header.metadata.get("template").map(String::as_str),
            Some("sample-{epoch:02d}")
        );
    }

    #[tokio::test]
    async fn test_preflight_rejects_existing_checkpoints() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("old.ckpt"), b"x").unwrap();

        let manager = CheckpointManager::new(config(dir.path(), "{epoch}")).unwrap();
        let err = manager.preflight().await.unwrap_err();
        assert!(matches!(err, Error::CheckpointDirNotEmpty { .. }));

        let mut resume = config(dir.path(), "{epoch}");
        resume.resume = true;
        CheckpointManager::new(resume).unwrap().preflight().await.unwrap();
    }

    #[tokio::test]
    async fn test_preflight_creates_directory() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let manager = CheckpointManager::new(config(&nested, "{epoch}")).unwrap();
        manager.preflight().await.unwrap();
        assert!(nested.is_dir());
    }

    #[tokio::test]
    async fn test_crash_before_finalize_keeps_previous() {
        let dir = tempdir().unwrap();
        let mut manager = CheckpointManager::new(config(dir.path(), "{epoch}")).unwrap();
        manager.save(1, 2, b"first").await.unwrap();

        // new file fully written, canonical not yet replaced
        manager.write("epoch=2.ckpt", 2, 4, b"second").await.unwrap();

        let latest = CheckpointManager::latest_checkpoint(dir.path()).unwrap();
        let loaded = CheckpointManager::load(latest).await.unwrap();
        assert_eq!(loaded.payload, Bytes::from_static(b"first"));
    }

    #[tokio::test]
    async fn test_keep_count_retention() {
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path(), "{step}");
        cfg.trigger = CheckpointTrigger::EverySteps(10);
        cfg.keep_count = Some(2);
        let mut manager = CheckpointManager::new(cfg).unwrap();

        for step in [10u64, 20, 30] {
            assert!(manager.should_save_step(step));
            manager.save(0, step, &step.to_le_bytes()).await.unwrap();
        }

        assert!(!dir.path().join("step=10.ckpt").exists());
        assert!(dir.path().join("step=20.ckpt").exists());
        assert!(dir.path().join("step=30.ckpt").exists());
        assert!(dir.path().join("last.ckpt").exists());
        assert_eq!(manager.saved().count(), 2);
    }

    #[test]
    fn test_triggers_are_exclusive() {
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path(), "{epoch}");
        cfg.trigger = CheckpointTrigger::EveryEpochs(2);
        let manager = CheckpointManager::new(cfg).unwrap();

        assert!(!manager.should_save_epoch(1));
        assert!(manager.should_save_epoch(2));
        assert!(!manager.should_save_step(2));

        let mut cfg = config(dir.path(), "{epoch}");
        cfg.trigger = CheckpointTrigger::EverySteps(0);
        assert!(CheckpointManager::new(cfg).is_err());
    }

    #[tokio::test]
    async fn test_missing_latest() {
        let dir = tempdir().unwrap();
        let err = CheckpointManager::latest_checkpoint(dir.path()).unwrap_err();
        assert!(matches!(err, Error::NoCheckpointForRecovery { .. }));

        let err = CheckpointManager::load(dir.path().join("nope.ckpt")).await.unwrap_err();
        assert!(matches!(err, Error::NoCheckpointForRecovery { .. }));
    }

    #[tokio::test]
    async fn test_corrupted_file_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("last.ckpt");
        std::fs::write(&path, b"CKPT garbage").unwrap();
        let err = CheckpointManager::load(&path).await.unwrap_err();
        assert!(matches!(err, Error::CheckpointCorrupted { .. }));
    }

    #[tokio::test]
    async fn test_weights_only_type() {
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path(), "w");
        cfg.weights_only = true;
        let mut manager = CheckpointManager::new(cfg).unwrap();
        let meta = manager.save_last(3, 9, b"weights").await.unwrap();

        assert_eq!(meta.checkpoint_type, CheckpointType::ModelOnly);
        assert!(meta.path.ends_with("last.ckpt"));
        assert_eq!(manager.saved().count(), 0);
    }
}
