//! Runner configuration types

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Main runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Collective backend used to join the process group
    pub backend: BackendKind,

    /// How gradients are synchronized across workers
    pub sync_mode: SyncMode,

    /// Combine per-epoch statistics across workers: sample counts are
    /// summed, everything else is averaged
    pub sync_stats: bool,

    /// Granularity at which learning-rate schedulers step
    pub scheduler_step: SchedulerStep,

    /// Network settings
    pub network: NetworkConfig,

    /// Checkpoint settings, `None` disables checkpointing
    pub checkpoint: Option<CheckpointConfig>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            sync_mode: SyncMode::default(),
            sync_stats: true,
            scheduler_step: SchedulerStep::default(),
            network: NetworkConfig::default(),
            checkpoint: None,
        }
    }
}

impl RunnerConfig {
    /// Parse a configuration from JSON, filling omitted fields with defaults.
    ///
    /// Every failure is a configuration error; an unknown backend name is
    /// reported as [`Error::UnknownBackend`].
    pub fn from_json_str(json: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| Error::config(format!("malformed runner config: {}", e)))?;
        if let Some(name) = value.get("backend").and_then(|b| b.as_str()) {
            name.parse::<BackendKind>()?;
        }
        serde_json::from_value(value)
            .map_err(|e| Error::config(format!("invalid runner config: {}", e)))
    }
}

/// Collective backend selector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BackendKind {
    /// TCP star topology rooted at rank 0
    #[default]
    Tcp,

    /// In-process rendezvous between threads
    Local,
}

impl BackendKind {
    /// Canonical name of the backend
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Tcp => "tcp",
            BackendKind::Local => "local",
        }
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tcp" | "gloo" | "torch-distributed" => Ok(BackendKind::Tcp),
            "local" => Ok(BackendKind::Local),
            _ => Err(Error::UnknownBackend {
                name: s.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for BackendKind {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<BackendKind> for String {
    fn from(kind: BackendKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gradient synchronization strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Every model is wrapped and averages its gradients during backward
    #[default]
    Replicated,

    /// The single optimizer averages gradients right before stepping
    Optimizer,
}

impl SyncMode {
    /// Returns true if this mode only supports one model and one optimizer
    pub fn requires_single_optimizer(&self) -> bool {
        matches!(self, SyncMode::Optimizer)
    }
}

/// When schedulers step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerStep {
    /// After every batch
    Batch,

    /// Once at the end of every epoch
    #[default]
    Epoch,
}

impl SchedulerStep {
    /// Name used in the `info` side channel
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerStep::Batch => "batch",
            SchedulerStep::Epoch => "epoch",
        }
    }
}

impl FromStr for SchedulerStep {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "batch" | "iteration" => Ok(SchedulerStep::Batch),
            "epoch" => Ok(SchedulerStep::Epoch),
            other => Err(Error::config(format!(
                "unknown scheduler step granularity: {}",
                other
            ))),
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Delay between attempts to reach the rendezvous address
    #[serde(with = "duration_ms")]
    pub connect_retry_interval: Duration,

    /// Maximum size of a single collective frame in bytes
    pub max_frame_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_retry_interval: Duration::from_millis(200),
            max_frame_size: 256 * 1024 * 1024, // 256MB
        }
    }
}

/// Checkpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Directory plus filename template, e.g. `ckpts/sample-{epoch:02d}`
    pub filepath: PathBuf,

    /// What triggers a save
    #[serde(default)]
    pub trigger: CheckpointTrigger,

    /// Allow a non-empty checkpoint directory
    #[serde(default)]
    pub resume: bool,

    /// Save model weights only
    #[serde(default)]
    pub weights_only: bool,

    /// Number of periodic checkpoints to keep, `None` keeps all
    #[serde(default)]
    pub keep_count: Option<usize>,
}

impl CheckpointConfig {
    /// Checkpoint every epoch into `filepath`
    pub fn new(filepath: impl Into<PathBuf>) -> Self {
        Self {
            filepath: filepath.into(),
            trigger: CheckpointTrigger::default(),
            resume: false,
            weights_only: false,
            keep_count: None,
        }
    }
}

/// Checkpoint trigger; the two modes are mutually exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointTrigger {
    /// Save every N completed epochs
    EveryEpochs(u64),

    /// Save every N global training steps
    EverySteps(u64),
}

impl Default for CheckpointTrigger {
    fn default() -> Self {
        CheckpointTrigger::EveryEpochs(1)
    }
}

/// Immutable user configuration handed to every creator
///
/// Creators receive a shared reference, so no creator can leak state to
/// another through the configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrainConfig {
    values: BTreeMap<String, serde_json::Value>,
}

impl TrainConfig {
    /// Create an empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion, only available before the record is shared
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Raw value lookup
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    /// Float lookup
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_f64())
    }

    /// Integer lookup
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.as_u64())
    }

    /// String lookup
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.as_str())
    }

    /// Float lookup that fails with a configuration error when absent
    pub fn require_f64(&self, key: &str) -> Result<f64> {
        self.get_f64(key)
            .ok_or_else(|| Error::config(format!("missing numeric config key: {}", key)))
    }

    /// Iterate over all entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.values.iter()
    }
}

impl FromIterator<(String, serde_json::Value)> for TrainConfig {
    fn from_iter<I: IntoIterator<Item = (String, serde_json::Value)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Durations as whole milliseconds
mod duration_ms {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn test_default_config() {
        let config = RunnerConfig::default();
        assert_eq!(config.backend, BackendKind::Tcp);
        assert_eq!(config.sync_mode, SyncMode::Replicated);
        assert_eq!(config.scheduler_step, SchedulerStep::Epoch);
        assert!(config.sync_stats);
        assert!(config.checkpoint.is_none());

        let parsed = RunnerConfig::from_json_str("{}").unwrap();
        assert!(parsed.sync_stats);
    }

    #[test]
    fn test_config_serialization() {
        let mut config = RunnerConfig::default();
        config.checkpoint = Some(CheckpointConfig::new("ckpts/model-{step}"));
        let json = serde_json::to_string(&config).unwrap();
        let parsed = RunnerConfig::from_json_str(&json).unwrap();
        assert_eq!(
            parsed.network.connect_retry_interval,
            config.network.connect_retry_interval
        );
        assert_eq!(
            parsed.checkpoint.unwrap().filepath,
            PathBuf::from("ckpts/model-{step}")
        );
    }

    #[test]
    fn test_backend_parsing() {
        assert_eq!("gloo".parse::<BackendKind>().unwrap(), BackendKind::Tcp);
        assert_eq!("LOCAL".parse::<BackendKind>().unwrap(), BackendKind::Local);
        assert!(matches!(
            "nccl".parse::<BackendKind>(),
            Err(Error::UnknownBackend { .. })
        ));
    }

    #[test]
    fn test_json_errors_are_configuration_errors() {
        let err = RunnerConfig::from_json_str(r#"{"backend": "horovod"}"#).unwrap_err();
        assert!(matches!(err, Error::UnknownBackend { ref name } if name == "horovod"));
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let err = RunnerConfig::from_json_str(r#"{"sync_mode": "sideways"}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let err = RunnerConfig::from_json_str("{not json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let config = RunnerConfig::from_json_str(r#"{"backend": "gloo", "sync_stats": false}"#).unwrap();
        assert_eq!(config.backend, BackendKind::Tcp);
        assert!(!config.sync_stats);
    }

    #[test]
    fn test_checkpoint_trigger_json() {
        let json = r#"{"filepath": "out/ck-{epoch}", "trigger": {"every_steps": 10}}"#;
        let config: CheckpointConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.trigger, CheckpointTrigger::EverySteps(10));
        assert!(!config.resume);
    }

    #[test]
    fn test_train_config_lookup() {
        let config = TrainConfig::new().with("lr", 0.5).with("name", "linear");
        assert_eq!(config.get_f64("lr"), Some(0.5));
        assert_eq!(config.get_str("name"), Some("linear"));
        assert!(config.require_f64("momentum").is_err());
    }
}
