//! Error types for the distributed training runner

use thiserror::Error;

/// Result type alias using the runtime Error
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error raised by user-supplied code (creators, hooks, callbacks)
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid setup detected before training starts
    Configuration,

    /// Rank resolution or process-group membership failed
    Setup,

    /// Raised while building components or running the loop
    Training,

    /// Checkpoint or state (de)serialization failed
    Persistence,

    /// Bug in the runner itself
    Internal,
}

/// Core error type for the distributed training runner
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Unknown backend: {name} (valid options: tcp, local)")]
    UnknownBackend { name: String },

    #[error("Missing creator: {creator}")]
    MissingCreator { creator: &'static str },

    #[error("Backend {backend} accepts exactly one optimizer, got {count}")]
    OptimizerCountMismatch { backend: String, count: usize },

    #[error("Found non-empty checkpoint directory {path} without resume")]
    CheckpointDirNotEmpty { path: String },

    #[error("A main callback is already registered: {existing}")]
    DuplicateMainCallback { existing: String },

    // Setup errors
    #[error("Rank resolution failed for {address}: needed occurrence {required}, found {found}")]
    RankResolution {
        address: String,
        required: usize,
        found: usize,
    },

    #[error("Failed to join process group at {url}: {message}")]
    GroupJoin { url: String, message: String },

    // Training errors
    #[error(transparent)]
    Training(BoxError),

    #[error("Invalid operator transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Shape error: {message}")]
    Shape { message: String },

    #[error("Collective operation failed: {message}")]
    Collective { message: String },

    #[error("Workers disagree on batches per epoch: min {min}, max {max}")]
    UnevenBatches { min: i64, max: i64 },

    // Persistence errors
    #[error("No checkpoint to resume from: {path}")]
    NoCheckpointForRecovery { path: String },

    #[error("Checkpoint corrupted: {path} - {reason}")]
    CheckpointCorrupted { path: String, reason: String },

    #[error("State mismatch for {component}: runner has {expected}, snapshot has {actual}")]
    StateMismatch {
        component: &'static str,
        expected: usize,
        actual: usize,
    },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Wrap an error raised by user code so it propagates unmodified
    pub fn training<E: Into<BoxError>>(err: E) -> Self {
        Error::Training(err.into())
    }

    /// Shorthand for an [`Error::InvalidConfig`]
    pub fn config(message: impl Into<String>) -> Self {
        Error::InvalidConfig {
            message: message.into(),
        }
    }

    /// Returns the category this error belongs to
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidConfig { .. }
            | Error::UnknownBackend { .. }
            | Error::MissingCreator { .. }
            | Error::OptimizerCountMismatch { .. }
            | Error::CheckpointDirNotEmpty { .. }
            | Error::DuplicateMainCallback { .. } => ErrorKind::Configuration,
            Error::RankResolution { .. } | Error::GroupJoin { .. } => ErrorKind::Setup,
            Error::Training(_)
            | Error::InvalidTransition { .. }
            | Error::Shape { .. }
            | Error::Collective { .. }
            | Error::UnevenBatches { .. } => ErrorKind::Training,
            Error::NoCheckpointForRecovery { .. }
            | Error::CheckpointCorrupted { .. }
            | Error::StateMismatch { .. }
            | Error::Io(_)
            | Error::Serialization(_) => ErrorKind::Persistence,
            Error::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Returns the user error carried by [`Error::Training`], if any
    pub fn user_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Error::Training(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<ndarray::ShapeError> for Error {
    fn from(e: ndarray::ShapeError) -> Self {
        Error::Shape {
            message: e.to_string(),
        }
    }
}
