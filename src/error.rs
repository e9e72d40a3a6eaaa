use std::{fmt, ops::Range, path::PathBuf};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Time-batch coordinates at which a scene failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchCoords {
    pub index: u64,
    pub time: Range<u64>,
}

impl fmt::Display for BatchCoords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batch {} (t={}..{})",
            self.index, self.time.start, self.time.end
        )
    }
}

fn batch_suffix(batch: &Option<BatchCoords>) -> String {
    batch
        .as_ref()
        .map(|b| format!(", {b}"))
        .unwrap_or_default()
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid scale specification: {0}")]
    InvalidScaleSpec(String),
    #[error("conflicting scale specifications: {0}")]
    ConflictingScaleSpec(String),
    #[error("{given} channel descriptor(s) given for a channel axis of extent {expected}")]
    ChannelCountMismatch { expected: usize, given: usize },
    #[error("cannot represent {source_dtype} as {target}: {reason}")]
    UnsupportedDtype {
        source_dtype: String,
        target: String,
        reason: String,
    },
    #[error("destination {0} already exists; enable overwrite to replace it")]
    DestinationExists(String),
    #[error("destination {0} is targeted by more than one job")]
    DestinationConflict(String),
    #[error("unknown option {0:?}")]
    UnknownOption(String),
    #[error("invalid value for option {key}: {message}")]
    InvalidOption { key: String, message: String },
    #[error("missing required option {0}")]
    MissingOption(&'static str),
    #[error("row {row}: missing mandatory source")]
    MissingSource { row: usize },
    #[error("scene {index} out of range; source has {count} scene(s)")]
    SceneOutOfRange { index: usize, count: usize },
    #[error("unsupported source {}: {reason}", path.display())]
    UnsupportedSource { path: PathBuf, reason: String },
    #[error("conversion failed at scene {scene}{}: {source}", batch_suffix(batch))]
    Conversion {
        scene: usize,
        batch: Option<BatchCoords>,
        source: Box<Error>,
    },
    #[error("{0}")]
    General(String),
    #[error(transparent)]
    Storage(#[from] zarrs::storage::StorageError),
    #[error(transparent)]
    ArrayCreate(#[from] zarrs::array::ArrayCreateError),
    #[error(transparent)]
    GroupCreate(#[from] zarrs::group::GroupCreateError),
    #[error(transparent)]
    Array(#[from] zarrs::array::ArrayError),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Wrapped(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    pub fn general(message: impl Into<String>) -> Self {
        Self::General(message.into())
    }

    pub fn wrap(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Wrapped(Box::new(error))
    }

    pub fn invalid_option(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidOption {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Annotate a collaborator failure with the scene (and batch) it happened in.
    ///
    /// Errors which already carry coordinates are returned unchanged.
    pub fn at(self, scene: usize, batch: Option<BatchCoords>) -> Self {
        match self {
            e @ Self::Conversion { .. } => e,
            e => Self::Conversion {
                scene,
                batch,
                source: Box::new(e),
            },
        }
    }

    /// Whether this error was raised by option validation before any I/O.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidScaleSpec(_)
                | Self::ConflictingScaleSpec(_)
                | Self::ChannelCountMismatch { .. }
                | Self::UnsupportedDtype { .. }
                | Self::UnknownOption(_)
                | Self::InvalidOption { .. }
                | Self::MissingOption(_)
                | Self::MissingSource { .. }
        )
    }
}
