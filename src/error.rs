use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum WallpaperPickerError {
    #[error("Failed to create thread pool: {0}")]
    ThreadPoolCreation(#[from] rayon::ThreadPoolBuildError),

    #[error("Failed to start preview runtime: {0}")]
    RuntimeCreation(std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to scan {path}: {source}")]
    DirectoryScan {
        path: PathBuf,
        source: walkdir::Error,
    },

    #[error("Failed to save selected image path: {0}")]
    SaveSelectedImage(std::io::Error),

    #[error("Command execution failed: {0}")]
    CommandExecution(String),
}

pub type Result<T> = std::result::Result<T, WallpaperPickerError>;

/// Outcome of a preview load that did not produce an image.
///
/// Cloneable because one decode result is handed to every request that
/// was coalesced onto it.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PreviewError {
    #[error("{0} no longer exists")]
    NotFound(PathBuf),

    #[error("{0} is not a supported image format")]
    UnsupportedFormat(PathBuf),

    #[error("{path} could not be decoded: {reason}")]
    CorruptData { path: PathBuf, reason: String },

    #[error("Failed to read {path}: {reason}")]
    Io { path: PathBuf, reason: String },

    #[error("Decoder refused the image: {0}")]
    ResourceExhausted(String),

    #[error("preview load cancelled")]
    Cancelled,

    #[error("timed out")]
    TimedOut,
}

impl PreviewError {
    /// Cancellation is the normal result of a superseded request, not a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PreviewError::Cancelled)
    }
}
