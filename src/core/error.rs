//! Error types for the octree builder

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the builder
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error on '{}': {source}", path.display())]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Format error: {0}")]
    Format(String),

    #[error("Internal invariant violated: {0}. Please report")]
    Invariant(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Wrap an I/O error with the path it happened on
    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileIo { path: path.into(), source }
    }

    /// Whether the error must stop a batch run rather than only the current file.
    ///
    /// Configuration mistakes apply to every input and invariant violations
    /// mean the accounting is broken, so neither is worth retrying on the
    /// next file. I/O and format problems are scoped to one input.
    pub fn aborts_batch(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Invariant(_))
    }
}

/// Extension to attach a path to `std::io::Result`
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T, Error>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T, Error> {
        self.map_err(|e| Error::file(path, e))
    }
}
