//! Error taxonomy for the update build engine.
//!
//! Library code returns [`Result`]; the CLI wraps it in `anyhow` the same way
//! the command handlers do.

use std::io;
use std::path::{Path, PathBuf};

/// Errors raised while building manifests, fullfiles and packs.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A path could not be read or written. Fails the build of that version.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// The path that was being accessed.
        path: PathBuf,
        /// Underlying OS error.
        source: io::Error,
    },

    /// An external tool or delta engine failed. Callers fall back to full
    /// content instead of propagating this.
    #[error("{tool} failed: {detail}")]
    Tool {
        /// Program or engine name.
        tool: String,
        /// Exit code, stderr or engine error text.
        detail: String,
    },

    /// A manifest is malformed, missing, or references something that does
    /// not exist (missing previous version, broken bundle graph).
    #[error("manifest format error: {0}")]
    Format(String),

    /// An internal invariant was found broken (duplicate filename, bad flag
    /// combination). Never corrected silently.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Writing a tar archive failed.
    #[error("archive error on {}: {source}", path.display())]
    Archive {
        /// Archive being written.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },

    /// A worker task panicked or the pool could not be started.
    #[error("worker pool: {0}")]
    Worker(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Attach a path to an I/O error.
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Shorthand for a format error.
    pub fn format(detail: impl Into<String>) -> Self {
        Self::Format(detail.into())
    }

    /// Returns true for failures that callers recover from by falling back
    /// to the unoptimized path.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Tool { .. })
    }
}

/// Extension for mapping `io::Result` into [`Result`] with the offending path.
pub trait IoContext<T> {
    /// Attach `path` to the error.
    fn at(self, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|e| Error::io(path, e))
    }
}
