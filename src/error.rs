/*!
 * Error types for convoy
 */

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConvoyError>;

#[derive(Debug, Error)]
pub enum ConvoyError {
    /// Invalid arguments or options
    #[error("configuration error: {0}")]
    Config(String),

    /// Source tree missing, unreadable, or not a directory
    #[error("source not usable: {0}")]
    Source(PathBuf),

    /// A path that looks like `host:path`; convoy is local-to-local only
    #[error("remote paths are not supported: {0}")]
    RemotePath(String),

    /// I/O error outside any bucket (destination setup, thread spawn)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invariant violation (a bug in convoy, not in the run)
    #[error("internal error: {0}")]
    Internal(String),
}

impl ConvoyError {
    /// Process exit code for errors that abort the run before or outside the
    /// bucket pipeline. Per-bucket failures never travel this path; they are
    /// aggregated into the run summary instead.
    pub fn exit_code(&self) -> i32 {
        match self {
            ConvoyError::Config(_)
            | ConvoyError::Source(_)
            | ConvoyError::RemotePath(_)
            | ConvoyError::Io(_) => 2,
            // EX_SOFTWARE, kept clear of the 0/1/2/130 run codes
            ConvoyError::Internal(_) => 70,
        }
    }
}
