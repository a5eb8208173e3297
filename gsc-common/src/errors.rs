//! Operation error taxonomy shared by the daemon's surfaces.

use std::io;
use thiserror::Error;

/// Errors produced by console and file operations.
///
/// The HTTP layer maps these onto status codes; `UnsafePath` deliberately
/// carries no path so a resolved absolute location can never leak into a
/// response.
#[derive(Debug, Error)]
pub enum OpError {
    /// A required request argument is missing or malformed.
    #[error("missing or malformed argument: {0}")]
    Validation(&'static str),

    /// The path escapes the configured root or targets the wrong kind of
    /// entry (e.g. a directory where a file is required).
    #[error("path is outside the allowed root or targets the wrong entry type")]
    UnsafePath,

    /// The target does not exist.
    #[error("no such file or directory")]
    NotFound,

    /// A console write or stop was issued with no active process.
    #[error("server process is not running")]
    NotRunning,

    /// The child process could not be spawned.
    #[error("failed to spawn server process: {0}")]
    SpawnFailed(#[source] io::Error),

    /// A filesystem or pipe operation failed mid-flight.
    #[error("operation failed: {0}")]
    Io(#[from] io::Error),
}
