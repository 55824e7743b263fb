//! Structured error types for localdb-core.
//!
//! Every variant is fatal to a run; nothing here is recovered locally.
//! The binary wraps these in `anyhow` for reporting.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for localdb-core operations
#[derive(Error, Debug)]
pub enum LocalDbError {
    /// Invalid or unusable configuration (naming scope, identifier, profile dir)
    #[error("Configuration error: {reason}")]
    Config { reason: String },

    /// The utility binary could not be launched at all
    #[error("Failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The utility ran and reported failure
    #[error("'{command}' exited with code {code}: {stderr}")]
    ExitCode {
        command: String,
        code: i32,
        stderr: String,
    },

    /// The utility did not finish within the configured timeout
    #[error("'{command}' timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    /// Removing a backing file failed for a reason other than absence
    #[error("Failed to remove {path:?}: {source}")]
    Files {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Verification read did not find exactly one row
    #[error("Expected exactly one record, found {found}")]
    NotSingle { found: usize },

    /// The instance has no pipe to connect to
    #[error("LocalDB instance '{name}' is not running (state: {state})")]
    InstanceNotRunning { name: String, state: String },

    /// Opening the instance pipe failed
    #[error("Failed to open pipe {path}: {source}")]
    Pipe {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Transport not available on this platform
    #[error("Unsupported: {reason}")]
    Unsupported { reason: String },

    /// A session was asked about a database it cannot see
    #[error("Database '{name}' does not exist")]
    MissingDatabase { name: String },

    /// Database client library failure, propagated unmodified
    #[error("Client error: {0}")]
    Client(#[from] tiberius::error::Error),
}

/// Result type alias for localdb-core operations
pub type Result<T> = std::result::Result<T, LocalDbError>;

impl LocalDbError {
    /// Create a config error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Create a spawn error for the named program
    pub fn spawn(program: impl Into<String>, source: io::Error) -> Self {
        Self::Spawn {
            program: program.into(),
            source,
        }
    }

    /// Create a non-zero exit error
    pub fn exit_code(command: impl Into<String>, code: i32, stderr: impl Into<String>) -> Self {
        Self::ExitCode {
            command: command.into(),
            code,
            stderr: stderr.into(),
        }
    }

    /// Create a file removal error
    pub fn files(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Files {
            path: path.into(),
            source,
        }
    }

    /// Create an unsupported-platform error
    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::Unsupported {
            reason: reason.into(),
        }
    }

    /// True for the data-integrity class of failure
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::NotSingle { .. })
    }
}
