// Error types for tree sequence inference
//
// The library surfaces typed errors; the binary wraps them with anyhow
// context. Worker threads never panic across the pipeline boundary: match
// failures travel through the completion channel as WorkerFailure.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for treeweave operations
#[derive(Error, Debug)]
pub enum TreeweaveError {
    /// A node/edge/mutation capacity request could not be allocated.
    /// Fatal to the current run; nothing past the last checkpoint survives.
    #[error("resource exhaustion: cannot allocate {requested} {what}")]
    ResourceExhaustion { what: &'static str, requested: usize },

    /// A restored tree sequence disagrees with the expected input counts.
    /// Detected eagerly, before any matching starts.
    #[error("structural inconsistency: {message}")]
    StructuralInconsistency { message: String },

    /// A worker thread failed (match error or panic) mid-epoch.
    #[error("worker {thread_index} failed: {message}")]
    WorkerFailure { thread_index: usize, message: String },

    /// I/O errors (file missing, permission denied, read/write failures)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Input format errors
    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    /// Snapshot encode/decode errors
    #[error("snapshot error for {path}: {message}")]
    Snapshot { path: PathBuf, message: String },

    /// Invalid configuration (bad spans, empty inputs, zero chunk sizes)
    #[error("configuration error: {message}")]
    Config { message: String },
}

/// Type alias for Results using TreeweaveError
pub type Result<T> = std::result::Result<T, TreeweaveError>;

impl TreeweaveError {
    pub fn inconsistent(message: impl Into<String>) -> Self {
        Self::StructuralInconsistency {
            message: message.into(),
        }
    }

    pub fn worker(thread_index: usize, message: impl Into<String>) -> Self {
        Self::WorkerFailure {
            thread_index,
            message: message.into(),
        }
    }

    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            line,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}
