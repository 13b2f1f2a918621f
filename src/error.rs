// src/error.rs
use std::path::PathBuf;

use thiserror::Error;

/// Errors shared by the attack library.
///
/// The variants follow the failure classes of the original tools: bad user
/// input, unreadable trace files, resource problems (disk, memory, threads),
/// compute device setup, and runtime faults while a search is in flight.
/// "No key found" is a result, not an error, and is reported separately.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid {what}: {detail}")]
    Usage { what: &'static str, detail: String },

    #[error("{path}:{line}: {detail}")]
    InputData {
        path: PathBuf,
        line: usize,
        detail: String,
    },

    #[error("cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("resource failure: {0}")]
    Resource(String),

    #[error("device setup failed: {0}")]
    DeviceSetup(String),

    #[error("worker {worker} failed: {detail}")]
    Runtime { worker: usize, detail: String },
}

impl Error {
    /// Process exit code for this error class.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Usage { .. } => 8,
            Error::InputData { .. } | Error::Io { .. } => 2,
            Error::Resource(_) => 2,
            Error::DeviceSetup(_) => 3,
            Error::Runtime { .. } => 2,
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub fn usage(what: &'static str, detail: impl Into<String>) -> Self {
        Error::Usage {
            what,
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
