//! Typed error kinds for the session + terminal-forwarding engine.
//!
//! `spec.md` §7 names error *kinds*, not concrete types; this module is
//! that enum. Every public operation on [`crate::manager::SessionManager`]
//! and [`crate::pty_host::SessionHost`] returns `Result<T, CoreError>` so
//! callers (the CLI, or an external transport layer) get a
//! machine-readable kind plus a human message, never a swallowed error.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("session {0} not found")]
    NotFound(String),

    #[error("session {0} has already exited")]
    AlreadyExited(String),

    #[error("resize disabled by policy")]
    ResizeDisabled,

    #[error("unknown key: {0}")]
    UnknownKey(String),

    #[error("failed to spawn session: {0}")]
    SpawnFailed(#[source] anyhow::Error),

    #[error("stream corrupt for session {session}: {reason}")]
    StreamCorrupt { session: String, reason: String },

    #[error("io error at {path}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoError {
            path: path.into(),
            source,
        }
    }

    /// Machine-readable kind, stable across versions, for transports that
    /// need to map errors onto their own wire representation.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::AlreadyExited(_) => "AlreadyExited",
            Self::ResizeDisabled => "ResizeDisabled",
            Self::UnknownKey(_) => "UnknownKey",
            Self::SpawnFailed(_) => "SpawnFailed",
            Self::StreamCorrupt { .. } => "StreamCorrupt",
            Self::IoError { .. } => "IOError",
            Self::Other(_) => "IOError",
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(source: std::io::Error) -> Self {
        Self::IoError {
            path: PathBuf::new(),
            source,
        }
    }
}

impl From<nix::Error> for CoreError {
    fn from(err: nix::Error) -> Self {
        Self::IoError {
            path: PathBuf::new(),
            source: std::io::Error::from(err),
        }
    }
}

impl From<notify::Error> for CoreError {
    fn from(err: notify::Error) -> Self {
        Self::IoError {
            path: PathBuf::new(),
            source: std::io::Error::other(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
