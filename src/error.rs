//! Error types for wadpack

use std::sync::Arc;

use thiserror::Error;

use crate::config::GameVersion;

/// Main error type for wadpack operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The archive handle backing a file or directory was closed
    #[error("archive handle is closed")]
    Closed,

    #[error("Invalid format: {0}")]
    Format(String),

    #[error("Unsupported compression: {0}")]
    UnsupportedCompression(String),

    #[error("Corrupt data: {0}")]
    Corrupt(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Tag type {tag_type:#06x} is not registered for {version:?}")]
    UnsupportedVersion { tag_type: u16, version: GameVersion },

    #[error("Game version {0:?} has no tag table")]
    UnsupportedGame(GameVersion),

    #[error("Decoding node {node} failed: {source}")]
    Decode {
        node: u32,
        #[source]
        source: Arc<Error>,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification of [`Error`] values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad magic or signature; the driver could not be constructed
    Format,
    /// Offsets out of bounds, unbalanced nesting, truncated records
    Corrupt,
    /// Missing name or id; recoverable
    NotFound,
    /// Tag type with no handler for the active game version
    UnsupportedVersion,
    /// Underlying media failure, including use after close
    Io,
    /// A registered decoder rejected its payload
    Decode,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::Closed => ErrorKind::Io,
            Error::Format(_) | Error::UnsupportedCompression(_) | Error::UnsupportedGame(_) => {
                ErrorKind::Format
            }
            Error::Corrupt(_) => ErrorKind::Corrupt,
            Error::NotFound(_) | Error::NotADirectory(_) => ErrorKind::NotFound,
            Error::UnsupportedVersion { .. } => ErrorKind::UnsupportedVersion,
            Error::Decode { .. } | Error::Json(_) => ErrorKind::Decode,
        }
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Error::Corrupt(msg.into())
    }

    /// Owned copy of an error shared through a cache
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
            Error::Closed => Error::Closed,
            Error::Format(m) => Error::Format(m.clone()),
            Error::UnsupportedCompression(m) => Error::UnsupportedCompression(m.clone()),
            Error::Corrupt(m) => Error::Corrupt(m.clone()),
            Error::NotFound(m) => Error::NotFound(m.clone()),
            Error::NotADirectory(m) => Error::NotADirectory(m.clone()),
            Error::UnsupportedVersion { tag_type, version } => Error::UnsupportedVersion {
                tag_type: *tag_type,
                version: *version,
            },
            Error::UnsupportedGame(v) => Error::UnsupportedGame(*v),
            Error::Decode { node, source } => Error::Decode {
                node: *node,
                source: source.clone(),
            },
            Error::Json(e) => Error::Format(e.to_string()),
        }
    }
}

/// Result type alias for wadpack operations
pub type Result<T> = std::result::Result<T, Error>;
