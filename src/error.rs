//! Error types shared by the library.
//!
//! Failures that happen while processing a single image (I/O, recognition)
//! are normally captured on that image's record instead of being returned;
//! see [`crate::processor`]. What reaches the caller through [`Error`] is
//! either malformed input or a store that can no longer honour write-through.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache store {} is corrupted: {reason}", path.display())]
    CacheCorrupted { path: PathBuf, reason: String },

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("image {} could not be processed: {reason}", path.display())]
    ImageFailed { path: PathBuf, reason: String },

    #[error("store error: {0}")]
    Store(#[from] heed::Error),

    #[error("invalid field rule: {0}")]
    Rule(#[from] regex::Error),

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}
