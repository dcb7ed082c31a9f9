//! Error types for rezip.

use thiserror::Error;

/// Errors raised while reading, editing or writing an archive.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Remote source error: {0}")]
    Remote(String),

    #[error("Directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] globset::Error),

    #[error("Invalid ZIP file: {0}")]
    InvalidZip(String),

    #[error("ZIP64 archives are not supported")]
    Zip64Unsupported,

    #[error("Unsupported compression method: {0}")]
    UnsupportedCompression(u16),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Entry not found: {0}")]
    EntryNotFound(String),

    #[error("Invalid entry name '{name}': {reason}")]
    InvalidEntryName { name: String, reason: String },

    #[error("Archive is closed")]
    Closed,

    #[error("Archive is read-only")]
    ReadOnly,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Archive too large: {0}")]
    TooLarge(String),

    #[error("Failed to compress '{name}': {source}")]
    Background {
        name: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Background compression task was lost")]
    BackgroundTaskLost,

    #[error("Extensions keep resetting the central directory after {0} passes")]
    ExtensionLoop(usize),

    #[error("Extension error: {0}")]
    Extension(String),
}

pub type Result<T> = std::result::Result<T, Error>;
