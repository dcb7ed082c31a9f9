//! # rezip
//!
//! Incremental, in-place editing of ZIP archives.
//!
//! Opening an archive reads only its central directory. Entries can then be
//! added, replaced or deleted, and [`ZipFile::update`] rewrites only the
//! bytes that changed: new entries go into free space left by deleted ones
//! when they fit, and existing entries are not moved unless asked to. This
//! makes it suitable for repacking large archives such as Android APKs,
//! where the data of selected entries must also start at aligned offsets.
//!
//! ## Features
//!
//! - Add, replace and delete entries without rewriting the archive
//! - Per-name alignment of entry data, with realignment of existing entries
//! - Background compression on tokio's blocking pool
//! - Merging entries from other archives, local or remote (HTTP Range requests)
//! - Extensions that observe and amend the archive before it is written
//!
//! ## Example
//!
//! ```no_run
//! use rezip::{AlignmentRules, CompressionMethod, ZipFile, ZipFileOptions};
//!
//! #[tokio::main]
//! async fn main() -> rezip::Result<()> {
//!     let options = ZipFileOptions {
//!         alignment: AlignmentRules::constant_for_suffix(".so", 4096),
//!         ..Default::default()
//!     };
//!     let mut zip = ZipFile::open("app.apk", options).await?;
//!
//!     zip.add("assets/config.json", br#"{"debug":false}"#.to_vec(), CompressionMethod::Deflate)?;
//!     zip.delete("assets/old.json")?;
//!     zip.close().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod error;
pub mod io;
pub mod zip;

pub use cli::Cli;
pub use error::{Error, Result};
pub use io::{HttpRangeReader, LocalFile, MemoryReader, ReadAt};
pub use zip::{
    AlignmentRules, CompressionMethod, DataDescriptor, DeferredAction, EntryKind, ExtensionId,
    FileUseMap, MAXIMUM_EXTENSION_CYCLE_COUNT, NO_ALIGNMENT, PositionAlgorithm, StoredEntry,
    ZipEvent, ZipExtractor, ZipFile, ZipFileExtension, ZipFileOptions, ZipParser, deferred,
};
