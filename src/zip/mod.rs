//! ZIP archive reading and in-place editing.
//!
//! ## Architecture
//!
//! - [`structures`]: binary layout of ZIP records (EOCD, headers, extra fields)
//! - [`parser`]: locating and decoding those records in an existing archive
//! - [`FileUseMap`]: which byte ranges of the file are used, and by what
//! - [`ZipFile`]: the editing engine, built on the three above
//! - [`ZipFileExtension`]: lifecycle hooks for code that amends an archive
//! - [`ZipExtractor`]: writing entries out
//!
//! ## Layout
//!
//! An archive is a sequence of local headers with their data, followed by
//! the central directory and the End of Central Directory (EOCD) record.
//! Entries need not be contiguous: gaps left by deleted or moved entries
//! are tracked as free space and reused. Gaps are zero-filled on write.
//!
//! ## Supported Features
//!
//! - STORED and DEFLATE compression methods
//! - Per-name data alignment through padding extra fields
//! - Reading entries that use data descriptors
//!
//! ## Limitations
//!
//! - No ZIP64, archives are limited to 4 GiB and 65535 entries
//! - No encryption support
//! - No multi-disk archive support

mod alignment;
mod compressor;
mod entry;
mod extension;
mod extractor;
mod file;
mod options;
mod parser;
pub mod structures;
mod use_map;

pub use alignment::{AlignmentRules, NO_ALIGNMENT};
pub use compressor::{ProcessedData, process};
pub use entry::{EntryKind, StoredEntry};
pub use extension::{DeferredAction, ExtensionId, ZipEvent, ZipFileExtension, deferred};
pub use extractor::ZipExtractor;
pub use file::{MAXIMUM_EXTENSION_CYCLE_COUNT, ZipFile};
pub use options::{DEFAULT_DEFLATE_LEVEL, ZipFileOptions};
pub use parser::ZipParser;
pub use structures::*;
pub use use_map::{FileUseMap, PositionAlgorithm};
