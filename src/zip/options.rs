use super::alignment::AlignmentRules;
use super::use_map::PositionAlgorithm;

/// Default deflate level for new entries
pub const DEFAULT_DEFLATE_LEVEL: u32 = 6;

/// Options controlling how a [`ZipFile`](super::ZipFile) places and writes entries.
#[derive(Debug, Clone)]
pub struct ZipFileOptions {
    /// Alignment required for entry data, by entry name
    pub alignment: AlignmentRules,
    /// Sort entries by name before every update
    pub auto_sort_files: bool,
    /// Bytes to reserve between the last entry and the central directory.
    /// `None` keeps whatever the opened file has.
    pub extra_directory_offset: Option<u64>,
    /// Open non-writable files read-only instead of failing
    pub read_only_if_source_read_only: bool,
    /// Stamp new entries with 1980-01-01 00:00 instead of the current time
    pub no_timestamps: bool,
    /// Absorb gaps in front of entries into their local extra field
    pub cover_empty_space_using_extra_field: bool,
    /// Compress new entries on the blocking thread pool
    pub background_compression: bool,
    /// Deflate level, 0-9
    pub deflate_level: u32,
    pub position_algorithm: PositionAlgorithm,
}

impl Default for ZipFileOptions {
    fn default() -> Self {
        Self {
            alignment: AlignmentRules::default(),
            auto_sort_files: false,
            extra_directory_offset: None,
            read_only_if_source_read_only: true,
            no_timestamps: false,
            cover_empty_space_using_extra_field: false,
            background_compression: true,
            deflate_level: DEFAULT_DEFLATE_LEVEL,
            position_algorithm: PositionAlgorithm::default(),
        }
    }
}
