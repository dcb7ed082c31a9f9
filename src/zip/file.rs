//! The archive engine: an open ZIP file that can be edited in place.

use std::collections::{HashMap, VecDeque};
use std::mem;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, trace, warn};
use walkdir::WalkDir;

use super::compressor::{Compressor, Deferred, ProcessedData};
use super::entry::StoredEntry;
use super::extension::{DeferredAction, ExtensionId, ZipEvent, ZipFileExtension};
use super::options::ZipFileOptions;
use super::parser::ZipParser;
use super::structures::*;
use super::use_map::FileUseMap;
use crate::error::{Error, Result};
use crate::io::{LocalFile, ReadAt};

/// Maximum number of times extensions may invalidate the central directory
/// during a single update.
pub const MAXIMUM_EXTENSION_CYCLE_COUNT: usize = 10;

const ZERO_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct EntryId(u64);

/// Owner of a used region of the file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Region {
    Entry(EntryId),
    CentralDirectory,
    Eocd,
}

enum Storage {
    /// Not on disk yet; created by the first update
    Unborn(PathBuf),
    Writable(Arc<LocalFile>),
    ReadOnly(Arc<dyn ReadAt>),
    Closed,
}

struct PendingEntry {
    /// What [`ZipFile::get`] hands out until the entry is placed
    entry: StoredEntry,
    data: Deferred,
    timestamp: (u16, u16),
}

/// Serialized directory or EOCD and where it goes
struct Record {
    offset: u64,
    bytes: Vec<u8>,
}

/// A ZIP archive open for incremental editing.
///
/// Entries are added, replaced and deleted in memory; [`update`](Self::update)
/// writes only what changed. Space freed by deleted or moved entries is
/// tracked and reused by later additions, and entry data can be aligned
/// to per-name boundaries.
///
/// ```no_run
/// use rezip::{AlignmentRules, CompressionMethod, ZipFile, ZipFileOptions};
///
/// # async fn demo() -> rezip::Result<()> {
/// let options = ZipFileOptions {
///     alignment: AlignmentRules::constant_for_suffix(".so", 4096),
///     ..Default::default()
/// };
/// let mut zip = ZipFile::open("app.apk", options).await?;
/// zip.add("lib/arm64-v8a/libnative.so", vec![0u8; 100], CompressionMethod::Stored)?;
/// zip.delete("classes2.dex")?;
/// zip.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct ZipFile {
    storage: Storage,
    options: ZipFileOptions,
    compressor: Compressor,
    map: FileUseMap<Region>,
    entries: HashMap<EntryId, StoredEntry>,
    names: HashMap<String, EntryId>,
    next_entry_id: u64,
    /// Added entries still being compressed, in add order
    pending: VecDeque<PendingEntry>,
    directory: Option<Record>,
    eocd: Option<Record>,
    comment: Vec<u8>,
    extra_directory_offset: u64,
    dirty: bool,
    extensions: Vec<(ExtensionId, Box<dyn ZipFileExtension>)>,
    next_extension_id: u64,
    to_run: VecDeque<DeferredAction>,
    notifying: bool,
}

impl ZipFile {
    /// Open the archive at `path`, or prepare a new one if it does not exist.
    ///
    /// A new archive is not written until [`update`](Self::update) or
    /// [`close`](Self::close).
    ///
    /// # Errors
    ///
    /// Fails if the file exists but is empty or is not a supported ZIP
    /// archive.
    pub async fn open(path: impl AsRef<Path>, options: ZipFileOptions) -> Result<Self> {
        let path = path.as_ref();

        if !tokio::fs::try_exists(path).await? {
            let mut zip = Self::with_storage(Storage::Unborn(path.to_path_buf()), options);
            zip.dirty = true;
            zip.apply_configured_offset();
            debug!(path = %path.display(), "new archive");
            return Ok(zip);
        }

        let (file, writable) =
            LocalFile::open_writable(path, options.read_only_if_source_read_only)?;
        let file = Arc::new(file);
        let storage = if writable {
            Storage::Writable(file.clone())
        } else {
            Storage::ReadOnly(file.clone())
        };

        let mut zip = Self::with_storage(storage, options);
        zip.read_archive(file).await?;
        zip.apply_configured_offset();
        debug!(
            path = %path.display(),
            entries = zip.entries.len(),
            writable,
            "opened archive"
        );
        Ok(zip)
    }

    /// Open a read-only archive over any random-access source.
    pub async fn open_reader(reader: Arc<dyn ReadAt>, options: ZipFileOptions) -> Result<Self> {
        let mut zip = Self::with_storage(Storage::ReadOnly(reader.clone()), options);
        zip.read_archive(reader).await?;
        debug!(entries = zip.entries.len(), "opened read-only archive");
        Ok(zip)
    }

    fn with_storage(storage: Storage, options: ZipFileOptions) -> Self {
        let compressor = Compressor::new(options.deflate_level, options.background_compression);
        let map = FileUseMap::new(0, min_free_size(&options));
        Self {
            storage,
            options,
            compressor,
            map,
            entries: HashMap::new(),
            names: HashMap::new(),
            next_entry_id: 0,
            pending: VecDeque::new(),
            directory: None,
            eocd: None,
            comment: Vec::new(),
            extra_directory_offset: 0,
            dirty: false,
            extensions: Vec::new(),
            next_extension_id: 0,
            to_run: VecDeque::new(),
            notifying: false,
        }
    }

    fn apply_configured_offset(&mut self) {
        if let Some(offset) = self.options.extra_directory_offset {
            if offset != self.extra_directory_offset && self.check_writable().is_ok() {
                self.extra_directory_offset = offset;
                self.delete_directory_and_eocd();
                self.dirty = true;
            }
        }
    }

    /// Parse an existing archive and build the file use map from it.
    async fn read_archive(&mut self, reader: Arc<dyn ReadAt>) -> Result<()> {
        let parser = ZipParser::new(reader.clone());
        if parser.size() == 0 {
            return Err(Error::InvalidZip("file is empty".to_string()));
        }
        self.map = FileUseMap::new(parser.size(), min_free_size(&self.options));

        let (eocd, eocd_offset) = parser.find_eocd().await?;
        parser.check_supported(&eocd, eocd_offset).await?;
        let (cd_bytes, headers) = parser.read_central_directory(&eocd, eocd_offset).await?;

        let cd_offset = eocd.cd_offset as u64;
        let eocd_bytes = eocd.to_bytes()?;
        self.map
            .add(eocd_offset, eocd_offset + eocd.record_size(), Region::Eocd)?;
        if !cd_bytes.is_empty() {
            self.map.add(
                cd_offset,
                cd_offset + cd_bytes.len() as u64,
                Region::CentralDirectory,
            )?;
        }

        let mut entries_end = 0;
        for header in headers {
            if header.is_directory() && header.uncompressed_size != 0 {
                return Err(Error::InvalidZip(format!(
                    "directory '{}' has data",
                    header.name
                )));
            }
            if self.names.contains_key(&header.name) {
                return Err(Error::InvalidZip(format!(
                    "duplicate entry '{}'",
                    header.name
                )));
            }

            let local_extra = parser.read_local_extra(&header).await?;
            let data_end = header.lfh_offset
                + LFH_SIZE as u64
                + header.encoded_name.len() as u64
                + local_extra.len() as u64
                + header.compressed_size;
            let data_descriptor = if header.flags.has_data_descriptor() {
                parser.read_data_descriptor(&header, data_end).await?
            } else {
                DataDescriptor::None
            };

            let name = header.name.clone();
            let start = header.lfh_offset;
            let entry =
                StoredEntry::from_archive(header, local_extra, data_descriptor, reader.clone());
            let end = start + entry.in_file_size();

            let id = self.next_entry_id();
            self.map.add(start, end, Region::Entry(id)).map_err(|_| {
                Error::InvalidZip(format!(
                    "entry '{}' at {}..{} overlaps other data",
                    name, start, end
                ))
            })?;
            entries_end = entries_end.max(end);
            self.names.insert(name, id);
            self.entries.insert(id, entry);
        }

        self.extra_directory_offset = cd_offset.saturating_sub(entries_end);
        self.comment = eocd.comment;
        self.directory = Some(Record {
            offset: cd_offset,
            bytes: cd_bytes,
        });
        self.eocd = Some(Record {
            offset: eocd_offset,
            bytes: eocd_bytes,
        });
        Ok(())
    }

    /// Live entry called `name`.
    ///
    /// The most recent addition wins, even while it is still being
    /// compressed: a pending replacement hides the entry it replaces.
    pub fn get(&self, name: &str) -> Option<&StoredEntry> {
        self.pending
            .iter()
            .rev()
            .find(|pending| pending.entry.name() == name)
            .map(|pending| &pending.entry)
            .or_else(|| self.names.get(name).and_then(|id| self.entries.get(id)))
    }

    /// Live entries: placed ones in file order, then those still being
    /// compressed in add order.
    pub fn entries(&self) -> Vec<&StoredEntry> {
        let mut latest: HashMap<&str, usize> = HashMap::new();
        for (index, pending) in self.pending.iter().enumerate() {
            latest.insert(pending.entry.name(), index);
        }

        let placed = self.map.used_blocks().filter_map(|(_, region)| match region {
            Region::Entry(id) => self
                .entries
                .get(&id)
                .filter(|entry| !latest.contains_key(entry.name())),
            _ => None,
        });
        let pending = self
            .pending
            .iter()
            .enumerate()
            .filter(|(index, pending)| latest.get(pending.entry.name()) == Some(index))
            .map(|(_, pending)| &pending.entry);

        placed.chain(pending).collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.pending.is_empty()
    }

    /// Whether there are changes not yet written by [`update`](Self::update)
    pub fn is_dirty(&self) -> bool {
        self.dirty || !self.pending.is_empty()
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self.storage, Storage::ReadOnly(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.storage, Storage::Closed)
    }

    pub fn options(&self) -> &ZipFileOptions {
        &self.options
    }

    /// Archive comment stored in the EOCD
    pub fn comment(&self) -> &[u8] {
        &self.comment
    }

    pub fn set_comment(&mut self, comment: impl Into<Vec<u8>>) -> Result<()> {
        self.check_writable()?;
        let comment = comment.into();
        if comment.len() > EndOfCentralDirectory::MAX_COMMENT_SIZE {
            return Err(Error::TooLarge(format!(
                "comment of {} bytes exceeds 65535",
                comment.len()
            )));
        }
        if comment != self.comment {
            self.comment = comment;
            self.delete_directory_and_eocd();
            self.dirty = true;
        }
        Ok(())
    }

    /// Total bytes tracked by the file use map
    pub fn tracked_size(&self) -> u64 {
        self.map.size()
    }

    /// Bytes used by entries, the central directory and the EOCD
    pub fn used_size(&self) -> u64 {
        self.map.used_size()
    }

    /// Add or replace an entry.
    ///
    /// Compression runs in the background when possible. The new entry is
    /// visible through [`get`](Self::get) right away, and takes its place
    /// in the file once compression finishes; an existing entry with the
    /// same name keeps its space until then. Directory entries (names
    /// ending in `/`) must be empty and are always stored.
    pub fn add(
        &mut self,
        name: &str,
        data: impl Into<Vec<u8>>,
        method: CompressionMethod,
    ) -> Result<()> {
        self.check_writable()?;
        let data = data.into();
        self.check_entry_name(name, &data)?;
        let method = if name.ends_with('/') {
            CompressionMethod::Stored
        } else {
            method
        };

        self.process_ready_entries()?;
        let timestamp = self.timestamp();
        let size = data.len() as u64;
        let deferred = self.compressor.submit(data, method);
        self.pending.push_back(PendingEntry {
            entry: StoredEntry::pending(name, method, size, timestamp, deferred.clone()),
            data: deferred,
            timestamp,
        });
        self.process_ready_entries()
    }

    /// Add a file, or a directory tree, from the local file system.
    ///
    /// A file is added under its file name. A directory contributes its
    /// contents under `/`-separated paths relative to it, with an entry
    /// for each subdirectory. `method_for` picks the compression method of
    /// each file.
    pub async fn add_recursively<F>(&mut self, path: &Path, method_for: F) -> Result<()>
    where
        F: Fn(&Path) -> CompressionMethod,
    {
        self.check_writable()?;

        if tokio::fs::metadata(path).await?.is_file() {
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .ok_or_else(|| Error::InvalidEntryName {
                    name: path.display().to_string(),
                    reason: "path has no file name".to_string(),
                })?;
            let data = tokio::fs::read(path).await?;
            return self.add(&name, data, method_for(path));
        }

        for dirent in WalkDir::new(path).min_depth(1).sort_by_file_name() {
            let dirent = dirent?;
            let relative = dirent
                .path()
                .strip_prefix(path)
                .map_err(|e| Error::InvalidState(e.to_string()))?;
            let mut name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            if dirent.file_type().is_dir() {
                name.push('/');
                self.add(&name, Vec::new(), CompressionMethod::Stored)?;
            } else if dirent.file_type().is_file() {
                let data = tokio::fs::read(dirent.path()).await?;
                self.add(&name, data, method_for(dirent.path()))?;
            }
        }
        Ok(())
    }

    /// Delete an entry. Entries of that name still being compressed are
    /// dropped as well.
    pub fn delete(&mut self, name: &str) -> Result<()> {
        self.check_writable()?;
        self.process_ready_entries()?;

        let pending_before = self.pending.len();
        self.pending.retain(|pending| pending.entry.name() != name);
        let dropped_pending = self.pending.len() != pending_before;

        match self.names.get(name).copied() {
            Some(id) => {
                let removed = self.remove_entry(id)?;
                debug!(name, "deleted entry");
                self.notify(&ZipEvent::Removed { entry: &removed })
            }
            None if dropped_pending => Ok(()),
            None => Err(Error::EntryNotFound(name.to_string())),
        }
    }

    /// Copy entries of `source` into this archive.
    ///
    /// Stored bytes are copied as they are, so compression method, CRC and
    /// sizes are preserved. Entries of `source` override entries with the
    /// same name here, except for names `ignore` accepts, which are
    /// skipped entirely. Entries already identical here are not copied.
    pub async fn merge_from<F>(&mut self, source: &mut ZipFile, ignore: F) -> Result<()>
    where
        F: Fn(&str) -> bool,
    {
        self.check_writable()?;
        source.finish_all_background_tasks().await?;
        self.finish_all_background_tasks().await?;

        let mut merged = 0usize;
        for entry in source.entries() {
            if ignore(entry.name()) {
                continue;
            }
            if let Some(existing) = self.get(entry.name()) {
                if existing.crc32() == entry.crc32()
                    && existing.compressed_size() == entry.compressed_size()
                    && existing.uncompressed_size() == entry.uncompressed_size()
                    && existing.compression_method() == entry.compression_method()
                {
                    continue;
                }
            }

            let copy = entry.detached().await?;
            self.add_to_entries(copy)?;
            merged += 1;
        }

        debug!(merged, "merged entries");
        Ok(())
    }

    /// Move entry `name` so that its data honors the alignment rules.
    ///
    /// Returns `false` if the entry was already aligned.
    pub async fn realign(&mut self, name: &str) -> Result<bool> {
        self.check_writable()?;
        self.finish_all_background_tasks().await?;
        let id = self
            .names
            .get(name)
            .copied()
            .ok_or_else(|| Error::EntryNotFound(name.to_string()))?;
        self.realign_entry(id).await
    }

    /// Realign every entry. Returns `true` if any entry moved.
    pub async fn realign_all(&mut self) -> Result<bool> {
        self.check_writable()?;
        self.finish_all_background_tasks().await?;

        let mut names: Vec<String> = self.names.keys().cloned().collect();
        names.sort();

        let mut moved = false;
        for name in names {
            if let Some(id) = self.names.get(&name).copied() {
                moved |= self.realign_entry(id).await?;
            }
        }
        Ok(moved)
    }

    async fn realign_entry(&mut self, id: EntryId) -> Result<bool> {
        let entry = self.entry(id)?;
        let start = self.start_of(id)?;
        let alignment = self.options.alignment.alignment(entry.name());
        if (start + entry.local_header_size()) % alignment == 0 {
            return Ok(false);
        }

        let moved = entry.detached().await?;
        debug!(name = moved.name(), alignment, "realigning entry");
        self.add_to_entries(moved)?;
        Ok(true)
    }

    /// Lay entries out in ascending name order.
    ///
    /// All stored bytes are loaded into memory and the whole archive is
    /// rewritten by the next update.
    pub async fn sort_zip_contents(&mut self) -> Result<()> {
        self.check_writable()?;
        self.finish_all_background_tasks().await?;

        let mut order: Vec<(String, EntryId)> = self
            .names
            .iter()
            .map(|(name, id)| (name.clone(), *id))
            .collect();
        order.sort();

        let mut sorted = Vec::with_capacity(order.len());
        for (_, id) in order {
            sorted.push((id, self.entry(id)?.detached().await?));
        }

        self.delete_directory_and_eocd();
        for (id, _) in &sorted {
            self.map.remove(&Region::Entry(*id));
        }
        self.map.truncate();

        for (id, entry) in sorted {
            let alignment = self.options.alignment.alignment(entry.name());
            let start = self.map.locate_tail(entry.local_header_size(), alignment);
            self.place(id, start, entry.in_file_size())?;
            self.entries.insert(id, entry);
        }

        self.dirty = true;
        debug!(entries = self.entries.len(), "sorted archive contents");
        Ok(())
    }

    /// Reserve `offset` bytes between the last entry and the central
    /// directory.
    pub fn set_extra_directory_offset(&mut self, offset: u64) -> Result<()> {
        self.check_writable()?;
        if offset != self.extra_directory_offset {
            self.extra_directory_offset = offset;
            self.delete_directory_and_eocd();
            self.dirty = true;
        }
        Ok(())
    }

    pub fn extra_directory_offset(&self) -> u64 {
        self.extra_directory_offset
    }

    /// Force the next update to write the archive
    pub fn touch(&mut self) -> Result<()> {
        self.check_writable()?;
        self.dirty = true;
        Ok(())
    }

    /// Offset of the central directory, while it is up to date
    pub fn central_directory_offset(&self) -> Option<u64> {
        self.directory.as_ref().map(|record| record.offset)
    }

    pub fn central_directory_size(&self) -> Option<u64> {
        self.directory
            .as_ref()
            .map(|record| record.bytes.len() as u64)
    }

    /// Offset of the EOCD record, while it is up to date
    pub fn eocd_offset(&self) -> Option<u64> {
        self.eocd.as_ref().map(|record| record.offset)
    }

    pub fn eocd_size(&self) -> Option<u64> {
        self.eocd.as_ref().map(|record| record.bytes.len() as u64)
    }

    /// Bytes of the central directory, as written by the current update.
    ///
    /// Available from [`ZipEvent::EntriesWritten`] on, and after an update
    /// until the next change.
    pub fn central_directory_bytes(&self) -> Result<Vec<u8>> {
        self.directory
            .as_ref()
            .map(|record| record.bytes.clone())
            .ok_or_else(|| {
                Error::InvalidState("central directory has not been computed".to_string())
            })
    }

    /// Bytes of the EOCD record, as written by the current update.
    pub fn eocd_bytes(&self) -> Result<Vec<u8>> {
        self.eocd
            .as_ref()
            .map(|record| record.bytes.clone())
            .ok_or_else(|| Error::InvalidState("EOCD has not been computed".to_string()))
    }

    /// Write `data` straight into the archive file at `offset`.
    ///
    /// Meant for the space reserved by the extra directory offset, such as
    /// a signing block written while handling
    /// [`ZipEvent::EntriesWritten`]. Nothing checks that the range is free,
    /// and the bytes are not tracked: later updates may reuse the space
    /// unless it stays reserved. The write completes before returning, so
    /// extensions may call this from their notifications.
    pub fn direct_write(&self, offset: u64, data: &[u8]) -> Result<()> {
        match &self.storage {
            Storage::Writable(file) => file.write_all_at_blocking(offset, data),
            Storage::Unborn(_) => Err(Error::InvalidState(
                "archive has not been written yet".to_string(),
            )),
            Storage::ReadOnly(_) => Err(Error::ReadOnly),
            Storage::Closed => Err(Error::Closed),
        }
    }

    /// Read raw bytes of the archive file at `offset`.
    ///
    /// Returns the number of bytes read, which is short only at the end of
    /// the file.
    pub async fn direct_read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let reader: &dyn ReadAt = match &self.storage {
            Storage::Writable(file) => &**file,
            Storage::ReadOnly(reader) => &**reader,
            Storage::Unborn(_) => {
                return Err(Error::InvalidState(
                    "archive has not been written yet".to_string(),
                ));
            }
            Storage::Closed => return Err(Error::Closed),
        };

        let available = reader.size().saturating_sub(offset);
        let len = buf.len().min(usize::try_from(available).unwrap_or(usize::MAX));
        reader.read_exact_at(offset, &mut buf[..len]).await?;
        Ok(len)
    }

    /// Wait for all background compression and place the results.
    ///
    /// The first failed job is reported here.
    pub async fn finish_all_background_tasks(&mut self) -> Result<()> {
        self.process_ready_entries()?;
        while let Some(pending) = self.pending.pop_front() {
            let result = pending.data.wait().await;
            self.place_processed(pending.entry.name(), pending.timestamp, result)?;
            self.process_ready_entries()?;
        }
        Ok(())
    }

    /// Write all changes to disk.
    ///
    /// Does nothing when nothing changed. Entry data is written before the
    /// new central directory, so an I/O failure part way leaves earlier
    /// entry bytes in place.
    pub async fn update(&mut self) -> Result<()> {
        self.check_open()?;
        self.finish_all_background_tasks().await?;
        if !self.dirty {
            return Ok(());
        }

        self.notify(&ZipEvent::BeforeUpdate)?;
        self.finish_all_background_tasks().await?;

        let file = self.writable_file()?;
        if self.options.auto_sort_files {
            self.sort_zip_contents().await?;
        }

        self.delete_directory_and_eocd();
        self.map.truncate();
        if self.options.cover_empty_space_using_extra_field {
            self.cover_empty_space()?;
        }

        let mut cycles = 0;
        loop {
            self.finish_all_background_tasks().await?;
            self.write_pending_entries(&file).await?;
            self.compute_central_directory()?;
            self.compute_eocd()?;
            // Extensions may fill the reserved space from here on
            zero_areas(&file, self.map.free_areas()).await?;
            self.notify(&ZipEvent::EntriesWritten)?;

            if self.eocd.is_some() && self.pending.is_empty() {
                break;
            }
            cycles += 1;
            if cycles >= MAXIMUM_EXTENSION_CYCLE_COUNT {
                return Err(Error::ExtensionLoop(MAXIMUM_EXTENSION_CYCLE_COUNT));
            }
        }

        self.write_directory(&file).await?;
        self.dirty = false;
        debug!(
            entries = self.entries.len(),
            size = self.map.size(),
            "archive updated"
        );
        self.notify(&ZipEvent::Updated)
    }

    /// Update the archive and release it.
    ///
    /// The archive is closed even if the update fails. Closing twice is a
    /// no-op.
    pub async fn close(&mut self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }

        let result = self.update().await;
        self.storage = Storage::Closed;
        result?;

        debug!("archive closed");
        self.notify(&ZipEvent::Closed)
    }

    /// Register an extension; it is notified after those registered before it.
    pub fn register_extension<E>(&mut self, extension: E) -> ExtensionId
    where
        E: ZipFileExtension + 'static,
    {
        let id = ExtensionId(self.next_extension_id);
        self.next_extension_id += 1;
        self.extensions.push((id, Box::new(extension)));
        id
    }

    /// Remove an extension. Returns `false` if it was not registered.
    pub fn unregister_extension(&mut self, id: ExtensionId) -> bool {
        let before = self.extensions.len();
        self.extensions.retain(|(registered, _)| *registered != id);
        self.extensions.len() != before
    }

    fn check_open(&self) -> Result<()> {
        match self.storage {
            Storage::Closed => Err(Error::Closed),
            _ => Ok(()),
        }
    }

    fn check_writable(&self) -> Result<()> {
        match self.storage {
            Storage::Closed => Err(Error::Closed),
            Storage::ReadOnly(_) => Err(Error::ReadOnly),
            _ => Ok(()),
        }
    }

    fn check_entry_name(&self, name: &str, data: &[u8]) -> Result<()> {
        let invalid = |reason: &str| {
            Err(Error::InvalidEntryName {
                name: name.to_string(),
                reason: reason.to_string(),
            })
        };

        if name.is_empty() || name == "/" {
            return invalid("name is empty");
        }
        if name.starts_with('/') {
            return invalid("name must be relative");
        }
        if name.len() > u16::MAX as usize {
            return invalid("name is longer than 65535 bytes");
        }
        if name.ends_with('/') && !data.is_empty() {
            return invalid("directories cannot have data");
        }

        let twin = match name.strip_suffix('/') {
            Some(file) => file.to_string(),
            None => format!("{}/", name),
        };
        if self.names.contains_key(&twin)
            || self.pending.iter().any(|pending| pending.entry.name() == twin)
        {
            return invalid(&format!("collides with existing entry '{}'", twin));
        }
        Ok(())
    }

    fn timestamp(&self) -> (u16, u16) {
        if self.options.no_timestamps {
            DOS_EPOCH
        } else {
            dos_date_time(SystemTime::now())
        }
    }

    fn next_entry_id(&mut self) -> EntryId {
        let id = EntryId(self.next_entry_id);
        self.next_entry_id += 1;
        id
    }

    fn entry(&self, id: EntryId) -> Result<&StoredEntry> {
        self.entries
            .get(&id)
            .ok_or_else(|| Error::InvalidState(format!("unknown entry {:?}", id)))
    }

    fn start_of(&self, id: EntryId) -> Result<u64> {
        self.map
            .range_of(&Region::Entry(id))
            .map(|range| range.start)
            .ok_or_else(|| Error::InvalidState(format!("entry {:?} is not placed", id)))
    }

    /// Place entries whose compression finished, in add order.
    fn process_ready_entries(&mut self) -> Result<()> {
        while let Some(front) = self.pending.front() {
            let Some(result) = front.data.try_take() else {
                break;
            };
            let Some(pending) = self.pending.pop_front() else {
                break;
            };
            self.place_processed(pending.entry.name(), pending.timestamp, result)?;
        }
        Ok(())
    }

    fn place_processed(
        &mut self,
        name: &str,
        timestamp: (u16, u16),
        result: Result<ProcessedData>,
    ) -> Result<()> {
        let processed = result.map_err(|e| Error::Background {
            name: name.to_string(),
            source: Box::new(e),
        })?;
        self.add_to_entries(StoredEntry::from_processed(name, processed, timestamp))
    }

    /// Make `entry` live, replacing any entry with the same name.
    fn add_to_entries(&mut self, entry: StoredEntry) -> Result<()> {
        let replaced = match self.names.get(entry.name()).copied() {
            Some(old) => Some(self.remove_entry(old)?),
            None => None,
        };

        let id = self.next_entry_id();
        self.position_in_file(id, &entry)?;
        trace!(
            name = entry.name(),
            start = ?self.map.range_of(&Region::Entry(id)),
            "placed entry"
        );

        let added = entry.clone();
        self.names.insert(entry.name().to_string(), id);
        self.entries.insert(id, entry);
        self.dirty = true;
        self.notify(&ZipEvent::Added {
            entry: &added,
            replaced: replaced.as_ref(),
        })
    }

    fn remove_entry(&mut self, id: EntryId) -> Result<StoredEntry> {
        let entry = self
            .entries
            .remove(&id)
            .ok_or_else(|| Error::InvalidState(format!("unknown entry {:?}", id)))?;
        self.names.remove(entry.name());
        self.map.remove(&Region::Entry(id));
        self.delete_directory_and_eocd();
        self.dirty = true;
        Ok(entry)
    }

    fn position_in_file(&mut self, id: EntryId, entry: &StoredEntry) -> Result<()> {
        self.delete_directory_and_eocd();
        let alignment = self.options.alignment.alignment(entry.name());
        let start = self.map.locate_free(
            entry.in_file_size(),
            entry.local_header_size(),
            alignment,
            self.options.position_algorithm,
        );
        self.place(id, start, entry.in_file_size())
    }

    fn place(&mut self, id: EntryId, start: u64, len: u64) -> Result<()> {
        let end = start + len;
        if end > self.map.size() {
            self.map.extend(end)?;
        }
        self.map.add(start, end, Region::Entry(id))
    }

    fn delete_directory_and_eocd(&mut self) {
        if self.directory.take().is_some() {
            self.map.remove(&Region::CentralDirectory);
        }
        if self.eocd.take().is_some() {
            self.map.remove(&Region::Eocd);
        }
    }

    /// File to write to, creating it on first use.
    fn writable_file(&mut self) -> Result<Arc<LocalFile>> {
        match &self.storage {
            Storage::Writable(file) => Ok(file.clone()),
            Storage::Unborn(path) => {
                let path = path.clone();
                let file = Arc::new(LocalFile::create(&path)?);
                debug!(path = %path.display(), "created archive");
                self.storage = Storage::Writable(file.clone());
                self.notify(&ZipEvent::Open)?;
                Ok(file)
            }
            Storage::ReadOnly(_) => Err(Error::ReadOnly),
            Storage::Closed => Err(Error::Closed),
        }
    }

    /// Grow entries over the free gaps in front of them, padding their
    /// local extra field with an alignment block.
    fn cover_empty_space(&mut self) -> Result<()> {
        let placed: Vec<(u64, EntryId)> = self
            .map
            .used_blocks()
            .filter_map(|(range, region)| match region {
                Region::Entry(id) => Some((range.start, id)),
                _ => None,
            })
            .collect();

        for (start, id) in placed {
            let Some(gap) = self.map.free_before(start) else {
                continue;
            };
            let entry = self.entry(id)?;
            let gap_len = (gap.end - gap.start) as usize;
            if entry.data_descriptor() != DataDescriptor::None
                || gap_len < ALIGNMENT_EXTRA_MIN_SIZE
                || entry.local_extra().len() + gap_len > u16::MAX as usize
            {
                continue;
            }

            let alignment = self.options.alignment.alignment(entry.name());
            let mut local_extra = entry.local_extra().to_vec();
            local_extra.extend(alignment_extra_block(gap_len, alignment)?);
            let len = entry.in_file_size() + gap_len as u64;

            self.map.remove(&Region::Entry(id));
            self.map.add(gap.start, gap.start + len, Region::Entry(id))?;
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.set_local_extra(local_extra);
            }
            trace!(gap = ?gap, "covered empty space");
        }
        Ok(())
    }

    /// Write entries whose on-disk bytes are missing or stale.
    async fn write_pending_entries(&mut self, file: &Arc<LocalFile>) -> Result<()> {
        let stale: Vec<(u64, EntryId)> = self
            .map
            .used_blocks()
            .filter_map(|(range, region)| match region {
                Region::Entry(id) => Some((range.start, id)),
                _ => None,
            })
            .filter(|(start, id)| {
                self.entries
                    .get(id)
                    .is_some_and(|entry| !entry.is_written_at(*start))
            })
            .collect();

        for (offset, id) in stale {
            let entry = self.entry(id)?;
            let header = entry.local_header_bytes()?;
            let raw = entry.read_raw().await?;
            trace!(name = entry.name(), offset, size = raw.len(), "writing entry");

            file.write_all_at(offset, &header).await?;
            file.write_all_at(offset + header.len() as u64, &raw).await?;

            let archive: Arc<dyn ReadAt> = file.clone();
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.mark_written(offset, archive);
            }
        }
        Ok(())
    }

    /// Serialize the central directory after the last entry plus the
    /// extra directory offset, and reserve its space.
    fn compute_central_directory(&mut self) -> Result<()> {
        self.delete_directory_and_eocd();
        self.map.truncate();

        let mut bytes = Vec::new();
        for (range, region) in self.map.used_blocks() {
            let Region::Entry(id) = region else {
                continue;
            };
            let entry = self.entry(id)?;
            if !entry.is_written_at(range.start) {
                return Err(Error::InvalidState(format!(
                    "entry '{}' has not been written",
                    entry.name()
                )));
            }
            entry.header().write_to(&mut bytes)?;
        }

        let offset = self.map.size() + self.extra_directory_offset;
        let end = offset + bytes.len() as u64;
        self.map.extend(end)?;
        if !bytes.is_empty() {
            self.map.add(offset, end, Region::CentralDirectory)?;
        }
        self.directory = Some(Record { offset, bytes });
        Ok(())
    }

    fn compute_eocd(&mut self) -> Result<()> {
        let directory = self.directory.as_ref().ok_or_else(|| {
            Error::InvalidState("central directory has not been computed".to_string())
        })?;

        let total_entries = u16::try_from(self.entries.len()).map_err(|_| {
            Error::TooLarge(format!("{} entries need ZIP64", self.entries.len()))
        })?;
        let cd_offset = u32::try_from(directory.offset).map_err(|_| {
            Error::TooLarge(format!("central directory offset {} needs ZIP64", directory.offset))
        })?;
        let cd_size = u32::try_from(directory.bytes.len()).map_err(|_| {
            Error::TooLarge(format!(
                "central directory of {} bytes needs ZIP64",
                directory.bytes.len()
            ))
        })?;

        let bytes = EndOfCentralDirectory::new(total_entries, cd_offset, cd_size, self.comment.clone())
            .to_bytes()?;
        let offset = self.map.size();
        let end = offset + bytes.len() as u64;
        self.map.extend(end)?;
        self.map.add(offset, end, Region::Eocd)?;
        self.eocd = Some(Record { offset, bytes });
        Ok(())
    }

    /// Write the directory and EOCD, and cut the file.
    async fn write_directory(&mut self, file: &Arc<LocalFile>) -> Result<()> {
        let (Some(directory), Some(eocd)) = (&self.directory, &self.eocd) else {
            return Err(Error::InvalidState(
                "central directory has not been computed".to_string(),
            ));
        };
        file.write_all_at(directory.offset, &directory.bytes).await?;
        file.write_all_at(eocd.offset, &eocd.bytes).await?;
        file.set_len(self.map.size()).await?;
        Ok(())
    }

    /// Run a notification pass, then, from the outermost pass only, the
    /// deferred actions it collected.
    fn notify(&mut self, event: &ZipEvent<'_>) -> Result<()> {
        if self.notifying {
            return self.dispatch(event);
        }

        self.notifying = true;
        let result = self.dispatch(event).and_then(|()| {
            while let Some(action) = self.to_run.pop_front() {
                action(self)?;
            }
            Ok(())
        });
        self.notifying = false;

        if result.is_err() {
            self.to_run.clear();
        }
        result
    }

    fn dispatch(&mut self, event: &ZipEvent<'_>) -> Result<()> {
        let mut extensions = mem::take(&mut self.extensions);
        let mut result = Ok(());
        for (_, extension) in extensions.iter_mut() {
            match extension.notify(self, event) {
                Ok(Some(action)) => self.to_run.push_back(action),
                Ok(None) => {}
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        self.extensions = extensions;
        result
    }
}

impl Drop for ZipFile {
    fn drop(&mut self) {
        if self.is_dirty() && self.check_writable().is_ok() {
            warn!("archive dropped with unsaved changes; call close() to write them");
        }
    }
}

fn min_free_size(options: &ZipFileOptions) -> u64 {
    if options.cover_empty_space_using_extra_field {
        ALIGNMENT_EXTRA_MIN_SIZE as u64
    } else {
        0
    }
}

/// Zero the gaps between entries and the space reserved in front of the
/// central directory.
async fn zero_areas(file: &LocalFile, areas: Vec<Range<u64>>) -> Result<()> {
    let zeros = vec![0u8; ZERO_CHUNK];
    for area in areas {
        let mut offset = area.start;
        while offset < area.end {
            let n = ((area.end - offset) as usize).min(ZERO_CHUNK);
            file.write_all_at(offset, &zeros[..n]).await?;
            offset += n as u64;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ZipFileOptions {
        ZipFileOptions {
            no_timestamps: true,
            background_compression: false,
            ..Default::default()
        }
    }

    /// Queue a job as `add` would, but with a prepared outcome
    fn queue(zip: &mut ZipFile, name: &str, data: Deferred) {
        zip.pending.push_back(PendingEntry {
            entry: StoredEntry::pending(name, CompressionMethod::Stored, 3, DOS_EPOCH, data.clone()),
            data,
            timestamp: DOS_EPOCH,
        });
    }

    fn lost(err: &Error, expected: &str) -> bool {
        matches!(
            err,
            Error::Background { name, source }
                if name == expected && matches!(**source, Error::BackgroundTaskLost)
        )
    }

    #[tokio::test]
    async fn test_lost_job_fails_the_next_sync_point() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.zip");
        let mut zip = ZipFile::open(&path, options()).await.unwrap();
        zip.add("a", b"aaa".to_vec(), CompressionMethod::Stored)
            .unwrap();

        queue(&mut zip, "b", Deferred::abandoned());
        assert!(zip.get("b").is_some());
        let err = zip.get("b").unwrap().read().await.unwrap_err();
        assert!(lost(&err, "b"));

        let err = zip.finish_all_background_tasks().await.unwrap_err();
        assert!(lost(&err, "b"));
        assert!(zip.get("b").is_none());
        assert!(zip.get("a").is_some());

        queue(&mut zip, "c", Deferred::abandoned());
        let err = zip.update().await.unwrap_err();
        assert!(lost(&err, "c"));
        assert!(!path.exists());

        queue(&mut zip, "d", Deferred::abandoned());
        let err = zip
            .add("e", b"eee".to_vec(), CompressionMethod::Stored)
            .unwrap_err();
        assert!(lost(&err, "d"));

        zip.close().await.unwrap();
        let zip = ZipFile::open(&path, options()).await.unwrap();
        assert!(zip.get("a").is_some());
        assert!(zip.get("e").is_none());
    }

    #[tokio::test]
    async fn test_failed_job_is_reported_with_its_cause() {
        let dir = tempfile::tempdir().unwrap();
        let mut zip = ZipFile::open(dir.path().join("a.zip"), options())
            .await
            .unwrap();
        queue(&mut zip, "broken", Deferred::failed("out of memory"));

        match zip.update().await {
            Err(Error::Background { name, source }) => {
                assert_eq!(name, "broken");
                assert!(matches!(*source, Error::Compression(ref message) if message == "out of memory"));
            }
            other => panic!("expected a background failure, got {:?}", other),
        }
        assert!(zip.is_empty());
    }

    #[tokio::test]
    async fn test_sorting_orders_entries_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut zip = ZipFile::open(dir.path().join("a.zip"), options())
            .await
            .unwrap();
        for name in ["c", "a", "b"] {
            zip.add(name, name.as_bytes().to_vec(), CompressionMethod::Stored)
                .unwrap();
        }

        zip.sort_zip_contents().await.unwrap();
        let names: Vec<&str> = zip.entries().iter().map(|entry| entry.name()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        zip.close().await.unwrap();
    }
}
