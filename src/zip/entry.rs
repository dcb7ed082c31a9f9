//! Entries of an archive and where their bytes come from.

use flate2::read::DeflateDecoder;
use std::fmt;
use std::io::{Cursor, Read};
use std::sync::Arc;

use super::compressor::{Deferred, ProcessedData};
use super::structures::{
    CentralDirectoryHeader, CompressionMethod, DataDescriptor, LFH_SIZE, LocalFileHeader,
    strip_alignment_blocks,
};
use crate::error::{Error, Result};
use crate::io::ReadAt;

/// Whether an entry is a file or a directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// Where the stored (possibly compressed) bytes of an entry live
#[derive(Clone)]
pub(crate) enum RawSource {
    /// Produced by compression or loaded for a move, not yet on disk
    Memory(Arc<Vec<u8>>),
    /// Inside an archive, starting at `offset`
    Reader { reader: Arc<dyn ReadAt>, offset: u64 },
    /// Still being compressed
    Pending(Deferred),
}

/// An entry of a [`ZipFile`](super::ZipFile).
///
/// Entries handed out by the archive are snapshots: they stay readable
/// after the archive moves on, but do not reflect later edits.
///
/// An entry that was just added may still be compressing
/// ([`is_pending`](Self::is_pending)). Reading it waits for compression;
/// its CRC and compressed size read as 0 until compression finishes.
#[derive(Clone)]
pub struct StoredEntry {
    header: CentralDirectoryHeader,
    kind: EntryKind,
    local_extra: Vec<u8>,
    data_descriptor: DataDescriptor,
    source: RawSource,
    /// Local header offset of the bytes on disk, if they are current
    written_offset: Option<u64>,
}

impl StoredEntry {
    /// Entry for freshly compressed data, not yet placed.
    pub(crate) fn from_processed(
        name: &str,
        processed: ProcessedData,
        timestamp: (u16, u16),
    ) -> Self {
        let header = CentralDirectoryHeader::new(
            name,
            processed.method,
            processed.crc32,
            processed.raw.len() as u64,
            processed.uncompressed_size,
            timestamp,
        );
        Self {
            kind: kind_of(&header),
            header,
            local_extra: Vec::new(),
            data_descriptor: DataDescriptor::None,
            source: RawSource::Memory(processed.raw),
            written_offset: None,
        }
    }

    /// Entry whose data is still being compressed.
    pub(crate) fn pending(
        name: &str,
        method: CompressionMethod,
        uncompressed_size: u64,
        timestamp: (u16, u16),
        data: Deferred,
    ) -> Self {
        let header =
            CentralDirectoryHeader::new(name, method, 0, 0, uncompressed_size, timestamp);
        Self {
            kind: kind_of(&header),
            header,
            local_extra: Vec::new(),
            data_descriptor: DataDescriptor::None,
            source: RawSource::Pending(data),
            written_offset: None,
        }
    }

    /// Entry found in an existing archive.
    pub(crate) fn from_archive(
        header: CentralDirectoryHeader,
        local_extra: Vec<u8>,
        data_descriptor: DataDescriptor,
        reader: Arc<dyn ReadAt>,
    ) -> Self {
        let offset = header.lfh_offset;
        let data_offset =
            offset + LFH_SIZE as u64 + header.encoded_name.len() as u64 + local_extra.len() as u64;
        Self {
            kind: kind_of(&header),
            header,
            local_extra,
            data_descriptor,
            source: RawSource::Reader {
                reader,
                offset: data_offset,
            },
            written_offset: Some(offset),
        }
    }

    /// Name of the entry, `/`-terminated for directories
    pub fn name(&self) -> &str {
        &self.header.name
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Central directory header of the entry
    pub fn header(&self) -> &CentralDirectoryHeader {
        &self.header
    }

    pub fn compression_method(&self) -> CompressionMethod {
        self.header.compression_method
    }

    pub fn crc32(&self) -> u32 {
        self.settled().map_or(self.header.crc32, |processed| processed.crc32)
    }

    pub fn compressed_size(&self) -> u64 {
        self.settled()
            .map_or(self.header.compressed_size, |processed| processed.raw.len() as u64)
    }

    /// Whether compression of the entry data has not finished yet
    pub fn is_pending(&self) -> bool {
        matches!(&self.source, RawSource::Pending(data) if data.peek().is_none())
    }

    pub fn uncompressed_size(&self) -> u64 {
        self.header.uncompressed_size
    }

    /// Extra field of the local header
    pub fn local_extra(&self) -> &[u8] {
        &self.local_extra
    }

    pub fn data_descriptor(&self) -> DataDescriptor {
        self.data_descriptor
    }

    /// Offset of the local header on disk, or `None` if not written yet
    pub fn offset(&self) -> Option<u64> {
        self.written_offset
    }

    /// Offset of the entry data on disk, or `None` if not written yet
    pub fn data_offset(&self) -> Option<u64> {
        self.written_offset
            .map(|offset| offset + self.local_header_size())
    }

    /// Size of the local header, name and extra field included
    pub fn local_header_size(&self) -> u64 {
        LFH_SIZE as u64 + self.header.encoded_name.len() as u64 + self.local_extra.len() as u64
    }

    /// Bytes the entry occupies in the archive, header to data descriptor
    pub fn in_file_size(&self) -> u64 {
        self.local_header_size() + self.header.compressed_size + self.data_descriptor.size()
    }

    /// Read the stored bytes, without decompressing them.
    ///
    /// Waits for compression of a pending entry.
    pub async fn read_raw(&self) -> Result<Vec<u8>> {
        match &self.source {
            RawSource::Memory(raw) => Ok(raw.as_ref().clone()),
            RawSource::Pending(data) => {
                let processed = data.wait().await.map_err(|e| Error::Background {
                    name: self.header.name.clone(),
                    source: Box::new(e),
                })?;
                Ok(processed.raw.as_ref().clone())
            }
            RawSource::Reader { reader, offset } => {
                let len = usize::try_from(self.header.compressed_size)
                    .map_err(|_| Error::TooLarge(self.header.name.clone()))?;
                let mut buf = vec![0u8; len];
                reader.read_exact_at(*offset, &mut buf).await?;
                Ok(buf)
            }
        }
    }

    /// Read and decompress the whole entry, verifying its CRC-32.
    pub async fn read(&self) -> Result<Vec<u8>> {
        self.ensure_file()?;
        let mut data = Vec::with_capacity(self.header.uncompressed_size.min(1 << 26) as usize);
        self.open().await?.read_to_end(&mut data).map_err(|e| {
            Error::Decompression(format!("{}: {}", self.header.name, e))
        })?;

        if data.len() as u64 != self.header.uncompressed_size {
            return Err(Error::InvalidZip(format!(
                "'{}' inflated to {} bytes, expected {}",
                self.header.name,
                data.len(),
                self.header.uncompressed_size
            )));
        }
        if crc32fast::hash(&data) != self.crc32() {
            return Err(Error::InvalidZip(format!(
                "CRC mismatch in '{}'",
                self.header.name
            )));
        }
        Ok(data)
    }

    /// Open a decompressing reader over the entry.
    ///
    /// The stored bytes are fetched up front; decompression happens as the
    /// reader is consumed. No CRC check is made.
    pub async fn open(&self) -> Result<Box<dyn Read + Send>> {
        self.ensure_file()?;
        let raw = Cursor::new(self.read_raw().await?);
        Ok(match self.header.compression_method {
            CompressionMethod::Stored => Box::new(raw),
            CompressionMethod::Deflate => Box::new(DeflateDecoder::new(raw)),
        })
    }

    /// Local header bytes as they will be written
    pub(crate) fn local_header_bytes(&self) -> Result<Vec<u8>> {
        LocalFileHeader::encode(&self.header, &self.local_extra)
    }

    /// Copy of this entry with its stored bytes loaded into memory, ready
    /// to be placed anywhere. Data descriptors and alignment padding are
    /// dropped.
    pub(crate) async fn detached(&self) -> Result<StoredEntry> {
        let raw = self.read_raw().await?;
        let mut header = self.header.clone();
        header.crc32 = self.crc32();
        header.compressed_size = raw.len() as u64;
        header.flags = header.flags.without_data_descriptor();
        header.lfh_offset = 0;
        Ok(StoredEntry {
            header,
            kind: self.kind,
            local_extra: strip_alignment_blocks(&self.local_extra),
            data_descriptor: DataDescriptor::None,
            source: RawSource::Memory(Arc::new(raw)),
            written_offset: None,
        })
    }

    pub(crate) fn set_local_extra(&mut self, local_extra: Vec<u8>) {
        self.local_extra = local_extra;
        self.written_offset = None;
    }

    /// Record that the entry was written at `offset` in `archive`.
    pub(crate) fn mark_written(&mut self, offset: u64, archive: Arc<dyn ReadAt>) {
        self.header.lfh_offset = offset;
        self.header.flags = self.header.flags.without_data_descriptor();
        self.data_descriptor = DataDescriptor::None;
        self.written_offset = Some(offset);
        self.source = RawSource::Reader {
            reader: archive,
            offset: offset + self.local_header_size(),
        };
    }

    /// Whether the on-disk bytes are current for a placement at `start`
    pub(crate) fn is_written_at(&self, start: u64) -> bool {
        self.written_offset == Some(start)
    }

    /// Compression result of a pending entry, once it is known
    fn settled(&self) -> Option<ProcessedData> {
        match &self.source {
            RawSource::Pending(data) => data.peek(),
            _ => None,
        }
    }

    fn ensure_file(&self) -> Result<()> {
        if self.is_directory() {
            return Err(Error::InvalidState(format!(
                "'{}' is a directory",
                self.header.name
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for StoredEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredEntry")
            .field("name", &self.header.name)
            .field("kind", &self.kind)
            .field("method", &self.header.compression_method)
            .field("compressed_size", &self.compressed_size())
            .field("uncompressed_size", &self.header.uncompressed_size)
            .field("offset", &self.written_offset)
            .field("pending", &self.is_pending())
            .finish()
    }
}

fn kind_of(header: &CentralDirectoryHeader) -> EntryKind {
    if header.is_directory() {
        EntryKind::Directory
    } else {
        EntryKind::File
    }
}
