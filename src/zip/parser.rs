//! Low-level ZIP archive parser.
//!
//! This module handles the binary parsing of ZIP file structures,
//! reading from any source that implements the [`ReadAt`] trait.
//!
//! ## Parsing Strategy
//!
//! ZIP files are designed to be read from the end:
//! 1. Find the End of Central Directory (EOCD) at the file's end
//! 2. Reject ZIP64 and multi-disk archives
//! 3. Read the Central Directory to get metadata for all files
//! 4. Validate each file's Local File Header against its directory record
//!
//! Only the tail, the directory and the local headers are read, which
//! keeps opening cheap for HTTP Range sources too.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::io::ReadAt;

use super::structures::*;

/// Maximum ZIP comment size allowed by the format (65535 bytes).
///
/// This limits the search area when looking for EOCD with a comment.
const MAX_COMMENT_SIZE: u64 = EndOfCentralDirectory::MAX_COMMENT_SIZE as u64;

/// Low-level ZIP file parser.
///
/// Typically used through [`ZipFile::open`](super::ZipFile::open) rather
/// than directly.
///
/// ## Example
///
/// ```ignore
/// let parser = ZipParser::new(reader);
/// let (eocd, eocd_offset) = parser.find_eocd().await?;
/// let (_, headers) = parser.read_central_directory(&eocd, eocd_offset).await?;
/// for header in &headers {
///     let local_extra = parser.read_local_extra(header).await?;
/// }
/// ```
pub struct ZipParser {
    /// The underlying data source
    reader: Arc<dyn ReadAt>,
    /// Total size of the archive in bytes
    size: u64,
}

impl ZipParser {
    /// Create a new parser for the given reader.
    pub fn new(reader: Arc<dyn ReadAt>) -> Self {
        let size = reader.size();
        Self { reader, size }
    }

    /// Size of the source in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Find and parse the End of Central Directory record.
    ///
    /// The last 22 bytes are tried first, which finds the EOCD of any
    /// archive without a comment. Otherwise the whole tail a comment could
    /// span is read and searched; see [`locate_eocd`].
    ///
    /// # Returns
    ///
    /// A tuple of (EOCD record, offset of EOCD in file).
    ///
    /// # Errors
    ///
    /// Returns an error if no valid EOCD can be found, indicating
    /// the file is not a valid ZIP archive.
    pub async fn find_eocd(&self) -> Result<(EndOfCentralDirectory, u64)> {
        let eocd_size = EndOfCentralDirectory::SIZE as u64;
        if self.size < eocd_size {
            return Err(Error::InvalidZip(format!(
                "file of {} bytes is too small to be a ZIP archive",
                self.size
            )));
        }

        for window in [eocd_size, eocd_size + MAX_COMMENT_SIZE] {
            let len = window.min(self.size);
            let start = self.size - len;
            let mut tail = vec![0u8; len as usize];
            self.reader.read_exact_at(start, &mut tail).await?;

            if let Some(at) = locate_eocd(&tail) {
                let eocd = EndOfCentralDirectory::from_bytes(&tail[at..])?;
                return Ok((eocd, start + at as u64));
            }
            if len == self.size {
                break;
            }
        }

        Err(Error::InvalidZip(
            "End of Central Directory not found".to_string(),
        ))
    }

    /// Fail on ZIP64 and multi-disk archives.
    pub async fn check_supported(
        &self,
        eocd: &EndOfCentralDirectory,
        eocd_offset: u64,
    ) -> Result<()> {
        if eocd.is_zip64() {
            return Err(Error::Zip64Unsupported);
        }

        // The ZIP64 EOCD Locator is located immediately before the regular EOCD
        let locator_size = ZIP64_EOCD_LOCATOR_SIZE as u64;
        if eocd_offset >= locator_size {
            let mut sig = [0u8; 4];
            self.reader
                .read_exact_at(eocd_offset - locator_size, &mut sig)
                .await?;
            if sig == ZIP64_EOCD_LOCATOR_SIGNATURE {
                return Err(Error::Zip64Unsupported);
            }
        }

        if eocd.disk_number != 0
            || eocd.disk_with_cd != 0
            || eocd.disk_entries != eocd.total_entries
        {
            return Err(Error::InvalidZip(
                "multi-disk archives are not supported".to_string(),
            ));
        }
        Ok(())
    }

    /// Read and parse the Central Directory referenced by `eocd`.
    ///
    /// The directory must end exactly where the EOCD starts.
    ///
    /// # Returns
    ///
    /// The raw directory bytes and one header per entry, in directory order.
    pub async fn read_central_directory(
        &self,
        eocd: &EndOfCentralDirectory,
        eocd_offset: u64,
    ) -> Result<(Vec<u8>, Vec<CentralDirectoryHeader>)> {
        let cd_offset = eocd.cd_offset as u64;
        let cd_size = eocd.cd_size as u64;
        if cd_offset + cd_size != eocd_offset {
            return Err(Error::InvalidZip(format!(
                "central directory at {}..{} does not end at the EOCD offset {}",
                cd_offset,
                cd_offset + cd_size,
                eocd_offset
            )));
        }

        // Read the entire Central Directory in one request
        let mut cd_data = vec![0u8; cd_size as usize];
        self.reader.read_exact_at(cd_offset, &mut cd_data).await?;

        let mut headers = Vec::with_capacity(eocd.total_entries as usize);
        let mut cursor = Cursor::new(cd_data.as_slice());
        for _ in 0..eocd.total_entries {
            headers.push(CentralDirectoryHeader::parse(&mut cursor)?);
        }

        if cursor.position() != cd_size {
            return Err(Error::InvalidZip(format!(
                "central directory has {} bytes after its {} records",
                cd_size - cursor.position(),
                eocd.total_entries
            )));
        }

        Ok((cd_data, headers))
    }

    /// Validate the Local File Header of `header` and return its extra field.
    ///
    /// The local header may carry a different extra field than the
    /// directory record (alignment padding, for instance), so its length
    /// decides where the data starts.
    pub async fn read_local_extra(&self, header: &CentralDirectoryHeader) -> Result<Vec<u8>> {
        let mut lfh_buf = [0u8; LFH_SIZE];
        self.reader
            .read_exact_at(header.lfh_offset, &mut lfh_buf)
            .await
            .map_err(|_| {
                Error::InvalidZip(format!(
                    "local header of '{}' at {} is outside the file",
                    header.name, header.lfh_offset
                ))
            })?;
        let lfh = LocalFileHeader::from_bytes(&lfh_buf)?;

        if lfh.compression_method != header.compression_method.as_u16() {
            return Err(Error::InvalidZip(format!(
                "local header of '{}' disagrees on the compression method",
                header.name
            )));
        }

        let name_len = lfh.name_len as usize;
        let mut variable = vec![0u8; name_len + lfh.extra_len as usize];
        self.reader
            .read_exact_at(header.lfh_offset + LFH_SIZE as u64, &mut variable)
            .await?;

        if variable[..name_len] != header.encoded_name[..] {
            return Err(Error::InvalidZip(format!(
                "local header name does not match central directory name '{}'",
                header.name
            )));
        }

        Ok(variable.split_off(name_len))
    }

    /// Locate and validate the data descriptor that follows entry data
    /// ending at `data_end`.
    pub async fn read_data_descriptor(
        &self,
        header: &CentralDirectoryHeader,
        data_end: u64,
    ) -> Result<DataDescriptor> {
        let available = self.size.saturating_sub(data_end).min(16);
        if available < 12 {
            return Err(Error::InvalidZip(format!(
                "data descriptor of '{}' is truncated",
                header.name
            )));
        }

        let mut buf = vec![0u8; available as usize];
        self.reader.read_exact_at(data_end, &mut buf).await?;

        let (kind, fields) = if buf.len() == 16 && &buf[0..4] == DataDescriptor::SIGNATURE {
            (DataDescriptor::WithSignature, &buf[4..16])
        } else {
            (DataDescriptor::WithoutSignature, &buf[0..12])
        };

        let mut cursor = Cursor::new(fields);
        let crc32 = cursor.read_u32::<LittleEndian>()?;
        let compressed_size = cursor.read_u32::<LittleEndian>()? as u64;
        let uncompressed_size = cursor.read_u32::<LittleEndian>()? as u64;

        if crc32 != header.crc32
            || compressed_size != header.compressed_size
            || uncompressed_size != header.uncompressed_size
        {
            return Err(Error::InvalidZip(format!(
                "data descriptor of '{}' disagrees with the central directory",
                header.name
            )));
        }

        Ok(kind)
    }
}

/// Position in `tail` (the end of a file) of the EOCD record.
///
/// A candidate only counts if its declared comment length reaches exactly
/// to the end of `tail`, so signature bytes inside a comment, or inside
/// entry data before the record, are passed over. The candidate closest
/// to the end wins.
fn locate_eocd(tail: &[u8]) -> Option<usize> {
    let fixed = EndOfCentralDirectory::SIZE;
    let last = tail.len().checked_sub(fixed)?;
    (0..=last).rev().find(|&at| {
        let comment_len = u16::from_le_bytes([tail[at + 20], tail[at + 21]]) as usize;
        tail[at..].starts_with(EndOfCentralDirectory::SIGNATURE)
            && comment_len == tail.len() - at - fixed
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryReader;

    fn parser(bytes: Vec<u8>) -> ZipParser {
        ZipParser::new(Arc::new(MemoryReader::new(bytes)))
    }

    fn empty_archive(comment: &[u8]) -> Vec<u8> {
        EndOfCentralDirectory::new(0, 0, 0, comment.to_vec())
            .to_bytes()
            .unwrap()
    }

    #[tokio::test]
    async fn test_find_eocd_without_comment() {
        let mut bytes = vec![0u8; 10];
        bytes.extend(EndOfCentralDirectory::new(0, 10, 0, Vec::new()).to_bytes().unwrap());

        let (eocd, offset) = parser(bytes).find_eocd().await.unwrap();
        assert_eq!(offset, 10);
        assert_eq!(eocd.cd_offset, 10);
    }

    #[tokio::test]
    async fn test_find_eocd_skips_signature_in_comment() {
        let mut comment = b"xx".to_vec();
        comment.extend_from_slice(EndOfCentralDirectory::SIGNATURE);
        comment.extend_from_slice(&[0u8; 20]);
        let bytes = empty_archive(&comment);

        let (eocd, offset) = parser(bytes).find_eocd().await.unwrap();
        assert_eq!(offset, 0);
        assert_eq!(eocd.comment, comment);
    }

    #[tokio::test]
    async fn test_find_eocd_fails_on_garbage() {
        let err = parser(vec![0x55; 100]).find_eocd().await.unwrap_err();
        assert!(matches!(err, Error::InvalidZip(_)));

        let err = parser(vec![1, 2, 3]).find_eocd().await.unwrap_err();
        assert!(matches!(err, Error::InvalidZip(_)));
    }

    #[test]
    fn test_locate_eocd_needs_comment_to_reach_the_end() {
        let mut comment = EndOfCentralDirectory::SIGNATURE.to_vec();
        comment.extend_from_slice(&[0u8; 18]);
        let mut tail = vec![0xaau8; 7];
        tail.extend(empty_archive(&comment));

        assert_eq!(locate_eocd(&tail), Some(7));
        // One byte short: neither record's comment ends at the tail
        assert_eq!(locate_eocd(&tail[..tail.len() - 1]), None);
        assert_eq!(locate_eocd(&tail[..10]), None);
    }

    #[tokio::test]
    async fn test_zip64_locator_is_rejected() {
        let mut bytes = ZIP64_EOCD_LOCATOR_SIGNATURE.to_vec();
        bytes.extend_from_slice(&[0u8; 16]);
        bytes.extend(EndOfCentralDirectory::new(0, 20, 0, Vec::new()).to_bytes().unwrap());

        let parser = parser(bytes);
        let (eocd, offset) = parser.find_eocd().await.unwrap();
        assert!(matches!(
            parser.check_supported(&eocd, offset).await,
            Err(Error::Zip64Unsupported)
        ));
    }

    #[tokio::test]
    async fn test_directory_must_end_at_eocd() {
        let bytes = EndOfCentralDirectory::new(0, 5, 0, Vec::new())
            .to_bytes()
            .unwrap();
        let parser = parser(bytes);
        let (eocd, offset) = parser.find_eocd().await.unwrap();
        assert!(matches!(
            parser.read_central_directory(&eocd, offset).await,
            Err(Error::InvalidZip(_))
        ));
    }
}
