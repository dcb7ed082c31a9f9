use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

/// Highest "version needed to extract" this crate writes (2.0)
pub const VERSION_MADE_BY: u16 = 20;

/// ZIP compression methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionMethod {
    Stored,
    Deflate,
}

impl CompressionMethod {
    pub fn from_u16(value: u16) -> Result<Self> {
        match value {
            0 => Ok(CompressionMethod::Stored),
            8 => Ok(CompressionMethod::Deflate),
            other => Err(Error::UnsupportedCompression(other)),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            CompressionMethod::Stored => 0,
            CompressionMethod::Deflate => 8,
        }
    }

    /// Minimum "version needed to extract" for an entry using this method
    pub fn version_needed(&self, is_directory: bool) -> u16 {
        match self {
            CompressionMethod::Stored if !is_directory => 10,
            _ => 20,
        }
    }
}

/// General purpose bit flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GpFlags(pub u16);

impl GpFlags {
    pub const ENCRYPTED: u16 = 1;
    pub const DATA_DESCRIPTOR: u16 = 1 << 3;
    pub const UTF8: u16 = 1 << 11;

    /// Flags for a freshly written entry: UTF-8 bit only for non-ASCII names
    pub fn for_name(name: &str) -> Self {
        if name.is_ascii() {
            GpFlags(0)
        } else {
            GpFlags(Self::UTF8)
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.0 & Self::ENCRYPTED != 0
    }

    pub fn has_data_descriptor(&self) -> bool {
        self.0 & Self::DATA_DESCRIPTOR != 0
    }

    pub fn is_utf8(&self) -> bool {
        self.0 & Self::UTF8 != 0
    }

    pub fn without_data_descriptor(self) -> Self {
        GpFlags(self.0 & !Self::DATA_DESCRIPTOR)
    }
}

/// End of Central Directory (EOCD) - 22 bytes minimum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub disk_with_cd: u16,
    pub disk_entries: u16,
    pub total_entries: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
    pub comment: Vec<u8>,
}

impl EndOfCentralDirectory {
    pub const SIGNATURE: &'static [u8] = b"PK\x05\x06";
    pub const SIZE: usize = 22;
    pub const MAX_COMMENT_SIZE: usize = 65535;

    pub fn new(total_entries: u16, cd_offset: u32, cd_size: u32, comment: Vec<u8>) -> Self {
        Self {
            disk_number: 0,
            disk_with_cd: 0,
            disk_entries: total_entries,
            total_entries,
            cd_size,
            cd_offset,
            comment,
        }
    }

    /// Parse an EOCD record. `data` starts at the signature and must hold
    /// the whole comment.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(Error::InvalidZip(
                "Invalid End of Central Directory".to_string(),
            ));
        }

        let mut cursor = Cursor::new(&data[4..Self::SIZE]);
        let disk_number = cursor.read_u16::<LittleEndian>()?;
        let disk_with_cd = cursor.read_u16::<LittleEndian>()?;
        let disk_entries = cursor.read_u16::<LittleEndian>()?;
        let total_entries = cursor.read_u16::<LittleEndian>()?;
        let cd_size = cursor.read_u32::<LittleEndian>()?;
        let cd_offset = cursor.read_u32::<LittleEndian>()?;
        let comment_len = cursor.read_u16::<LittleEndian>()? as usize;

        let comment = data
            .get(Self::SIZE..Self::SIZE + comment_len)
            .ok_or_else(|| Error::InvalidZip("EOCD comment is truncated".to_string()))?
            .to_vec();

        Ok(Self {
            disk_number,
            disk_with_cd,
            disk_entries,
            total_entries,
            cd_size,
            cd_offset,
            comment,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let comment_len = u16::try_from(self.comment.len())
            .map_err(|_| Error::TooLarge("archive comment exceeds 65535 bytes".to_string()))?;

        let mut out = Vec::with_capacity(Self::SIZE + self.comment.len());
        out.extend_from_slice(Self::SIGNATURE);
        out.write_u16::<LittleEndian>(self.disk_number)?;
        out.write_u16::<LittleEndian>(self.disk_with_cd)?;
        out.write_u16::<LittleEndian>(self.disk_entries)?;
        out.write_u16::<LittleEndian>(self.total_entries)?;
        out.write_u32::<LittleEndian>(self.cd_size)?;
        out.write_u32::<LittleEndian>(self.cd_offset)?;
        out.write_u16::<LittleEndian>(comment_len)?;
        out.extend_from_slice(&self.comment);
        Ok(out)
    }

    /// Size of the record including its comment
    pub fn record_size(&self) -> u64 {
        (Self::SIZE + self.comment.len()) as u64
    }

    pub fn is_zip64(&self) -> bool {
        self.disk_entries == 0xFFFF
            || self.total_entries == 0xFFFF
            || self.cd_size == 0xFFFFFFFF
            || self.cd_offset == 0xFFFFFFFF
    }
}

/// ZIP64 End of Central Directory Locator. Only detected, never parsed.
pub const ZIP64_EOCD_LOCATOR_SIGNATURE: &[u8] = b"PK\x06\x07";
pub const ZIP64_EOCD_LOCATOR_SIZE: usize = 20;

/// Central Directory File Header (CDFH) - 46 bytes minimum
pub const CDFH_SIGNATURE: &[u8] = b"PK\x01\x02";
pub const CDFH_MIN_SIZE: usize = 46;

/// Local File Header (LFH) - 30 bytes
pub const LFH_SIGNATURE: &[u8] = b"PK\x03\x04";
pub const LFH_SIZE: usize = 30;

/// Central directory record of one entry.
///
/// The raw name bytes are kept next to the decoded name so that names are
/// written back exactly as they were read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CentralDirectoryHeader {
    pub name: String,
    pub encoded_name: Vec<u8>,
    pub version_made_by: u16,
    pub version_needed: u16,
    pub flags: GpFlags,
    pub compression_method: CompressionMethod,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub internal_attrs: u16,
    pub external_attrs: u32,
    pub lfh_offset: u64,
    pub extra_field: Vec<u8>,
    pub comment: Vec<u8>,
}

impl CentralDirectoryHeader {
    /// Header for a freshly added entry
    pub fn new(
        name: &str,
        compression_method: CompressionMethod,
        crc32: u32,
        compressed_size: u64,
        uncompressed_size: u64,
        (last_mod_time, last_mod_date): (u16, u16),
    ) -> Self {
        let is_directory = name.ends_with('/');
        Self {
            name: name.to_string(),
            encoded_name: name.as_bytes().to_vec(),
            version_made_by: VERSION_MADE_BY,
            version_needed: compression_method.version_needed(is_directory),
            flags: GpFlags::for_name(name),
            compression_method,
            last_mod_time,
            last_mod_date,
            crc32,
            compressed_size,
            uncompressed_size,
            internal_attrs: 0,
            external_attrs: if is_directory { 0x10 } else { 0 },
            lfh_offset: 0,
            extra_field: Vec::new(),
            comment: Vec::new(),
        }
    }

    /// Parse one header from a cursor positioned at its signature.
    pub fn parse(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let mut fixed = [0u8; CDFH_MIN_SIZE];
        cursor
            .read_exact(&mut fixed)
            .map_err(|_| Error::InvalidZip("Central directory is truncated".to_string()))?;
        if &fixed[0..4] != CDFH_SIGNATURE {
            return Err(Error::InvalidZip(
                "Invalid Central Directory File Header".to_string(),
            ));
        }

        let mut fields = Cursor::new(&fixed[4..]);
        let version_made_by = fields.read_u16::<LittleEndian>()?;
        let version_needed = fields.read_u16::<LittleEndian>()?;
        let flags = GpFlags(fields.read_u16::<LittleEndian>()?);
        let method = fields.read_u16::<LittleEndian>()?;
        let last_mod_time = fields.read_u16::<LittleEndian>()?;
        let last_mod_date = fields.read_u16::<LittleEndian>()?;
        let crc32 = fields.read_u32::<LittleEndian>()?;
        let compressed_size = fields.read_u32::<LittleEndian>()?;
        let uncompressed_size = fields.read_u32::<LittleEndian>()?;
        let file_name_length = fields.read_u16::<LittleEndian>()? as usize;
        let extra_field_length = fields.read_u16::<LittleEndian>()? as usize;
        let file_comment_length = fields.read_u16::<LittleEndian>()? as usize;
        let disk_number_start = fields.read_u16::<LittleEndian>()?;
        let internal_attrs = fields.read_u16::<LittleEndian>()?;
        let external_attrs = fields.read_u32::<LittleEndian>()?;
        let lfh_offset = fields.read_u32::<LittleEndian>()?;

        let mut encoded_name = vec![0u8; file_name_length];
        let mut extra_field = vec![0u8; extra_field_length];
        let mut comment = vec![0u8; file_comment_length];
        for buf in [&mut encoded_name, &mut extra_field, &mut comment] {
            cursor.read_exact(buf).map_err(|_| {
                Error::InvalidZip("Central directory is truncated".to_string())
            })?;
        }

        // Lossy conversion handles names that are neither UTF-8 nor flagged
        let name = String::from_utf8_lossy(&encoded_name).to_string();

        if flags.is_encrypted() {
            return Err(Error::InvalidZip(format!(
                "entry '{}' is encrypted",
                name
            )));
        }
        if disk_number_start != 0 {
            return Err(Error::InvalidZip(format!(
                "entry '{}' lives on disk {}; multi-disk archives are not supported",
                name, disk_number_start
            )));
        }
        if compressed_size == 0xFFFFFFFF
            || uncompressed_size == 0xFFFFFFFF
            || lfh_offset == 0xFFFFFFFF
        {
            return Err(Error::Zip64Unsupported);
        }

        Ok(Self {
            name,
            encoded_name,
            version_made_by,
            version_needed,
            flags,
            compression_method: CompressionMethod::from_u16(method)?,
            last_mod_time,
            last_mod_date,
            crc32,
            compressed_size: compressed_size as u64,
            uncompressed_size: uncompressed_size as u64,
            internal_attrs,
            external_attrs,
            lfh_offset: lfh_offset as u64,
            extra_field,
            comment,
        })
    }

    /// Append this record to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(CDFH_SIGNATURE);
        out.write_u16::<LittleEndian>(self.version_made_by)?;
        out.write_u16::<LittleEndian>(self.version_needed)?;
        out.write_u16::<LittleEndian>(self.flags.0)?;
        out.write_u16::<LittleEndian>(self.compression_method.as_u16())?;
        out.write_u16::<LittleEndian>(self.last_mod_time)?;
        out.write_u16::<LittleEndian>(self.last_mod_date)?;
        out.write_u32::<LittleEndian>(self.crc32)?;
        out.write_u32::<LittleEndian>(fit_u32(self.compressed_size, "compressed size")?)?;
        out.write_u32::<LittleEndian>(fit_u32(self.uncompressed_size, "uncompressed size")?)?;
        out.write_u16::<LittleEndian>(fit_u16(self.encoded_name.len(), "file name")?)?;
        out.write_u16::<LittleEndian>(fit_u16(self.extra_field.len(), "extra field")?)?;
        out.write_u16::<LittleEndian>(fit_u16(self.comment.len(), "file comment")?)?;
        out.write_u16::<LittleEndian>(0)?;
        out.write_u16::<LittleEndian>(self.internal_attrs)?;
        out.write_u32::<LittleEndian>(self.external_attrs)?;
        out.write_u32::<LittleEndian>(fit_u32(self.lfh_offset, "local header offset")?)?;
        out.extend_from_slice(&self.encoded_name);
        out.extend_from_slice(&self.extra_field);
        out.extend_from_slice(&self.comment);
        Ok(())
    }

    pub fn record_size(&self) -> u64 {
        (CDFH_MIN_SIZE + self.encoded_name.len() + self.extra_field.len() + self.comment.len())
            as u64
    }

    pub fn is_directory(&self) -> bool {
        self.encoded_name.last() == Some(&b'/')
    }

    /// Parse modification date to (year, month, day)
    pub fn mod_date(&self) -> (u16, u8, u8) {
        let day = (self.last_mod_date & 0x1F) as u8;
        let month = ((self.last_mod_date >> 5) & 0x0F) as u8;
        let year = ((self.last_mod_date >> 9) & 0x7F) + 1980;
        (year, month, day)
    }

    /// Parse modification time to (hour, minute, second)
    pub fn mod_time(&self) -> (u8, u8, u8) {
        let second = ((self.last_mod_time & 0x1F) * 2) as u8;
        let minute = ((self.last_mod_time >> 5) & 0x3F) as u8;
        let hour = ((self.last_mod_time >> 11) & 0x1F) as u8;
        (hour, minute, second)
    }
}

/// Fixed part of a local file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFileHeader {
    pub version_needed: u16,
    pub flags: GpFlags,
    pub compression_method: u16,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub name_len: u16,
    pub extra_len: u16,
}

impl LocalFileHeader {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < LFH_SIZE || &data[0..4] != LFH_SIGNATURE {
            return Err(Error::InvalidZip("Invalid Local File Header".to_string()));
        }

        let mut cursor = Cursor::new(&data[4..LFH_SIZE]);
        Ok(Self {
            version_needed: cursor.read_u16::<LittleEndian>()?,
            flags: GpFlags(cursor.read_u16::<LittleEndian>()?),
            compression_method: cursor.read_u16::<LittleEndian>()?,
            last_mod_time: cursor.read_u16::<LittleEndian>()?,
            last_mod_date: cursor.read_u16::<LittleEndian>()?,
            crc32: cursor.read_u32::<LittleEndian>()?,
            compressed_size: cursor.read_u32::<LittleEndian>()?,
            uncompressed_size: cursor.read_u32::<LittleEndian>()?,
            name_len: cursor.read_u16::<LittleEndian>()?,
            extra_len: cursor.read_u16::<LittleEndian>()?,
        })
    }

    /// Total header size including name and extra field
    pub fn size(&self) -> u64 {
        LFH_SIZE as u64 + self.name_len as u64 + self.extra_len as u64
    }

    /// Serialize the local header of `header` with the given local extra field.
    pub fn encode(header: &CentralDirectoryHeader, local_extra: &[u8]) -> Result<Vec<u8>> {
        let mut out =
            Vec::with_capacity(LFH_SIZE + header.encoded_name.len() + local_extra.len());
        out.extend_from_slice(LFH_SIGNATURE);
        out.write_u16::<LittleEndian>(header.version_needed)?;
        out.write_u16::<LittleEndian>(header.flags.0)?;
        out.write_u16::<LittleEndian>(header.compression_method.as_u16())?;
        out.write_u16::<LittleEndian>(header.last_mod_time)?;
        out.write_u16::<LittleEndian>(header.last_mod_date)?;
        out.write_u32::<LittleEndian>(header.crc32)?;
        out.write_u32::<LittleEndian>(fit_u32(header.compressed_size, "compressed size")?)?;
        out.write_u32::<LittleEndian>(fit_u32(header.uncompressed_size, "uncompressed size")?)?;
        out.write_u16::<LittleEndian>(fit_u16(header.encoded_name.len(), "file name")?)?;
        out.write_u16::<LittleEndian>(fit_u16(local_extra.len(), "extra field")?)?;
        out.extend_from_slice(&header.encoded_name);
        out.extend_from_slice(local_extra);
        Ok(out)
    }
}

/// Trailing data descriptor of entries written by streaming tools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataDescriptor {
    #[default]
    None,
    WithSignature,
    WithoutSignature,
}

impl DataDescriptor {
    pub const SIGNATURE: &'static [u8] = b"PK\x07\x08";

    pub fn size(&self) -> u64 {
        match self {
            DataDescriptor::None => 0,
            DataDescriptor::WithSignature => 16,
            DataDescriptor::WithoutSignature => 12,
        }
    }
}

/// Header id of the extra block used to pad local headers for alignment
pub const ALIGNMENT_EXTRA_ID: u16 = 0xd935;

/// Smallest alignment extra block: id, length and alignment, no padding
pub const ALIGNMENT_EXTRA_MIN_SIZE: usize = 6;

/// Build an alignment extra block of exactly `size` bytes.
pub fn alignment_extra_block(size: usize, alignment: u64) -> Result<Vec<u8>> {
    if !(ALIGNMENT_EXTRA_MIN_SIZE..=u16::MAX as usize).contains(&size) {
        return Err(Error::InvalidState(format!(
            "alignment extra block of {} bytes cannot be encoded",
            size
        )));
    }
    let mut out = Vec::with_capacity(size);
    out.write_u16::<LittleEndian>(ALIGNMENT_EXTRA_ID)?;
    out.write_u16::<LittleEndian>((size - 4) as u16)?;
    out.write_u16::<LittleEndian>(u16::try_from(alignment).unwrap_or(0))?;
    out.resize(size, 0);
    Ok(out)
}

/// Remove alignment blocks from an extra field.
///
/// Extra fields that are not a well-formed sequence of blocks (zipalign
/// style zero padding, for instance) are returned unchanged.
pub fn strip_alignment_blocks(extra: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(extra.len());
    let mut pos = 0;
    while pos < extra.len() {
        if pos + 4 > extra.len() {
            return extra.to_vec();
        }
        let id = u16::from_le_bytes([extra[pos], extra[pos + 1]]);
        let len = u16::from_le_bytes([extra[pos + 2], extra[pos + 3]]) as usize;
        let end = pos + 4 + len;
        if end > extra.len() {
            return extra.to_vec();
        }
        if id != ALIGNMENT_EXTRA_ID {
            out.extend_from_slice(&extra[pos..end]);
        }
        pos = end;
    }
    out
}

/// DOS time and date of 1980-01-01 00:00:00, the earliest representable stamp
pub const DOS_EPOCH: (u16, u16) = (0, (1 << 5) | 1);

/// Convert a system time (UTC) to a DOS `(time, date)` pair.
///
/// Times before 1980 clamp to [`DOS_EPOCH`]; times after 2107 clamp to the
/// last representable day.
pub fn dos_date_time(time: SystemTime) -> (u16, u16) {
    let Ok(since_epoch) = time.duration_since(UNIX_EPOCH) else {
        return DOS_EPOCH;
    };
    let secs = since_epoch.as_secs();
    let (year, month, day) = civil_from_days((secs / 86_400) as i64);
    if year < 1980 {
        return DOS_EPOCH;
    }
    if year > 2107 {
        return ((23 << 11) | (59 << 5) | 29, (127 << 9) | (12 << 5) | 31);
    }

    let rem = secs % 86_400;
    let (hour, minute, second) = (rem / 3600, (rem % 3600) / 60, rem % 60);
    let time = ((hour << 11) | (minute << 5) | (second / 2)) as u16;
    let date = (((year - 1980) as u64) << 9 | (month as u64) << 5 | day as u64) as u16;
    (time, date)
}

/// Days since 1970-01-01 to (year, month, day) in the proleptic Gregorian calendar.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = (if z >= 0 { z } else { z - 146_096 }) / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe as i64 + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

fn fit_u32(value: u64, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::TooLarge(format!("{} {} needs ZIP64", what, value)))
}

fn fit_u16(value: usize, what: &str) -> Result<u16> {
    u16::try_from(value)
        .map_err(|_| Error::TooLarge(format!("{} of {} bytes exceeds 65535", what, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_empty_eocd_is_22_bytes() {
        let eocd = EndOfCentralDirectory::new(0, 0, 0, Vec::new());
        let bytes = eocd.to_bytes().unwrap();
        assert_eq!(bytes.len(), EndOfCentralDirectory::SIZE);
        assert_eq!(&bytes[0..4], EndOfCentralDirectory::SIGNATURE);
        assert!(bytes[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_eocd_keeps_comment() {
        let eocd = EndOfCentralDirectory::new(3, 1000, 150, b"built by hand".to_vec());
        let bytes = eocd.to_bytes().unwrap();
        assert_eq!(bytes.len() as u64, eocd.record_size());

        let parsed = EndOfCentralDirectory::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, eocd);
        assert_eq!(parsed.cd_offset, 1000);
        assert!(!parsed.is_zip64());
    }

    #[test]
    fn test_eocd_rejects_truncated_comment() {
        let mut bytes = EndOfCentralDirectory::new(0, 0, 0, b"abc".to_vec())
            .to_bytes()
            .unwrap();
        bytes.truncate(23);
        assert!(matches!(
            EndOfCentralDirectory::from_bytes(&bytes),
            Err(Error::InvalidZip(_))
        ));
    }

    #[test]
    fn test_central_directory_header_layout() {
        let mut header = CentralDirectoryHeader::new(
            "foo",
            CompressionMethod::Deflate,
            0xDEADBEEF,
            5,
            9,
            DOS_EPOCH,
        );
        header.lfh_offset = 1234;

        let mut out = Vec::new();
        header.write_to(&mut out).unwrap();
        assert_eq!(out.len(), 46 + 3);
        assert_eq!(out.len() as u64, header.record_size());
        assert_eq!(&out[0..4], CDFH_SIGNATURE);
        // version needed, method and local header offset
        assert_eq!(u16::from_le_bytes([out[6], out[7]]), 20);
        assert_eq!(u16::from_le_bytes([out[10], out[11]]), 8);
        assert_eq!(u32::from_le_bytes([out[42], out[43], out[44], out[45]]), 1234);

        let parsed = CentralDirectoryHeader::parse(&mut Cursor::new(&out[..])).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_parse_rejects_unknown_method() {
        let header =
            CentralDirectoryHeader::new("a", CompressionMethod::Stored, 0, 0, 0, DOS_EPOCH);
        let mut out = Vec::new();
        header.write_to(&mut out).unwrap();
        out[10] = 12;

        assert!(matches!(
            CentralDirectoryHeader::parse(&mut Cursor::new(&out[..])),
            Err(Error::UnsupportedCompression(12))
        ));
    }

    #[test]
    fn test_local_header_encode() {
        let header = CentralDirectoryHeader::new(
            "dir/",
            CompressionMethod::Stored,
            0,
            0,
            0,
            DOS_EPOCH,
        );
        let bytes = LocalFileHeader::encode(&header, &[1, 2, 3]).unwrap();
        assert_eq!(bytes.len(), 30 + 4 + 3);

        let parsed = LocalFileHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.version_needed, 20);
        assert_eq!(parsed.size(), bytes.len() as u64);
        assert_eq!(&bytes[30..34], b"dir/");
    }

    #[test]
    fn test_flags_for_name() {
        assert!(!GpFlags::for_name("plain.txt").is_utf8());
        assert!(GpFlags::for_name("café.txt").is_utf8());

        let flags = GpFlags(GpFlags::DATA_DESCRIPTOR | GpFlags::UTF8);
        assert!(flags.has_data_descriptor());
        let cleared = flags.without_data_descriptor();
        assert!(!cleared.has_data_descriptor());
        assert!(cleared.is_utf8());
    }

    #[test]
    fn test_version_needed() {
        assert_eq!(CompressionMethod::Stored.version_needed(false), 10);
        assert_eq!(CompressionMethod::Stored.version_needed(true), 20);
        assert_eq!(CompressionMethod::Deflate.version_needed(false), 20);
    }

    #[test]
    fn test_alignment_extra_block() {
        let block = alignment_extra_block(10, 4096).unwrap();
        assert_eq!(block, vec![0x35, 0xd9, 6, 0, 0x00, 0x10, 0, 0, 0, 0]);

        assert!(alignment_extra_block(5, 4).is_err());
        assert!(alignment_extra_block(70_000, 4).is_err());
    }

    #[test]
    fn test_strip_alignment_blocks() {
        let mut extra = vec![0x01, 0xca, 2, 0, 9, 9];
        extra.extend(alignment_extra_block(8, 4).unwrap());
        assert_eq!(strip_alignment_blocks(&extra), vec![0x01, 0xca, 2, 0, 9, 9]);

        let padding = vec![0u8; 3];
        assert_eq!(strip_alignment_blocks(&padding), padding);
    }

    #[test]
    fn test_dos_date_time() {
        let y2k = UNIX_EPOCH + Duration::from_secs(946_684_800);
        assert_eq!(dos_date_time(y2k), (0, (20 << 9) | (1 << 5) | 1));

        // 2024-02-29 13:45:30
        let leap = UNIX_EPOCH + Duration::from_secs(1_709_214_330);
        let (time, date) = dos_date_time(leap);
        assert_eq!(date, (44 << 9) | (2 << 5) | 29);
        assert_eq!(time, (13 << 11) | (45 << 5) | 15);

        assert_eq!(dos_date_time(UNIX_EPOCH), DOS_EPOCH);
    }
}
