use super::ReadAt;
use crate::error::Result;
use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Local file with positioned reads and writes
pub struct LocalFile {
    file: File,
    size: AtomicU64,
}

impl LocalFile {
    /// Open an existing file for reading only
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_file(File::open(path)?)
    }

    /// Open an existing file for reading and writing.
    ///
    /// When `allow_read_only` is set and the file cannot be opened for
    /// writing, it is opened read-only instead. The returned flag tells
    /// which mode was obtained.
    pub fn open_writable(path: &Path, allow_read_only: bool) -> Result<(Self, bool)> {
        match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => Ok((Self::from_file(file)?, true)),
            Err(e)
                if allow_read_only
                    && matches!(
                        e.kind(),
                        ErrorKind::PermissionDenied | ErrorKind::ReadOnlyFilesystem
                    ) =>
            {
                Ok((Self::open(path)?, false))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Create (or truncate) a file for reading and writing
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Self::from_file(file)
    }

    fn from_file(file: File) -> Result<Self> {
        let size = file.metadata()?.len();
        Ok(Self {
            file,
            size: AtomicU64::new(size),
        })
    }

    /// Write the whole buffer at `offset`, growing the file if needed
    pub async fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.write_all_at_blocking(offset, buf)
    }

    /// [`write_all_at`](Self::write_all_at) for callers outside async code.
    pub fn write_all_at_blocking(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.file.write_all_at(buf, offset)?;
        }

        #[cfg(windows)]
        {
            use std::os::windows::fs::FileExt;
            let mut written = 0;
            while written < buf.len() {
                let n = self
                    .file
                    .seek_write(&buf[written..], offset + written as u64)?;
                if n == 0 {
                    return Err(std::io::Error::from(ErrorKind::WriteZero).into());
                }
                written += n;
            }
        }

        #[cfg(not(any(unix, windows)))]
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut file = &self.file;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(buf)?;
        }

        self.size
            .fetch_max(offset + buf.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Truncate or extend the file to exactly `len` bytes
    pub async fn set_len(&self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        self.size.store(len, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl ReadAt for LocalFile {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            Ok(self.file.read_at(buf, offset)?)
        }

        #[cfg(windows)]
        {
            use std::os::windows::fs::FileExt;
            Ok(self.file.seek_read(buf, offset)?)
        }

        #[cfg(not(any(unix, windows)))]
        {
            use std::io::{Read, Seek, SeekFrom};
            let mut file = &self.file;
            file.seek(SeekFrom::Start(offset))?;
            Ok(file.read(buf)?)
        }
    }

    fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }
}
