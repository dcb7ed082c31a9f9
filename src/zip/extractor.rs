use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::entry::StoredEntry;
use super::file::ZipFile;
use crate::error::Result;

/// Writes entries of an archive out to memory, files or stdout
pub struct ZipExtractor<'a> {
    zip: &'a ZipFile,
}

impl<'a> ZipExtractor<'a> {
    pub fn new(zip: &'a ZipFile) -> Self {
        Self { zip }
    }

    /// All entries, in file order
    pub fn list_files(&self) -> Vec<&'a StoredEntry> {
        self.zip.entries()
    }

    /// Extract file data to memory
    pub async fn extract_to_memory(&self, entry: &StoredEntry) -> Result<Vec<u8>> {
        entry.read().await
    }

    /// Extract file to disk
    pub async fn extract_to_file(&self, entry: &StoredEntry, output_path: &Path) -> Result<()> {
        if let Some(parent) = output_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let data = self.extract_to_memory(entry).await?;
        let mut file = fs::File::create(output_path).await?;
        file.write_all(&data).await?;
        file.flush().await?;

        Ok(())
    }

    /// Extract file to stdout
    pub async fn extract_to_stdout(&self, entry: &StoredEntry) -> Result<()> {
        let data = self.extract_to_memory(entry).await?;

        let mut stdout = tokio::io::stdout();
        stdout.write_all(&data).await?;
        stdout.flush().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zip::{CompressionMethod, ZipFileOptions};

    #[tokio::test]
    async fn extracts_to_file_creating_parents() {
        let dir = tempfile::tempdir().unwrap();
        let mut zip = ZipFile::open(dir.path().join("a.zip"), ZipFileOptions::default())
            .await
            .unwrap();
        zip.add("sub/hello.txt", b"hello".to_vec(), CompressionMethod::Deflate)
            .unwrap();
        zip.finish_all_background_tasks().await.unwrap();

        let extractor = ZipExtractor::new(&zip);
        let entries = extractor.list_files();
        assert_eq!(entries.len(), 1);

        let out = dir.path().join("out/sub/hello.txt");
        extractor.extract_to_file(entries[0], &out).await.unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"hello");

        zip.close().await.unwrap();
    }
}
