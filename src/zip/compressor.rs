//! Compression and CRC computation for new entries, off the caller's path.

use flate2::Compression;
use flate2::write::DeflateEncoder;
use std::io::Write;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;

use super::structures::CompressionMethod;
use crate::error::{Error, Result};

/// Raw bytes of an entry as they will be stored, with their checksum
#[derive(Debug, Clone)]
pub struct ProcessedData {
    pub method: CompressionMethod,
    pub crc32: u32,
    pub uncompressed_size: u64,
    pub raw: Arc<Vec<u8>>,
}

/// Compress `data` with `method` and compute its CRC-32.
pub fn process(data: &[u8], method: CompressionMethod, level: u32) -> Result<ProcessedData> {
    let crc32 = crc32fast::hash(data);
    let raw = match method {
        CompressionMethod::Stored => data.to_vec(),
        CompressionMethod::Deflate => {
            let mut encoder = DeflateEncoder::new(
                Vec::with_capacity(data.len() / 2),
                Compression::new(level.min(9)),
            );
            encoder.write_all(data)?;
            encoder.finish()?
        }
    };

    Ok(ProcessedData {
        method,
        crc32,
        uncompressed_size: data.len() as u64,
        raw: Arc::new(raw),
    })
}

/// Progress of a compression job
#[derive(Debug, Clone)]
pub(crate) enum JobState {
    Running,
    Done(ProcessedData),
    Failed(String),
}

impl JobState {
    fn of(result: Result<ProcessedData>) -> Self {
        match result {
            Ok(processed) => JobState::Done(processed),
            Err(e) => JobState::Failed(e.to_string()),
        }
    }

    /// `None` while running
    fn outcome(self) -> Option<Result<ProcessedData>> {
        match self {
            JobState::Running => None,
            JobState::Done(processed) => Some(Ok(processed)),
            JobState::Failed(message) => Some(Err(Error::Compression(message))),
        }
    }
}

/// Result of a compression job that may still be running.
///
/// Any number of watchers can follow the same job: the archive that
/// places the result, and entry handles given out while it runs.
#[derive(Clone)]
pub(crate) struct Deferred(watch::Receiver<JobState>);

impl Deferred {
    /// Take the result if the job has finished
    pub fn try_take(&self) -> Option<Result<ProcessedData>> {
        // A job that has gone away without reporting will never report
        let gone = self.0.has_changed().is_err();
        let state = self.0.borrow().clone();
        match state.outcome() {
            None if gone => Some(Err(Error::BackgroundTaskLost)),
            outcome => outcome,
        }
    }

    /// Result so far, without reporting a lost job
    pub fn peek(&self) -> Option<ProcessedData> {
        match &*self.0.borrow() {
            JobState::Done(processed) => Some(processed.clone()),
            _ => None,
        }
    }

    /// Wait for the job to finish
    pub async fn wait(&self) -> Result<ProcessedData> {
        let mut state = self.0.clone();
        let finished = state
            .wait_for(|state| !matches!(state, JobState::Running))
            .await
            .map_err(|_| Error::BackgroundTaskLost)?
            .clone();
        finished.outcome().unwrap_or(Err(Error::BackgroundTaskLost))
    }

    /// A job whose worker went away without reporting
    #[cfg(test)]
    pub(crate) fn abandoned() -> Self {
        let (_, rx) = watch::channel(JobState::Running);
        Deferred(rx)
    }

    /// A job that finished with `message` as its error
    #[cfg(test)]
    pub(crate) fn failed(message: &str) -> Self {
        let (_, rx) = watch::channel(JobState::Failed(message.to_string()));
        Deferred(rx)
    }
}

/// Dispatches compression jobs
#[derive(Debug, Clone)]
pub(crate) struct Compressor {
    level: u32,
    background: bool,
}

impl Compressor {
    pub fn new(level: u32, background: bool) -> Self {
        Self { level, background }
    }

    /// Start compressing `data`.
    ///
    /// Runs on tokio's blocking pool when a runtime is available and
    /// background compression is enabled, inline otherwise.
    pub fn submit(&self, data: Vec<u8>, method: CompressionMethod) -> Deferred {
        let (tx, rx) = watch::channel(JobState::Running);
        let level = self.level;

        match Handle::try_current() {
            Ok(handle) if self.background => {
                handle.spawn_blocking(move || {
                    tx.send_replace(JobState::of(process(&data, method, level)));
                });
            }
            _ => {
                tx.send_replace(JobState::of(process(&data, method, level)));
            }
        }

        Deferred(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::DeflateDecoder;
    use std::io::Read;

    #[test]
    fn test_process_stored() {
        let processed = process(b"hello", CompressionMethod::Stored, 6).unwrap();
        assert_eq!(processed.raw.as_slice(), b"hello");
        assert_eq!(processed.crc32, 0x3610a686);
        assert_eq!(processed.uncompressed_size, 5);
    }

    #[test]
    fn test_process_deflate() {
        let data = vec![b'a'; 10_000];
        let processed = process(&data, CompressionMethod::Deflate, 6).unwrap();
        assert!(processed.raw.len() < 100);

        let mut inflated = Vec::new();
        DeflateDecoder::new(processed.raw.as_slice())
            .read_to_end(&mut inflated)
            .unwrap();
        assert_eq!(inflated, data);
    }

    #[test]
    fn test_submit_without_runtime_runs_inline() {
        let compressor = Compressor::new(6, true);
        let deferred = compressor.submit(b"abc".to_vec(), CompressionMethod::Stored);
        let processed = deferred.try_take().unwrap().unwrap();
        assert_eq!(processed.raw.as_slice(), b"abc");
    }

    #[tokio::test]
    async fn test_submit_in_background() {
        let compressor = Compressor::new(9, true);
        let deferred = compressor.submit(vec![7u8; 4096], CompressionMethod::Deflate);
        let processed = deferred.wait().await.unwrap();
        assert_eq!(processed.method, CompressionMethod::Deflate);
        assert_eq!(processed.uncompressed_size, 4096);
    }

    #[tokio::test]
    async fn test_lost_job_is_reported() {
        let deferred = Deferred::abandoned();
        assert!(matches!(deferred.try_take(), Some(Err(Error::BackgroundTaskLost))));
        assert!(deferred.peek().is_none());
        assert!(matches!(deferred.wait().await, Err(Error::BackgroundTaskLost)));
    }

    #[tokio::test]
    async fn test_failed_job_is_reported() {
        let deferred = Deferred::failed("disk on fire");
        match deferred.try_take() {
            Some(Err(Error::Compression(message))) => assert_eq!(message, "disk on fire"),
            other => panic!("unexpected outcome: {:?}", other.map(|r| r.is_ok())),
        }
        assert!(matches!(deferred.wait().await, Err(Error::Compression(_))));
    }

    #[tokio::test]
    async fn test_finished_job_outlives_its_worker() {
        let compressor = Compressor::new(6, true);
        let deferred = compressor.submit(vec![1u8; 1024], CompressionMethod::Stored);
        let waited = deferred.wait().await.unwrap();

        // The worker is gone by now; the result is still there
        let taken = deferred.try_take().unwrap().unwrap();
        assert_eq!(taken.crc32, waited.crc32);
        assert_eq!(deferred.peek().unwrap().uncompressed_size, 1024);
    }
}
