use async_trait::async_trait;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, HeaderMap, RANGE};
use reqwest::{Client, StatusCode};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use super::ReadAt;
use crate::error::{Error, Result};

const DEFAULT_MAX_RETRIES: u32 = 10;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Read-only view of a remote archive through HTTP Range requests.
///
/// Remote archives can be listed, extracted and merged into a local
/// archive, never edited.
pub struct HttpRangeReader {
    client: Client,
    url: String,
    size: u64,
    transferred_bytes: AtomicU64,
    max_retries: u32,
}

impl HttpRangeReader {
    /// Connect to `url` and learn its size.
    ///
    /// A HEAD request is tried first. Servers that answer HEAD without
    /// range information are sized with a one-byte ranged GET instead.
    pub async fn new(url: String) -> Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        let size = match head_size(&client, &url).await? {
            Some(size) => size,
            None => ranged_size(&client, &url).await?,
        };
        debug!(%url, size, "opened remote archive");

        Ok(Self {
            client,
            url,
            size,
            transferred_bytes: AtomicU64::new(0),
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    /// Total bytes received so far
    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes.load(Ordering::Relaxed)
    }

    /// GET `first..=last`, retrying on timeouts and connection errors.
    async fn fetch(&self, first: u64, last: u64) -> Result<Vec<u8>> {
        let range = format!("bytes={}-{}", first, last);
        let mut attempt = 0;
        loop {
            let failure = match self.client.get(&self.url).header(RANGE, &range).send().await {
                Ok(resp) if resp.status() == StatusCode::PARTIAL_CONTENT => {
                    match resp.bytes().await {
                        Ok(bytes) => return Ok(bytes.to_vec()),
                        Err(e) => e,
                    }
                }
                Ok(resp) => {
                    return Err(Error::Remote(format!(
                        "range {} of {} answered with {}",
                        range,
                        self.url,
                        resp.status()
                    )));
                }
                Err(e) => e,
            };

            if !(failure.is_timeout() || failure.is_connect()) {
                return Err(failure.into());
            }
            attempt += 1;
            if attempt >= self.max_retries {
                return Err(Error::Remote(format!(
                    "giving up on range {} after {} attempts: {}",
                    range, attempt, failure
                )));
            }
            warn!(%range, attempt, max = self.max_retries, error = %failure, "retrying range request");
            tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
        }
    }
}

/// Size from a HEAD response, or `None` if it does not advertise ranges.
async fn head_size(client: &Client, url: &str) -> Result<Option<u64>> {
    let resp = client.head(url).send().await?;
    if !resp.status().is_success() {
        return Err(Error::Remote(format!(
            "HEAD {} failed with status {}",
            url,
            resp.status()
        )));
    }

    let headers = resp.headers();
    let ranges = header_str(headers, ACCEPT_RANGES).unwrap_or("none");
    if !ranges.contains("bytes") {
        return Ok(None);
    }
    Ok(header_str(headers, CONTENT_LENGTH).and_then(|len| len.parse().ok()))
}

/// Size from the `Content-Range` of a one-byte ranged GET.
async fn ranged_size(client: &Client, url: &str) -> Result<u64> {
    let resp = client.get(url).header(RANGE, "bytes=0-0").send().await?;
    if resp.status() != StatusCode::PARTIAL_CONTENT {
        return Err(Error::Remote(format!(
            "{} does not support Range requests (status {})",
            url,
            resp.status()
        )));
    }

    header_str(resp.headers(), CONTENT_RANGE)
        .and_then(|range| range.rsplit_once('/'))
        .and_then(|(_, total)| total.trim().parse().ok())
        .ok_or_else(|| Error::Remote(format!("{} did not report its size", url)))
}

fn header_str(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[async_trait]
impl ReadAt for HttpRangeReader {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || offset >= self.size {
            return Ok(0);
        }

        let last = (offset + buf.len() as u64 - 1).min(self.size - 1);
        let wanted = (last - offset + 1) as usize;

        // Servers may answer with less than asked; keep going from where
        // the previous response stopped.
        let mut received = 0;
        while received < wanted {
            let bytes = self.fetch(offset + received as u64, last).await?;
            if bytes.is_empty() {
                return Err(Error::Remote(format!(
                    "empty response for {} at {}",
                    self.url,
                    offset + received as u64
                )));
            }

            let n = bytes.len().min(wanted - received);
            buf[received..received + n].copy_from_slice(&bytes[..n]);
            received += n;
            self.transferred_bytes.fetch_add(n as u64, Ordering::Relaxed);
        }

        Ok(received)
    }

    fn size(&self) -> u64 {
        self.size
    }
}
