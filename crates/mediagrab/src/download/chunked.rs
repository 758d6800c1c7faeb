//! Parallel ranged download of a single resource.
//!
//! The destination is pre-sized and every chunk is written at its own offset,
//! so chunks may finish in any order. Any permanent failure cancels the
//! remaining chunks and removes the partial file.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::ranges::{ByteRange, effective_concurrency, plan_chunks};
use super::{remove_file_quietly, stream_to_file};
use crate::config::DownloadConfig;
use crate::error::{DownloadError, ErrorKind};
use crate::http::{HttpClient, HttpRequest, send_checked};
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};
use crate::toolkit::MediaToolkit;

pub struct ChunkedDownloader {
    http: Arc<dyn HttpClient>,
    toolkit: Option<Arc<dyn MediaToolkit>>,
    config: DownloadConfig,
}

impl ChunkedDownloader {
    pub fn new(http: Arc<dyn HttpClient>, config: DownloadConfig) -> Self {
        Self {
            http,
            toolkit: None,
            config: config.with_defaults(),
        }
    }

    /// Toolkit used for the optional remux pass.
    pub fn with_toolkit(mut self, toolkit: Arc<dyn MediaToolkit>) -> Self {
        self.toolkit = Some(toolkit);
        self
    }

    /// Download the first reachable URL of `urls` into `output`.
    ///
    /// Returns the number of bytes written. On error no file is left at `output`.
    #[instrument(skip_all, fields(output = %output.display()))]
    pub async fn download(
        &self,
        urls: &[String],
        output: &Path,
        token: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        if urls.is_empty() {
            return Err(DownloadError::invalid_input("format has no URLs"));
        }

        let mut last_error = None;
        for (index, url) in urls.iter().enumerate() {
            if token.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            match self.download_from(url, output, token).await {
                Ok(size) => {
                    self.remux(output, token).await?;
                    self.config.report_progress(1.0);
                    return Ok(size);
                }
                Err(err)
                    if index + 1 < urls.len()
                        && matches!(
                            err.kind(),
                            ErrorKind::TransientNetwork | ErrorKind::PermanentRequest
                        ) =>
                {
                    warn!(url = %url, error = %err, "Mirror failed; trying next URL");
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_error.unwrap_or(DownloadError::Cancelled))
    }

    async fn remux(&self, output: &Path, token: &CancellationToken) -> Result<(), DownloadError> {
        let Some(toolkit) = self.toolkit.as_ref().filter(|_| self.config.remux) else {
            return Ok(());
        };
        if let Err(err) = toolkit.remux(output, token).await {
            remove_file_quietly(output).await;
            return Err(err);
        }
        Ok(())
    }

    async fn download_from(
        &self,
        url: &str,
        output: &Path,
        token: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let size = self.discover_size(url, token).await?;
        let limit = self.config.max_file_size;

        if let Some(size) = size
            && size > limit
        {
            return Err(DownloadError::SizeExceeded { size, limit });
        }

        let result = match size {
            Some(size) if size <= self.config.max_in_memory => {
                self.download_in_memory(url, size, output, token).await
            }
            Some(size) => self.download_ranges(url, size, output, token).await,
            None => self.download_streaming(url, output, token).await,
        };

        if result.is_err() {
            remove_file_quietly(output).await;
        }
        result
    }

    /// HEAD, then `Range: bytes=0-0`, then unknown.
    async fn discover_size(
        &self,
        url: &str,
        token: &CancellationToken,
    ) -> Result<Option<u64>, DownloadError> {
        let policy = RetryPolicy::from_config(&self.config);
        let http = self.http.as_ref();
        let config = &self.config;

        let head = retry_with_backoff(&policy, token, move |_| async move {
            let request = HttpRequest::head(url).configured(config);
            RetryAction::from_result(send_checked(http, request, "HEAD").await)
        })
        .await;
        match head {
            Ok(response) => {
                if let Some(size) = response
                    .content_length()
                    .or_else(|| response.content_range_total())
                    .filter(|size| *size > 0)
                {
                    debug!(url = %url, size, "Size from HEAD");
                    return Ok(Some(size));
                }
            }
            Err(DownloadError::Cancelled) => return Err(DownloadError::Cancelled),
            Err(err) => debug!(url = %url, error = %err, "HEAD failed; probing with a range request"),
        }

        let probe = retry_with_backoff(&policy, token, move |_| async move {
            let request = HttpRequest::get(url).configured(config).with_range(0, 0);
            RetryAction::from_result(send_checked(http, request, "range probe").await)
        })
        .await;
        match probe {
            Ok(response) => {
                let size = response.content_range_total().filter(|size| *size > 0);
                debug!(url = %url, size = ?size, "Size from range probe");
                Ok(size)
            }
            Err(DownloadError::Cancelled) => Err(DownloadError::Cancelled),
            Err(err) => {
                debug!(url = %url, error = %err, "Range probe failed; size unknown");
                Ok(None)
            }
        }
    }

    async fn download_in_memory(
        &self,
        url: &str,
        size: u64,
        output: &Path,
        token: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let policy = RetryPolicy::from_config(&self.config);
        let http = self.http.as_ref();
        let config = &self.config;

        let data = retry_with_backoff(&policy, token, move |_| async move {
            let result = async {
                let request = HttpRequest::get(url).configured(config);
                let data = send_checked(http, request, "GET")
                    .await?
                    .bytes_limited(config.max_file_size)
                    .await?;
                if data.len() as u64 != size {
                    return Err(DownloadError::transport(format!(
                        "expected {size} bytes, received {}",
                        data.len()
                    )));
                }
                Ok(data)
            }
            .await;
            RetryAction::from_result(result)
        })
        .await?;

        tokio::fs::write(output, &data).await?;
        debug!(url = %url, size, "Downloaded in memory");
        Ok(size)
    }

    async fn download_streaming(
        &self,
        url: &str,
        output: &Path,
        token: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let policy = RetryPolicy::from_config(&self.config);
        let http = self.http.as_ref();
        let config = &self.config;

        info!(url = %url, "Size unknown; streaming in a single request");
        retry_with_backoff(&policy, token, move |_| async move {
            let result = async {
                let request = HttpRequest::get(url).configured(config);
                let response = send_checked(http, request, "GET").await?;
                stream_to_file(response, output, config.max_file_size, token).await
            }
            .await;
            RetryAction::from_result(result)
        })
        .await
    }

    async fn download_ranges(
        &self,
        url: &str,
        size: u64,
        output: &Path,
        token: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let chunks = plan_chunks(size, self.config.chunk_size);
        let concurrency = effective_concurrency(self.config.concurrency, chunks.len());
        info!(url = %url, size, chunks = chunks.len(), concurrency, "Starting chunked download");

        let file = tokio::fs::File::create(output).await?;
        file.set_len(size).await?;
        let file = Arc::new(Mutex::new(file));

        let child = token.child_token();
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let completed = Arc::new(AtomicU64::new(0));
        let url: Arc<str> = Arc::from(url);
        let mut tasks = JoinSet::new();

        for (index, range) in chunks.into_iter().enumerate() {
            let http = Arc::clone(&self.http);
            let config = self.config.clone();
            let url = Arc::clone(&url);
            let file = Arc::clone(&file);
            let token = child.clone();
            let semaphore = Arc::clone(&semaphore);
            let completed = Arc::clone(&completed);

            tasks.spawn(async move {
                let _permit = tokio::select! {
                    _ = token.cancelled() => return Err(DownloadError::Cancelled),
                    permit = semaphore.acquire_owned() => permit.map_err(|_| DownloadError::Cancelled)?,
                };

                let data = fetch_range(http.as_ref(), &config, &url, range, &token).await?;

                {
                    let mut file = file.lock().await;
                    if token.is_cancelled() {
                        return Err(DownloadError::Cancelled);
                    }
                    file.seek(SeekFrom::Start(range.start)).await?;
                    file.write_all(&data).await?;
                }

                let done = completed.fetch_add(range.length(), Ordering::Relaxed) + range.length();
                config.report_progress(done as f64 / size as f64);
                debug!(chunk = index, start = range.start, end = range.end, "Chunk written");
                Ok(())
            });
        }

        let mut first_error: Option<DownloadError> = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(DownloadError::Io {
                    source: std::io::Error::other(format!("chunk task failed: {e}")),
                })
            });
            if let Err(err) = result {
                if first_error.is_none() {
                    child.cancel();
                    first_error = Some(err);
                } else if !err.is_cancelled() {
                    debug!(error = %err, "Additional chunk failure after cancellation");
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }

        let mut file = file.lock().await;
        file.flush().await?;
        file.sync_all().await?;
        info!(url = %url, size, "Chunked download finished");
        Ok(size)
    }
}

/// Ranged GET for one chunk with the shared retry policy.
///
/// A body whose length differs from the range is treated as transient.
async fn fetch_range(
    http: &dyn HttpClient,
    config: &DownloadConfig,
    url: &str,
    range: ByteRange,
    token: &CancellationToken,
) -> Result<Bytes, DownloadError> {
    let policy = RetryPolicy::from_config(config);
    retry_with_backoff(&policy, token, move |_| async move {
        let result = async {
            let request = HttpRequest::get(url)
                .configured(config)
                .with_range(range.start, range.end);
            let data = send_checked(http, request, "chunk fetch")
                .await?
                .bytes_limited(range.length())
                .await
                .map_err(|err| match err {
                    DownloadError::SizeExceeded { size, .. } => DownloadError::transport(format!(
                        "chunk {}-{} overran its range ({size} bytes)",
                        range.start, range.end
                    )),
                    other => other,
                })?;
            if data.len() as u64 != range.length() {
                return Err(DownloadError::transport(format!(
                    "chunk {}-{} returned {} bytes",
                    range.start,
                    range.end,
                    data.len()
                )));
            }
            Ok(data)
        }
        .await;
        RetryAction::from_result(result)
    })
    .await
}
