//! Concurrent segment download with optional decryption and ordered reassembly.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{remove_file_quietly, stream_to_file};
use crate::config::DownloadConfig;
use crate::decrypt::SegmentDecryptor;
use crate::error::DownloadError;
use crate::http::{HttpClient, HttpRequest, send_checked};
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};
use crate::toolkit::MediaToolkit;

pub struct SegmentedDownloader {
    http: Arc<dyn HttpClient>,
    toolkit: Arc<dyn MediaToolkit>,
    config: DownloadConfig,
}

/// Temp file name for the segment at `index`.
pub fn segment_file_name(index: usize) -> String {
    format!("seg_{index:05}")
}

fn close_temp_dir(dir: TempDir) {
    let path = dir.path().to_path_buf();
    if let Err(e) = dir.close() {
        warn!(path = %path.display(), error = %e, "Failed to remove segment directory");
    }
}

impl SegmentedDownloader {
    pub fn new(
        http: Arc<dyn HttpClient>,
        toolkit: Arc<dyn MediaToolkit>,
        config: DownloadConfig,
    ) -> Self {
        Self {
            http,
            toolkit,
            config: config.with_defaults(),
        }
    }

    /// Download `segment_urls` in parallel and join them, in order, into `output`.
    ///
    /// Entries before `first_media_index` (the init segment) are never
    /// decrypted; the media segment at position `m` after it is decrypted
    /// with sequence `decryptor.base_sequence() + m`.
    #[instrument(skip_all, fields(output = %output.display(), segments = segment_urls.len()))]
    pub async fn download(
        &self,
        segment_urls: &[String],
        output: &Path,
        decryptor: Option<&SegmentDecryptor>,
        first_media_index: usize,
        token: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        if segment_urls.is_empty() {
            return Err(DownloadError::invalid_input("no segments to download"));
        }

        let parent = match output.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tokio::fs::create_dir_all(&parent).await?;
        let temp_dir = tempfile::Builder::new()
            .prefix(".mediagrab-")
            .tempdir_in(&parent)?;

        let paths: Vec<PathBuf> = (0..segment_urls.len())
            .map(|i| temp_dir.path().join(segment_file_name(i)))
            .collect();

        let fetched = self
            .fetch_all(segment_urls, &paths, decryptor, first_media_index, token)
            .await;
        if let Err(err) = fetched {
            close_temp_dir(temp_dir);
            return Err(err);
        }

        let result = self.assemble(&paths, output, token).await;
        close_temp_dir(temp_dir);
        if result.is_err() {
            remove_file_quietly(output).await;
        }
        result
    }

    async fn assemble(
        &self,
        paths: &[PathBuf],
        output: &Path,
        token: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        for path in paths {
            if !tokio::fs::try_exists(path).await? {
                return Err(DownloadError::corrupt(format!(
                    "segment file {} is missing",
                    path.display()
                )));
            }
        }

        self.toolkit.concat(paths, output, token).await?;
        let size = tokio::fs::metadata(output).await?.len();
        info!(segments = paths.len(), size, "Segments merged");
        Ok(size)
    }

    async fn fetch_all(
        &self,
        segment_urls: &[String],
        paths: &[PathBuf],
        decryptor: Option<&SegmentDecryptor>,
        first_media_index: usize,
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let total = segment_urls.len();
        let child = token.child_token();
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let completed = Arc::new(AtomicUsize::new(0));
        let bytes = Arc::new(AtomicU64::new(0));
        let decryptor = decryptor
            .cloned()
            .map(|d| Arc::new(d.with_in_memory_limit(self.config.max_in_memory)));
        let mut tasks = JoinSet::new();

        for (index, (url, path)) in segment_urls.iter().zip(paths).enumerate() {
            let http = Arc::clone(&self.http);
            let config = self.config.clone();
            let url = url.clone();
            let path = path.clone();
            let token = child.clone();
            let semaphore = Arc::clone(&semaphore);
            let completed = Arc::clone(&completed);
            let bytes = Arc::clone(&bytes);
            let decryptor = decryptor.clone();

            tasks.spawn(async move {
                let _permit = tokio::select! {
                    _ = token.cancelled() => return Err(DownloadError::Cancelled),
                    permit = semaphore.acquire_owned() => permit.map_err(|_| DownloadError::Cancelled)?,
                };

                let size = fetch_segment(http.as_ref(), &config, &url, &path, &token).await?;

                let cumulative = bytes.fetch_add(size, Ordering::Relaxed) + size;
                if cumulative > config.max_file_size {
                    return Err(DownloadError::SizeExceeded {
                        size: cumulative,
                        limit: config.max_file_size,
                    });
                }

                if let Some(decryptor) = decryptor.as_deref()
                    && index >= first_media_index
                {
                    let sequence = decryptor.base_sequence() + (index - first_media_index) as u64;
                    decryptor.decrypt_in_place(&path, sequence).await?;
                }

                let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                config.report_progress(done as f64 / total as f64);
                debug!(segment = index, size, "Segment ready");
                Ok(())
            });
        }

        let mut first_error: Option<DownloadError> = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(DownloadError::Io {
                    source: std::io::Error::other(format!("segment task failed: {e}")),
                })
            });
            if let Err(err) = result
                && first_error.is_none()
            {
                child.cancel();
                first_error = Some(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn fetch_segment(
    http: &dyn HttpClient,
    config: &DownloadConfig,
    url: &str,
    path: &Path,
    token: &CancellationToken,
) -> Result<u64, DownloadError> {
    let policy = RetryPolicy::from_config(config);
    retry_with_backoff(&policy, token, move |_| async move {
        let result = async {
            let request = HttpRequest::get(url).configured(config);
            let response = send_checked(http, request, "segment fetch").await?;
            stream_to_file(response, path, config.max_file_size, token).await
        }
        .await;
        RetryAction::from_result(result)
    })
    .await
}
