//! Acquisition orchestrator: one item, one format, one finished file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use media_types::{KeyMethod, MediaFormat, MediaItem};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::DownloadConfig;
use crate::decrypt::SegmentDecryptor;
use crate::download::{ChunkedDownloader, SegmentedDownloader, remove_file_quietly};
use crate::error::DownloadError;
use crate::http::{HttpClient, HttpRequest, send_checked};
use crate::plugins::{PluginContext, PostProcessor};
use crate::resolver::resolve_default;
use crate::toolkit::MediaToolkit;

/// What to acquire: an item and the format picked from it.
#[derive(Debug, Clone)]
pub struct AcquireRequest {
    pub item: MediaItem,
    pub format: MediaFormat,
}

impl AcquireRequest {
    pub fn new(item: MediaItem, format: MediaFormat) -> Self {
        Self { item, format }
    }

    /// Resolve the item's defaults and request the primary format.
    pub fn default_format(mut item: MediaItem) -> Result<Self, DownloadError> {
        let format = resolve_default(&mut item).ok_or_else(|| {
            DownloadError::invalid_input(format!("item {} has no formats", item.content_id))
        })?;
        Ok(Self { item, format })
    }

    /// Request the format with `format_id`. Defaults are still resolved so
    /// plugins can find the item's default audio.
    pub fn with_format_id(mut item: MediaItem, format_id: &str) -> Result<Self, DownloadError> {
        resolve_default(&mut item);
        let format = item.format(format_id).cloned().ok_or_else(|| {
            DownloadError::invalid_input(format!(
                "format `{format_id}` not found in item {}",
                item.content_id
            ))
        })?;
        Ok(Self { item, format })
    }
}

/// A finished acquisition.
#[derive(Debug, Clone)]
pub struct DownloadedMedia {
    pub path: PathBuf,
    pub thumbnail_path: Option<PathBuf>,
    pub item: MediaItem,
    pub format: MediaFormat,
    /// Position of the originating request in an `acquire_all` batch.
    pub index: usize,
}

impl DownloadedMedia {
    /// Delete the media file and its thumbnail.
    pub async fn remove_files(&self) {
        remove_file_quietly(&self.path).await;
        if let Some(thumbnail) = &self.thumbnail_path {
            remove_file_quietly(thumbnail).await;
        }
    }
}

/// Keep file names portable whatever the content id looks like.
fn sanitize_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "media".to_string()
    } else {
        trimmed.to_string()
    }
}

/// `<content_id>_<format_id>.<ext>` inside `dir`.
pub fn output_path(dir: &Path, item: &MediaItem, format: &MediaFormat) -> PathBuf {
    dir.join(format!(
        "{}_{}.{}",
        sanitize_component(&item.content_id),
        sanitize_component(&format.format_id),
        format.extension()
    ))
}

fn thumbnail_path(output: &Path) -> PathBuf {
    output.with_extension("thumb.jpg")
}

/// Download `format` into `output` without any post-processing.
///
/// Segmented formats go through the segment pipeline (decrypting with the
/// configured key, or the format's own AES-128 key); everything else is a
/// ranged download of the first reachable mirror.
pub async fn download_format(
    http: Arc<dyn HttpClient>,
    toolkit: Arc<dyn MediaToolkit>,
    config: &DownloadConfig,
    format: &MediaFormat,
    output: &Path,
    token: &CancellationToken,
) -> Result<u64, DownloadError> {
    if !format.is_segmented() {
        return ChunkedDownloader::new(http, config.clone())
            .with_toolkit(toolkit)
            .download(&format.urls, output, token)
            .await;
    }

    let key = config
        .decryption_key
        .as_ref()
        .or(format.decryption_key.as_ref());
    let decryptor = match key {
        Some(key) if key.method == KeyMethod::Aes128 => Some(SegmentDecryptor::from_key(key)?),
        Some(key) => {
            warn!(
                format = %format.format_id,
                method = ?key.method,
                "Decryption method not supported; downloading segments as-is"
            );
            None
        }
        None => None,
    };
    let first_media_index = usize::from(format.init_segment.is_some());

    SegmentedDownloader::new(http, toolkit, config.clone())
        .download(
            &format.segment_urls(),
            output,
            decryptor.as_ref(),
            first_media_index,
            token,
        )
        .await
}

/// Runs acquisitions against a shared HTTP client and toolkit.
#[derive(Clone)]
pub struct Acquirer {
    http: Arc<dyn HttpClient>,
    toolkit: Arc<dyn MediaToolkit>,
    output_dir: PathBuf,
    plugins: Vec<Arc<dyn PostProcessor>>,
}

impl Acquirer {
    pub fn new(
        http: Arc<dyn HttpClient>,
        toolkit: Arc<dyn MediaToolkit>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            http,
            toolkit,
            output_dir: output_dir.into(),
            plugins: Vec::new(),
        }
    }

    /// Register a post-processor. Plugins run in registration order.
    pub fn with_plugin(mut self, plugin: impl PostProcessor + 'static) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub async fn acquire(
        &self,
        request: AcquireRequest,
        config: &DownloadConfig,
        token: &CancellationToken,
    ) -> Result<DownloadedMedia, DownloadError> {
        self.acquire_indexed(request, 0, config, token).await
    }

    /// Acquire every request with at most `config.concurrency` in flight.
    ///
    /// Results come back in input order, one per request.
    pub async fn acquire_all(
        &self,
        requests: Vec<AcquireRequest>,
        config: &DownloadConfig,
        token: &CancellationToken,
    ) -> Vec<Result<DownloadedMedia, DownloadError>> {
        let concurrency = config.concurrency.max(1);
        let mut results: Vec<(usize, Result<DownloadedMedia, DownloadError>)> =
            futures::stream::iter(requests.into_iter().enumerate())
                .map(|(index, request)| async move {
                    let result = self.acquire_indexed(request, index, config, token).await;
                    if let Err(err) = &result {
                        warn!(index, error = %err, "Acquisition failed");
                    }
                    (index, result)
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;
        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, result)| result).collect()
    }

    /// [`Acquirer::acquire`] bounded by `deadline`.
    ///
    /// On expiry the acquisition is cancelled, its cleanup awaited, and
    /// `DeadlineExceeded` returned.
    pub async fn acquire_with_deadline(
        &self,
        request: AcquireRequest,
        config: &DownloadConfig,
        token: &CancellationToken,
        deadline: Duration,
    ) -> Result<DownloadedMedia, DownloadError> {
        let child = token.child_token();
        let acquisition = self.acquire(request, config, &child);
        tokio::pin!(acquisition);

        tokio::select! {
            result = &mut acquisition => result,
            _ = tokio::time::sleep(deadline) => {
                warn!(deadline_secs = deadline.as_secs_f64(), "Deadline reached; cancelling acquisition");
                child.cancel();
                if let Ok(media) = acquisition.await {
                    media.remove_files().await;
                }
                Err(DownloadError::DeadlineExceeded {
                    seconds: deadline.as_secs_f64(),
                })
            }
        }
    }

    #[instrument(skip_all, fields(content_id = %request.item.content_id, format = %request.format.format_id, index = index))]
    async fn acquire_indexed(
        &self,
        request: AcquireRequest,
        index: usize,
        config: &DownloadConfig,
        token: &CancellationToken,
    ) -> Result<DownloadedMedia, DownloadError> {
        let AcquireRequest { item, format } = request;
        let config = config.clone().with_defaults();

        tokio::fs::create_dir_all(&self.output_dir).await?;
        let output = output_path(&self.output_dir, &item, &format);
        info!(
            output = %output.display(),
            segmented = format.is_segmented(),
            "Starting acquisition"
        );

        let size = download_format(
            Arc::clone(&self.http),
            Arc::clone(&self.toolkit),
            &config,
            &format,
            &output,
            token,
        )
        .await?;

        let thumbnail = self.fetch_thumbnail(&format, &output, &config, token).await;
        let mut media = DownloadedMedia {
            path: output,
            thumbnail_path: thumbnail,
            item,
            format,
            index,
        };

        if let Err(err) = self.run_plugins(&mut media, &config, token).await {
            media.remove_files().await;
            return Err(err);
        }

        info!(path = %media.path.display(), size, "Acquisition finished");
        Ok(media)
    }

    async fn run_plugins(
        &self,
        media: &mut DownloadedMedia,
        config: &DownloadConfig,
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let ctx = PluginContext {
            http: Arc::clone(&self.http),
            toolkit: Arc::clone(&self.toolkit),
            config,
            token,
        };
        for plugin in &self.plugins {
            if token.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            if !plugin.applies_to(media) {
                continue;
            }
            debug!(plugin = plugin.name(), "Running post-processor");
            plugin.process(media, &ctx).await.map_err(|err| match err {
                DownloadError::Cancelled | DownloadError::Plugin { .. } => err,
                other => DownloadError::plugin(plugin.name(), other),
            })?;
        }
        Ok(())
    }

    /// First thumbnail that downloads wins; failures only log.
    async fn fetch_thumbnail(
        &self,
        format: &MediaFormat,
        output: &Path,
        config: &DownloadConfig,
        token: &CancellationToken,
    ) -> Option<PathBuf> {
        let path = thumbnail_path(output);
        for url in &format.thumbnail_urls {
            if token.is_cancelled() {
                return None;
            }
            let result = async {
                let request = HttpRequest::get(url.as_str()).configured(config);
                let data = send_checked(self.http.as_ref(), request, "thumbnail fetch")
                    .await?
                    .bytes_limited(config.max_in_memory)
                    .await?;
                tokio::fs::write(&path, &data).await?;
                Ok::<_, DownloadError>(())
            }
            .await;
            match result {
                Ok(()) => return Some(path),
                Err(err) => warn!(url = %url, error = %err, "Thumbnail download failed"),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use media_types::MediaType;

    #[test]
    fn output_names_are_portable() {
        let item = MediaItem::new("a/b c", "https://example.com");
        let format = MediaFormat::new("hls-1200", MediaType::Video);
        assert_eq!(
            output_path(Path::new("/out"), &item, &format),
            Path::new("/out/a_b_c_hls-1200.mp4")
        );
        assert_eq!(sanitize_component(".."), "media");
    }

    #[test]
    fn thumbnail_sits_beside_output() {
        assert_eq!(
            thumbnail_path(Path::new("/out/x_a.m4a")),
            Path::new("/out/x_a.thumb.jpg")
        );
    }

    #[test]
    fn request_by_id_and_default() {
        let mut item = MediaItem::new("x", "https://example.com/x");
        item.push_format(MediaFormat::new("a", MediaType::Audio).with_url("https://example.com/a"));
        item.push_format(MediaFormat::new("p", MediaType::Photo).with_url("https://example.com/p"));

        let request = AcquireRequest::default_format(item.clone()).unwrap();
        assert_eq!(request.format.format_id, "a");

        let request = AcquireRequest::with_format_id(item.clone(), "p").unwrap();
        assert_eq!(request.format.format_id, "p");

        let err = AcquireRequest::with_format_id(item, "missing").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidInput);
    }
}
