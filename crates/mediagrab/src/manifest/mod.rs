//! Manifest parsing: turns HLS playlists and DASH MPDs into [`MediaFormat`]s.

pub mod dash;
pub mod duration;
pub mod hls;
pub mod template;

use std::sync::Arc;

use bytes::Bytes;
use media_types::MediaFormat;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use url::Url;

use crate::config::DownloadConfig;
use crate::error::DownloadError;
use crate::http::{HttpClient, HttpRequest, send_checked};
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};

pub use duration::parse_iso8601_duration;
pub use template::{TemplateVars, expand_template};

/// Manifests larger than this are rejected.
const MAX_MANIFEST_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    Hls,
    Dash,
}

impl ManifestKind {
    /// Sniff the manifest kind from its content, falling back to the URL extension.
    pub fn detect(url: &str, bytes: &[u8]) -> Option<Self> {
        let head = &bytes[..bytes.len().min(4096)];
        let text = String::from_utf8_lossy(head);
        let text = text.trim_start_matches('\u{feff}').trim_start();
        if text.starts_with("#EXTM3U") {
            return Some(Self::Hls);
        }
        if text.contains("<MPD") {
            return Some(Self::Dash);
        }
        Self::from_url(url)
    }

    pub fn from_url(url: &str) -> Option<Self> {
        let path = Url::parse(url)
            .map(|u| u.path().to_ascii_lowercase())
            .unwrap_or_else(|_| url.to_ascii_lowercase());
        if path.ends_with(".m3u8") || path.ends_with(".m3u") {
            Some(Self::Hls)
        } else if path.ends_with(".mpd") {
            Some(Self::Dash)
        } else {
            None
        }
    }
}

/// Everything a parser needs for nested fetches.
#[derive(Clone)]
pub struct ManifestContext {
    pub http: Arc<dyn HttpClient>,
    pub config: DownloadConfig,
    pub token: CancellationToken,
}

impl ManifestContext {
    pub fn new(http: Arc<dyn HttpClient>, config: DownloadConfig, token: CancellationToken) -> Self {
        Self {
            http,
            config: config.with_defaults(),
            token,
        }
    }

    /// GET `url` with the shared retry policy and return the whole body.
    pub(crate) async fn fetch_bytes(
        &self,
        url: &str,
        operation: &'static str,
    ) -> Result<Bytes, DownloadError> {
        let policy = RetryPolicy::from_config(&self.config);
        let http = self.http.as_ref();
        let config = &self.config;
        retry_with_backoff(&policy, &self.token, move |_| async move {
            let request = HttpRequest::get(url).configured(config);
            let result = async {
                send_checked(http, request, operation)
                    .await?
                    .bytes_limited(MAX_MANIFEST_SIZE)
                    .await
            }
            .await;
            RetryAction::from_result(result)
        })
        .await
    }
}

/// Parse manifest bytes fetched from `url`.
pub async fn parse_manifest(
    bytes: &[u8],
    url: &str,
    ctx: &ManifestContext,
) -> Result<Vec<MediaFormat>, DownloadError> {
    let base = Url::parse(url).map_err(|e| DownloadError::invalid_url(url, e))?;
    match ManifestKind::detect(url, bytes) {
        Some(ManifestKind::Hls) => hls::parse(bytes, &base, ctx).await,
        Some(ManifestKind::Dash) => dash::parse(bytes, &base),
        None => Err(DownloadError::manifest(format!(
            "unrecognised manifest format at {url}"
        ))),
    }
}

/// Download and parse the manifest at `url`.
#[instrument(skip(ctx), fields(url = %url))]
pub async fn fetch_manifest(
    url: &str,
    ctx: &ManifestContext,
) -> Result<Vec<MediaFormat>, DownloadError> {
    let bytes = ctx.fetch_bytes(url, "manifest fetch").await?;
    debug!(size = bytes.len(), "Fetched manifest");
    parse_manifest(&bytes, url, ctx).await
}

/// Resolve `reference` against `base`, keeping absolute URLs as they are.
pub(crate) fn resolve_url(base: &Url, reference: &str) -> Result<Url, DownloadError> {
    base.join(reference.trim())
        .map_err(|e| DownloadError::invalid_url(reference, e))
}
