use std::sync::Arc;
use std::time::Duration;

use mediagrab_engine::{
    AcquireRequest, Acquirer, DownloadConfig, DownloadedMedia, FfmpegToolkit, HttpClient,
    ManifestContext, ManifestKind, MediaFormat, MediaItem, MediaToolkit, MediaType,
    MergeAudioPlugin, MetadataPlugin, ReqwestClient, build_client, fetch_manifest, ranked_formats,
    resolve_default,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::output::{PROGRESS_SCALE, format_json, format_table, progress_bar};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct CommandExecutor {
    config: AppConfig,
    http: Arc<dyn HttpClient>,
    toolkit: Arc<dyn MediaToolkit>,
    quiet: bool,
}

/// Last path segment without its extension, or `media`.
fn content_id_from_url(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .map(|name| name.split('.').next().unwrap_or(name))
        .filter(|stem| !stem.is_empty())
        .unwrap_or("media")
        .to_string()
}

/// Guess the category of a direct link from its extension.
fn direct_media_type(url: &Url) -> MediaType {
    let extension = url
        .path()
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "mp3" | "m4a" | "aac" | "opus" | "flac" | "ogg" | "oga" => MediaType::Audio,
        "jpg" | "jpeg" | "png" | "webp" | "gif" => MediaType::Photo,
        _ => MediaType::Video,
    }
}

/// Pick the requested format, the resolved default, or the first format.
fn select_request(item: MediaItem, format_id: Option<&str>) -> Result<AcquireRequest> {
    if let Some(format_id) = format_id {
        return Ok(AcquireRequest::with_format_id(item, format_id)?);
    }
    let mut item = item;
    match resolve_default(&mut item) {
        Some(format) => Ok(AcquireRequest::new(item, format)),
        None => {
            let format = item.formats.first().cloned().ok_or_else(|| {
                AppError::InvalidInput(format!("no formats found for {}", item.source_url))
            })?;
            debug!(format = %format.format_id, "No default resolved; using the first format");
            Ok(AcquireRequest::new(item, format))
        }
    }
}

impl CommandExecutor {
    pub fn new(config: AppConfig, quiet: bool) -> Result<Self> {
        let proxy = config.proxy_config()?;
        let client = build_client(proxy.as_ref(), CONNECT_TIMEOUT)?;
        let toolkit = match &config.ffmpeg {
            Some(path) => FfmpegToolkit::with_binary(path.clone()),
            None => FfmpegToolkit::new(),
        };
        Ok(Self {
            config,
            http: Arc::new(ReqwestClient::new(client)),
            toolkit: Arc::new(toolkit),
            quiet,
        })
    }

    /// Build the item behind `url`: manifests are parsed, anything else is a
    /// single direct format.
    async fn load_item(
        &self,
        url: &str,
        download: &DownloadConfig,
        token: &CancellationToken,
    ) -> Result<MediaItem> {
        let parsed = Url::parse(url)
            .map_err(|e| AppError::InvalidInput(format!("invalid URL `{url}`: {e}")))?;
        let mut item = MediaItem::new(content_id_from_url(&parsed), url);

        if ManifestKind::from_url(url).is_some() {
            let ctx = ManifestContext::new(Arc::clone(&self.http), download.clone(), token.clone());
            let formats = fetch_manifest(url, &ctx).await?;
            info!(url = %url, formats = formats.len(), "Manifest parsed");
            item.extend_formats(formats);
        } else {
            let media_type = direct_media_type(&parsed);
            item.push_format(MediaFormat::new("direct", media_type).with_url(url));
        }
        Ok(item)
    }

    pub async fn probe(&self, url: &str, json: bool, token: &CancellationToken) -> Result<()> {
        let download = self.config.download_config()?;
        let mut item = self.load_item(url, &download, token).await?;
        resolve_default(&mut item);
        let ranked = ranked_formats(&item.formats);

        if json {
            println!("{}", format_json(&item, &ranked)?);
        } else {
            print!("{}", format_table(&ranked));
        }
        Ok(())
    }

    pub async fn fetch(
        &self,
        url: &str,
        format_id: Option<&str>,
        deadline: Option<Duration>,
        token: &CancellationToken,
    ) -> Result<DownloadedMedia> {
        let mut download = self.config.download_config()?;
        let item = self.load_item(url, &download, token).await?;
        let request = select_request(item, format_id)?;
        info!(
            content_id = %request.item.content_id,
            format = %request.format.format_id,
            "Selected format"
        );

        let bar = progress_bar(self.quiet);
        bar.set_message(request.format.format_id.clone());
        let callback_bar = bar.clone();
        download.progress = Some(Arc::new(move |fraction: f64| {
            callback_bar.set_position((fraction * PROGRESS_SCALE as f64) as u64);
        }));

        let acquirer = Acquirer::new(
            Arc::clone(&self.http),
            Arc::clone(&self.toolkit),
            self.config.output_dir(),
        )
        .with_plugin(MergeAudioPlugin)
        .with_plugin(MetadataPlugin);

        let result = match deadline {
            Some(deadline) => {
                acquirer
                    .acquire_with_deadline(request, &download, token, deadline)
                    .await
            }
            None => acquirer.acquire(request, &download, token).await,
        };

        match &result {
            Ok(_) => bar.finish_and_clear(),
            Err(e) => {
                bar.abandon();
                warn!(error = %e, "Download failed");
            }
        }
        Ok(result?)
    }
}
