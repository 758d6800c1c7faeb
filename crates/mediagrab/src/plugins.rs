//! Post-processing steps run on a finished acquisition.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use media_types::{MediaFormat, MediaType};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::acquire::{DownloadedMedia, download_format};
use crate::config::DownloadConfig;
use crate::download::remove_file_quietly;
use crate::error::DownloadError;
use crate::http::HttpClient;
use crate::resolver::default_audio;
use crate::toolkit::{MediaToolkit, TrackMetadata};

/// Shared resources handed to every plugin invocation.
pub struct PluginContext<'a> {
    pub http: Arc<dyn HttpClient>,
    pub toolkit: Arc<dyn MediaToolkit>,
    pub config: &'a DownloadConfig,
    pub token: &'a CancellationToken,
}

/// A step applied to a downloaded file.
///
/// A plugin rewrites `media.path` in place; on error the orchestrator deletes
/// the output, so implementations only clean up their own temporaries.
#[async_trait]
pub trait PostProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    fn applies_to(&self, media: &DownloadedMedia) -> bool;

    async fn process(
        &self,
        media: &mut DownloadedMedia,
        ctx: &PluginContext<'_>,
    ) -> Result<(), DownloadError>;
}

/// Fetches the item's default audio and muxes it into a video-only download.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeAudioPlugin;

fn audio_companion_path(video: &Path, audio: &MediaFormat) -> PathBuf {
    let stem = video
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "media".to_string());
    video.with_file_name(format!("{stem}.audio.{}", audio.extension()))
}

#[async_trait]
impl PostProcessor for MergeAudioPlugin {
    fn name(&self) -> &'static str {
        "merge-audio"
    }

    fn applies_to(&self, media: &DownloadedMedia) -> bool {
        media.format.merge_audio && media.format.media_type == MediaType::Video
    }

    async fn process(
        &self,
        media: &mut DownloadedMedia,
        ctx: &PluginContext<'_>,
    ) -> Result<(), DownloadError> {
        let audio = media
            .item
            .default_of(MediaType::Audio)
            .or_else(|| default_audio(&media.item.formats))
            .cloned()
            .ok_or_else(|| DownloadError::plugin(self.name(), "item has no audio format to merge"))?;

        let audio_path = audio_companion_path(&media.path, &audio);
        debug!(audio = %audio.format_id, path = %audio_path.display(), "Fetching audio track");

        let result = async {
            download_format(
                Arc::clone(&ctx.http),
                Arc::clone(&ctx.toolkit),
                ctx.config,
                &audio,
                &audio_path,
                ctx.token,
            )
            .await?;
            ctx.toolkit
                .mux(&media.path, &audio_path, &media.path, ctx.token)
                .await
        }
        .await;
        remove_file_quietly(&audio_path).await;
        result?;

        info!(
            video = %media.format.format_id,
            audio = %audio.format_id,
            "Audio merged"
        );
        Ok(())
    }
}

/// Writes title/artist tags and the thumbnail as cover art into audio files.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataPlugin;

#[async_trait]
impl PostProcessor for MetadataPlugin {
    fn name(&self) -> &'static str {
        "metadata"
    }

    fn applies_to(&self, media: &DownloadedMedia) -> bool {
        media.format.media_type == MediaType::Audio
            && (media.format.title.is_some() || media.format.artist.is_some())
    }

    async fn process(
        &self,
        media: &mut DownloadedMedia,
        ctx: &PluginContext<'_>,
    ) -> Result<(), DownloadError> {
        let metadata = TrackMetadata {
            title: media.format.title.clone(),
            artist: media.format.artist.clone(),
            cover: media.thumbnail_path.clone(),
        };
        ctx.toolkit
            .embed_metadata(&media.path, &metadata, ctx.token)
            .await?;
        debug!(path = %media.path.display(), "Metadata embedded");
        Ok(())
    }
}
