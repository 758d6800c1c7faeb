//! HLS playlists via `m3u8-rs`.

use std::collections::HashSet;

use futures::StreamExt;
use m3u8_rs::{
    AlternativeMedia, AlternativeMediaType, MasterPlaylist, MediaPlaylist, Playlist, VariantStream,
};
use media_types::{DecryptionKey, KeyMethod, MediaFormat, MediaType, classify_codecs};
use tracing::{debug, warn};
use url::Url;

use super::{ManifestContext, resolve_url};
use crate::error::DownloadError;

/// Segment data pulled from one media playlist.
#[derive(Debug, Default)]
struct MediaInfo {
    segments: Vec<String>,
    init_segment: Option<String>,
    duration: f64,
    decryption_key: Option<DecryptionKey>,
}

impl MediaInfo {
    fn apply_to(self, format: &mut MediaFormat) {
        format.segments = self.segments;
        format.init_segment = self.init_segment;
        format.duration = self.duration;
        format.decryption_key = self.decryption_key;
    }
}

pub(crate) async fn parse(
    bytes: &[u8],
    url: &Url,
    ctx: &ManifestContext,
) -> Result<Vec<MediaFormat>, DownloadError> {
    match m3u8_rs::parse_playlist_res(bytes) {
        Ok(Playlist::MediaPlaylist(playlist)) => {
            let mut format = MediaFormat::new("hls", MediaType::Video);
            load_media(&playlist, url, ctx).await?.apply_to(&mut format);
            Ok(vec![format])
        }
        Ok(Playlist::MasterPlaylist(playlist)) => expand_master(playlist, url, ctx).await,
        Err(e) => Err(DownloadError::manifest(format!(
            "failed to parse playlist {url}: {e}"
        ))),
    }
}

async fn load_media(
    playlist: &MediaPlaylist,
    base: &Url,
    ctx: &ManifestContext,
) -> Result<MediaInfo, DownloadError> {
    let mut info = MediaInfo::default();

    for (index, segment) in playlist.segments.iter().enumerate() {
        if segment.byte_range.is_some() {
            warn!(
                url = %base,
                kept = index,
                total = playlist.segments.len(),
                "Byte-range segments are not supported; truncating playlist"
            );
            break;
        }
        if segment.uri.trim().is_empty() {
            continue;
        }

        if info.init_segment.is_none()
            && let Some(map) = &segment.map
        {
            info.init_segment = Some(resolve_url(base, &map.uri)?.to_string());
        }

        if info.decryption_key.is_none()
            && let Some(key) = &segment.key
        {
            info.decryption_key = load_key(key, base, playlist.media_sequence, ctx).await?;
        }

        info.segments.push(resolve_url(base, &segment.uri)?.to_string());
        info.duration += f64::from(segment.duration);
    }

    Ok(info)
}

async fn load_key(
    key: &m3u8_rs::Key,
    base: &Url,
    media_sequence: u64,
    ctx: &ManifestContext,
) -> Result<Option<DecryptionKey>, DownloadError> {
    match &key.method {
        m3u8_rs::KeyMethod::None => Ok(None),
        m3u8_rs::KeyMethod::SampleAES => Ok(Some(DecryptionKey::stub(KeyMethod::SampleAes, None))),
        m3u8_rs::KeyMethod::AES128 => {
            let uri = key
                .uri
                .as_deref()
                .ok_or_else(|| DownloadError::manifest("AES-128 key without URI"))?;
            let key_url = resolve_url(base, uri)?;
            let bytes = ctx.fetch_bytes(key_url.as_str(), "key fetch").await?;
            if bytes.len() != 16 {
                return Err(DownloadError::Decryption {
                    reason: format!("key at {key_url} is {} bytes, expected 16", bytes.len()),
                });
            }
            let iv = match key.iv.as_deref() {
                Some(iv) => parse_iv(iv)?,
                None => vec![0u8; 16],
            };
            debug!(key_url = %key_url, media_sequence, "Loaded AES-128 key");
            Ok(Some(DecryptionKey::aes128(bytes.to_vec(), iv, media_sequence)))
        }
        m3u8_rs::KeyMethod::Other(method) => {
            warn!(method = %method, url = %base, "Unsupported key method; ignoring");
            Ok(None)
        }
    }
}

fn parse_iv(value: &str) -> Result<Vec<u8>, DownloadError> {
    let hex_part = value
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    let iv = hex::decode(hex_part)
        .map_err(|e| DownloadError::manifest(format!("invalid IV `{value}`: {e}")))?;
    if iv.len() != 16 {
        return Err(DownloadError::manifest(format!(
            "IV `{value}` is {} bytes, expected 16",
            iv.len()
        )));
    }
    Ok(iv)
}

/// Fetch a nested playlist; nested masters are refused.
async fn load_variant(url: &Url, ctx: &ManifestContext) -> Result<MediaInfo, DownloadError> {
    let bytes = ctx.fetch_bytes(url.as_str(), "variant playlist fetch").await?;
    match m3u8_rs::parse_playlist_res(&bytes) {
        Ok(Playlist::MediaPlaylist(playlist)) => load_media(&playlist, url, ctx).await,
        Ok(Playlist::MasterPlaylist(_)) => Err(DownloadError::manifest(format!(
            "nested master playlist at {url}"
        ))),
        Err(e) => Err(DownloadError::manifest(format!(
            "failed to parse playlist {url}: {e}"
        ))),
    }
}

/// Pick the rendition representing an audio group: `DEFAULT=YES` with a URI,
/// else the first one with a URI.
fn group_rendition<'a>(
    alternatives: &'a [AlternativeMedia],
    group_id: &str,
) -> Option<&'a AlternativeMedia> {
    let mut with_uri = alternatives.iter().filter(|a| {
        a.media_type == AlternativeMediaType::Audio && a.group_id == group_id && a.uri.is_some()
    });
    let first = with_uri.clone().next();
    with_uri.find(|a| a.default).or(first)
}

fn variant_format(variant: &VariantStream, id: String, has_audio_group: bool) -> MediaFormat {
    let (video, audio) = variant
        .codecs
        .as_deref()
        .map(classify_codecs)
        .unwrap_or((None, None));
    let (width, height) = variant
        .resolution
        .as_ref()
        .map(|r| {
            (
                u32::try_from(r.width).unwrap_or(0),
                u32::try_from(r.height).unwrap_or(0),
            )
        })
        .unwrap_or((0, 0));

    let media_type = if video.is_none() && width == 0 && audio.is_some() && !has_audio_group {
        MediaType::Audio
    } else {
        MediaType::Video
    };

    MediaFormat::new(id, media_type)
        .with_codecs(video, if has_audio_group { None } else { audio })
        .with_resolution(width, height)
        .with_bitrate(variant.bandwidth)
}

async fn expand_master(
    playlist: MasterPlaylist,
    base: &Url,
    ctx: &ManifestContext,
) -> Result<Vec<MediaFormat>, DownloadError> {
    let variants: Vec<&VariantStream> = playlist.variants.iter().filter(|v| !v.is_i_frame).collect();

    // Audio groups that are backed by a separate rendition playlist.
    let mut groups: Vec<(&str, &AlternativeMedia)> = Vec::new();
    let mut seen = HashSet::new();
    for alternative in &playlist.alternatives {
        if alternative.media_type != AlternativeMediaType::Audio
            || !seen.insert(alternative.group_id.as_str())
        {
            continue;
        }
        if let Some(rendition) = group_rendition(&playlist.alternatives, &alternative.group_id) {
            groups.push((alternative.group_id.as_str(), rendition));
        }
    }

    let mut jobs: Vec<(MediaFormat, Result<Url, DownloadError>)> = Vec::new();
    let mut ids = HashSet::new();

    for (index, variant) in variants.iter().enumerate() {
        let kbps = variant.bandwidth / 1000;
        let mut id = format!("hls-{kbps}");
        if !ids.insert(id.clone()) {
            id = format!("hls-{kbps}-{index}");
            ids.insert(id.clone());
        }
        let has_audio_group = variant
            .audio
            .as_deref()
            .is_some_and(|group| groups.iter().any(|(g, _)| *g == group));
        let format = variant_format(variant, id, has_audio_group);
        jobs.push((format, resolve_url(base, &variant.uri)));
    }

    for (group_id, rendition) in &groups {
        let audio_codec = variants
            .iter()
            .filter(|v| v.audio.as_deref() == Some(*group_id))
            .find_map(|v| v.codecs.as_deref().and_then(|c| classify_codecs(c).1));
        let mut format = MediaFormat::new(format!("hls-audio-{group_id}"), MediaType::Audio)
            .with_codecs(None, audio_codec);
        format.title = Some(rendition.name.clone()).filter(|name| !name.is_empty());
        let url = rendition
            .uri
            .as_deref()
            .ok_or_else(|| DownloadError::manifest("audio rendition without URI"))
            .and_then(|uri| resolve_url(base, uri));
        jobs.push((format, url));
    }

    if jobs.is_empty() {
        return Err(DownloadError::PartialManifest {
            failures: 0,
            reason: format!("master playlist {base} has no usable variants"),
        });
    }

    let concurrency = ctx.config.concurrency.max(1);
    let results: Vec<Result<MediaFormat, DownloadError>> = futures::stream::iter(jobs)
        .map(|(mut format, url)| async move {
            let loaded = match url {
                Ok(url) => load_variant(&url, ctx).await.map_err(|e| (url.to_string(), e)),
                Err(e) => Err((format.format_id.clone(), e)),
            };
            match loaded {
                Ok(info) => info.apply_to(&mut format),
                Err((_, DownloadError::Cancelled)) => return Err(DownloadError::Cancelled),
                Err((target, err)) => {
                    warn!(
                        format_id = %format.format_id,
                        target = %target,
                        error = %err,
                        "Nested playlist failed; keeping format without segments"
                    );
                    format.segment_errors += 1;
                }
            }
            Ok(format)
        })
        .buffered(concurrency)
        .collect()
        .await;

    let formats: Vec<MediaFormat> = results.into_iter().collect::<Result<_, _>>()?;
    if !formats.iter().any(|f| !f.segments.is_empty()) {
        let failures = formats.iter().filter(|f| f.segment_errors > 0).count();
        return Err(DownloadError::PartialManifest {
            failures,
            reason: format!("no variant of {base} yielded any segments"),
        });
    }
    Ok(formats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DownloadConfig;
    use crate::http::{HttpResponse, MockHttpClient};
    use media_types::{AudioCodec, VideoCodec};
    use reqwest::StatusCode;
    use reqwest::header::HeaderMap;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    const MASTER: &str = "#EXTM3U
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud\",NAME=\"English\",DEFAULT=YES,URI=\"audio/index.m3u8\"
#EXT-X-STREAM-INF:BANDWIDTH=2000000,RESOLUTION=1280x720,CODECS=\"avc1.64001f,mp4a.40.2\",AUDIO=\"aud\"
v720/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360,CODECS=\"avc1.4d401e,mp4a.40.2\",AUDIO=\"aud\"
v360/index.m3u8
";

    const MEDIA: &str = "#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:4
#EXT-X-MEDIA-SEQUENCE:0
#EXTINF:4.0,
seg0.ts
#EXTINF:4.0,
seg1.ts
#EXT-X-ENDLIST
";

    fn serve(routes: Vec<(&'static str, Vec<u8>)>) -> ManifestContext {
        let routes: HashMap<String, Vec<u8>> =
            routes.into_iter().map(|(u, b)| (u.to_string(), b)).collect();
        let mut client = MockHttpClient::new();
        client.expect_execute().returning(move |request| {
            let (status, body) = match routes.get(&request.url) {
                Some(body) => (StatusCode::OK, body.clone()),
                None => (StatusCode::NOT_FOUND, Vec::new()),
            };
            Ok(HttpResponse::from_bytes(status, HeaderMap::new(), body))
        });
        let config = DownloadConfig::builder().retry_attempts(0).build();
        ManifestContext::new(Arc::new(client), config, CancellationToken::new())
    }

    fn base() -> Url {
        Url::parse("https://cdn.example.com/live/master.m3u8").unwrap()
    }

    #[tokio::test]
    async fn master_with_audio_group_expands_all_renditions() {
        let ctx = serve(vec![
            ("https://cdn.example.com/live/v720/index.m3u8", MEDIA.into()),
            ("https://cdn.example.com/live/v360/index.m3u8", MEDIA.into()),
            ("https://cdn.example.com/live/audio/index.m3u8", MEDIA.into()),
        ]);

        let formats = parse(MASTER.as_bytes(), &base(), &ctx).await.unwrap();
        assert_eq!(formats.len(), 3);

        let videos: Vec<_> = formats.iter().filter(|f| f.media_type == MediaType::Video).collect();
        assert_eq!(videos.len(), 2);
        assert_eq!(videos[0].format_id, "hls-2000");
        assert_eq!(videos[0].video_codec, Some(VideoCodec::Avc));
        assert_eq!(videos[0].audio_codec, None);
        assert_eq!((videos[0].width, videos[0].height), (1280, 720));
        assert_eq!(videos[1].bitrate, 800_000);
        assert!(videos.iter().all(|f| f.segments.len() == 2));

        let audio = &formats[2];
        assert_eq!(audio.media_type, MediaType::Audio);
        assert_eq!(audio.audio_codec, Some(AudioCodec::Aac));
        assert_eq!(
            audio.segments[0],
            "https://cdn.example.com/live/audio/seg0.ts"
        );
        assert_eq!(audio.duration, 8.0);
    }

    #[tokio::test]
    async fn failed_variant_degrades_to_no_segments() {
        let ctx = serve(vec![
            ("https://cdn.example.com/live/v720/index.m3u8", MEDIA.into()),
            ("https://cdn.example.com/live/audio/index.m3u8", MEDIA.into()),
            ("https://cdn.example.com/live/v360/index.m3u8", MASTER.into()),
        ]);

        let formats = parse(MASTER.as_bytes(), &base(), &ctx).await.unwrap();
        assert_eq!(formats.len(), 3);
        assert_eq!(formats[0].segments.len(), 2);
        assert_eq!(formats[0].segment_errors, 0);
        assert!(formats[1].segments.is_empty());
        assert_eq!(formats[1].segment_errors, 1);
    }

    #[tokio::test]
    async fn master_without_any_usable_variant_fails() {
        let master = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=2000000,RESOLUTION=1280x720,CODECS=\"avc1.64001f,mp4a.40.2\"
v720/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360,CODECS=\"avc1.4d401e,mp4a.40.2\"
v360/index.m3u8
";
        let ctx = serve(Vec::new());

        let err = parse(master.as_bytes(), &base(), &ctx).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::PartialManifest);
        assert!(matches!(err, DownloadError::PartialManifest { failures: 2, .. }));
    }

    #[tokio::test]
    async fn aes_key_is_fetched_with_iv() {
        let playlist = "#EXTM3U
#EXT-X-TARGETDURATION:4
#EXT-X-MEDIA-SEQUENCE:7
#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\",IV=0x000102030405060708090a0b0c0d0e0f
#EXTINF:4.0,
seg7.ts
#EXT-X-ENDLIST
";
        let ctx = serve(vec![("https://cdn.example.com/live/key.bin", vec![0x11; 16])]);
        let url = Url::parse("https://cdn.example.com/live/index.m3u8").unwrap();

        let formats = parse(playlist.as_bytes(), &url, &ctx).await.unwrap();
        let key = formats[0].decryption_key.as_ref().unwrap();
        assert_eq!(key.method, KeyMethod::Aes128);
        assert_eq!(key.key, vec![0x11; 16]);
        assert_eq!(key.iv, (0u8..16).collect::<Vec<_>>());
        assert_eq!(key.media_sequence, 7);
    }

    #[tokio::test]
    async fn byte_range_truncates_segment_list() {
        let playlist = "#EXTM3U
#EXT-X-TARGETDURATION:4
#EXTINF:4.0,
a.ts
#EXTINF:4.0,
#EXT-X-BYTERANGE:1000@0
b.ts
#EXTINF:4.0,
c.ts
#EXT-X-ENDLIST
";
        let ctx = serve(Vec::new());
        let url = Url::parse("https://cdn.example.com/live/index.m3u8").unwrap();

        let formats = parse(playlist.as_bytes(), &url, &ctx).await.unwrap();
        assert_eq!(formats[0].segments, vec!["https://cdn.example.com/live/a.ts"]);
    }

    #[test]
    fn iv_parsing() {
        assert_eq!(parse_iv("0X00000000000000000000000000000001").unwrap()[15], 1);
        assert!(parse_iv("0x0102").is_err());
    }
}
