//! Default format selection and the ranked format list.

use std::cmp::Ordering;
use std::collections::HashMap;

use media_types::{AudioCodec, MediaFormat, MediaItem, MediaType, VideoCodec};
use tracing::debug;

/// Codec priority used when a format has no codec of that kind.
const NO_CODEC_PRIORITY: u8 = 5;

fn video_priority(format: &MediaFormat) -> u8 {
    format
        .video_codec
        .map_or(NO_CODEC_PRIORITY, |c| c.priority())
}

fn audio_priority(format: &MediaFormat) -> u8 {
    format
        .audio_codec
        .map_or(NO_CODEC_PRIORITY, |c| c.priority())
}

fn codec_priority(format: &MediaFormat) -> u8 {
    match format.media_type {
        MediaType::Video => video_priority(format),
        MediaType::Audio => audio_priority(format),
        MediaType::Photo => NO_CODEC_PRIORITY,
    }
}

/// Higher bitrate first, then taller; ties keep manifest order.
fn compare_video(a: &MediaFormat, b: &MediaFormat) -> Ordering {
    b.bitrate
        .cmp(&a.bitrate)
        .then_with(|| b.height.cmp(&a.height))
}

fn best_video(formats: &[MediaFormat], filter: impl Fn(&MediaFormat) -> bool) -> Option<usize> {
    let mut candidates: Vec<usize> = (0..formats.len()).filter(|&i| filter(&formats[i])).collect();
    candidates.sort_by(|&a, &b| compare_video(&formats[a], &formats[b]));
    candidates.first().copied()
}

fn best_audio(formats: &[MediaFormat], filter: impl Fn(&MediaFormat) -> bool) -> Option<usize> {
    let mut candidates: Vec<usize> = (0..formats.len())
        .filter(|&i| formats[i].is_audio_only() && filter(&formats[i]))
        .collect();
    candidates.sort_by(|&a, &b| formats[b].bitrate.cmp(&formats[a].bitrate));
    candidates.first().copied()
}

fn default_video_index(formats: &[MediaFormat]) -> Option<usize> {
    best_video(formats, |f| f.video_codec == Some(VideoCodec::Avc))
        .or_else(|| best_video(formats, |f| f.video_codec.is_some()))
}

fn default_audio_index(formats: &[MediaFormat]) -> Option<usize> {
    best_audio(formats, |f| {
        matches!(f.audio_codec, Some(AudioCodec::Aac | AudioCodec::Mp3))
    })
    .or_else(|| best_audio(formats, |_| true))
}

fn default_photo_index(formats: &[MediaFormat]) -> Option<usize> {
    formats.iter().position(|f| f.media_type == MediaType::Photo)
}

/// Preferred video: AVC if any, else any format with a video codec;
/// highest bitrate, then highest resolution.
pub fn default_video(formats: &[MediaFormat]) -> Option<&MediaFormat> {
    default_video_index(formats).map(|i| &formats[i])
}

/// Preferred audio-only format: AAC or MP3 if any, else any; highest bitrate.
pub fn default_audio(formats: &[MediaFormat]) -> Option<&MediaFormat> {
    default_audio_index(formats).map(|i| &formats[i])
}

pub fn default_photo(formats: &[MediaFormat]) -> Option<&MediaFormat> {
    default_photo_index(formats).map(|i| &formats[i])
}

/// Mark the default of each category on `item` and return the primary
/// format (video, else audio, else photo).
///
/// A default video without its own audio is flagged `merge_audio` and
/// inherits the default audio's codec.
pub fn resolve_default(item: &mut MediaItem) -> Option<MediaFormat> {
    let video = default_video_index(&item.formats);
    let audio = default_audio_index(&item.formats);
    let photo = default_photo_index(&item.formats);

    for format in &mut item.formats {
        format.is_default = false;
        format.merge_audio = false;
    }
    for index in [video, audio, photo].into_iter().flatten() {
        item.formats[index].is_default = true;
    }

    if let (Some(v), Some(a)) = (video, audio)
        && item.formats[v].audio_codec.is_none()
    {
        debug!(
            video = %item.formats[v].format_id,
            audio = %item.formats[a].format_id,
            "Default video needs a separate audio track"
        );
        let codec = item.formats[a].audio_codec;
        let format = &mut item.formats[v];
        format.merge_audio = true;
        format.audio_codec = codec;
    }

    video.or(audio).or(photo).map(|i| item.formats[i].clone())
}

/// Deduplicated list in presentation order.
///
/// Videos sharing (codec, width, height) keep the highest bitrate; audio
/// formats sharing (codec, bitrate) keep the first seen.
pub fn ranked_formats(formats: &[MediaFormat]) -> Vec<MediaFormat> {
    let mut videos: Vec<MediaFormat> = Vec::new();
    let mut video_slots: HashMap<(u8, u32, u32), usize> = HashMap::new();
    let mut audios: Vec<MediaFormat> = Vec::new();
    let mut audio_slots: HashMap<(u8, u64), usize> = HashMap::new();
    let mut others: Vec<MediaFormat> = Vec::new();

    for format in formats {
        match format.media_type {
            MediaType::Video => {
                let key = (video_priority(format), format.width, format.height);
                match video_slots.get(&key) {
                    Some(&slot) if videos[slot].bitrate >= format.bitrate => {}
                    Some(&slot) => videos[slot] = format.clone(),
                    None => {
                        video_slots.insert(key, videos.len());
                        videos.push(format.clone());
                    }
                }
            }
            MediaType::Audio => {
                let key = (audio_priority(format), format.bitrate);
                if let std::collections::hash_map::Entry::Vacant(entry) = audio_slots.entry(key) {
                    entry.insert(audios.len());
                    audios.push(format.clone());
                }
            }
            MediaType::Photo => others.push(format.clone()),
        }
    }

    let mut ranked: Vec<MediaFormat> = videos.into_iter().chain(audios).chain(others).collect();
    ranked.sort_by_key(|f| {
        (
            f.media_type.priority(),
            codec_priority(f),
            f.width,
            f.height,
            f.bitrate,
        )
    });
    ranked
}
