use serde::{Deserialize, Serialize};

use crate::MediaType;

/// Video codecs the engine knows how to rank.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    Avc,
    Hevc,
    Av1,
    Vp9,
    Vp8,
}

/// Audio codecs the engine knows how to rank.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Aac,
    Opus,
    Mp3,
    Flac,
    Vorbis,
}

const VIDEO_TOKENS: &[(&str, VideoCodec)] = &[
    ("avc", VideoCodec::Avc),
    ("h264", VideoCodec::Avc),
    ("hvc", VideoCodec::Hevc),
    ("hev", VideoCodec::Hevc),
    ("h265", VideoCodec::Hevc),
    ("av01", VideoCodec::Av1),
    ("vp09", VideoCodec::Vp9),
    ("vp9", VideoCodec::Vp9),
    ("vp8", VideoCodec::Vp8),
];

const AUDIO_TOKENS: &[(&str, AudioCodec)] = &[
    ("mp4a", AudioCodec::Aac),
    ("opus", AudioCodec::Opus),
    ("mp3", AudioCodec::Mp3),
    ("flac", AudioCodec::Flac),
    ("vorbis", AudioCodec::Vorbis),
];

impl VideoCodec {
    /// Match a single codec token (e.g. `avc1.64001f`).
    pub fn from_token(token: &str) -> Option<Self> {
        let token = token.trim().to_ascii_lowercase();
        VIDEO_TOKENS
            .iter()
            .find(|(needle, _)| token.contains(needle))
            .map(|(_, codec)| *codec)
    }

    /// Ranking priority, lower is preferred.
    pub fn priority(self) -> u8 {
        match self {
            VideoCodec::Avc => 0,
            VideoCodec::Hevc => 1,
            VideoCodec::Av1 => 2,
            VideoCodec::Vp9 => 3,
            VideoCodec::Vp8 => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::Avc => "avc",
            VideoCodec::Hevc => "hevc",
            VideoCodec::Av1 => "av1",
            VideoCodec::Vp9 => "vp9",
            VideoCodec::Vp8 => "vp8",
        }
    }
}

impl AudioCodec {
    pub fn from_token(token: &str) -> Option<Self> {
        let token = token.trim().to_ascii_lowercase();
        AUDIO_TOKENS
            .iter()
            .find(|(needle, _)| token.contains(needle))
            .map(|(_, codec)| *codec)
    }

    /// Ranking priority, lower is preferred.
    pub fn priority(self) -> u8 {
        match self {
            AudioCodec::Aac => 0,
            AudioCodec::Mp3 => 1,
            AudioCodec::Opus => 2,
            AudioCodec::Flac => 3,
            AudioCodec::Vorbis => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AudioCodec::Aac => "aac",
            AudioCodec::Opus => "opus",
            AudioCodec::Mp3 => "mp3",
            AudioCodec::Flac => "flac",
            AudioCodec::Vorbis => "vorbis",
        }
    }
}

/// Split a manifest `CODECS`/`codecs` value and classify each token.
///
/// The first recognised token of each kind wins; unknown tokens are ignored.
pub fn classify_codecs(codecs: &str) -> (Option<VideoCodec>, Option<AudioCodec>) {
    let mut video = None;
    let mut audio = None;
    for token in codecs.split(',') {
        if video.is_none()
            && let Some(codec) = VideoCodec::from_token(token)
        {
            video = Some(codec);
            continue;
        }
        if audio.is_none() {
            audio = AudioCodec::from_token(token);
        }
    }
    (video, audio)
}

/// Map a MIME type such as `video/mp4` to a media category.
pub fn media_type_from_mime(mime: &str) -> Option<MediaType> {
    let major = mime.split('/').next()?.trim().to_ascii_lowercase();
    match major.as_str() {
        "video" => Some(MediaType::Video),
        "audio" => Some(MediaType::Audio),
        "image" => Some(MediaType::Photo),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("avc1.64001f", Some(VideoCodec::Avc))]
    #[case("H264", Some(VideoCodec::Avc))]
    #[case("hvc1.1.6.L93.90", Some(VideoCodec::Hevc))]
    #[case("hev1.2.4.L120", Some(VideoCodec::Hevc))]
    #[case("av01.0.05M.08", Some(VideoCodec::Av1))]
    #[case("vp09.00.10.08", Some(VideoCodec::Vp9))]
    #[case("vp8", Some(VideoCodec::Vp8))]
    #[case("mp4a.40.2", None)]
    #[case("", None)]
    fn video_token_table(#[case] token: &str, #[case] expected: Option<VideoCodec>) {
        assert_eq!(VideoCodec::from_token(token), expected);
    }

    #[rstest]
    #[case("mp4a.40.2", Some(AudioCodec::Aac))]
    #[case("opus", Some(AudioCodec::Opus))]
    #[case("mp3", Some(AudioCodec::Mp3))]
    #[case("fLaC", Some(AudioCodec::Flac))]
    #[case("vorbis", Some(AudioCodec::Vorbis))]
    #[case("ac-3", None)]
    fn audio_token_table(#[case] token: &str, #[case] expected: Option<AudioCodec>) {
        assert_eq!(AudioCodec::from_token(token), expected);
    }

    #[test]
    fn classify_combined_codecs_attribute() {
        assert_eq!(
            classify_codecs("avc1.4d401f,mp4a.40.2"),
            (Some(VideoCodec::Avc), Some(AudioCodec::Aac))
        );
        assert_eq!(classify_codecs("mp4a.40.5"), (None, Some(AudioCodec::Aac)));
        assert_eq!(classify_codecs("stpp.ttml.im1t"), (None, None));
    }

    #[test]
    fn mime_classification() {
        assert_eq!(media_type_from_mime("video/mp4"), Some(MediaType::Video));
        assert_eq!(media_type_from_mime("Audio/MP4"), Some(MediaType::Audio));
        assert_eq!(media_type_from_mime("image/jpeg"), Some(MediaType::Photo));
        assert_eq!(media_type_from_mime("text/vtt"), None);
    }
}
