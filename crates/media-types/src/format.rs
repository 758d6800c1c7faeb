use serde::{Deserialize, Serialize};

use crate::{AudioCodec, Resolution, VideoCodec};

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Video,
    Audio,
    Photo,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Video => "video",
            MediaType::Audio => "audio",
            MediaType::Photo => "photo",
        }
    }

    /// Sort priority used by the ranked format list (video < audio < photo).
    pub fn priority(self) -> u8 {
        match self {
            MediaType::Video => 0,
            MediaType::Audio => 1,
            MediaType::Photo => 2,
        }
    }
}

/// Encryption scheme carried by a format.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMethod {
    /// Whole-segment AES-128-CBC (HLS `METHOD=AES-128`).
    Aes128,
    /// HLS `SAMPLE-AES`; recorded but not decrypted by the engine.
    SampleAes,
    /// DASH common encryption, key material supplied out of band.
    Cenc,
    /// DASH ClearKey.
    ClearKey,
}

impl KeyMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyMethod::Aes128 => "AES-128",
            KeyMethod::SampleAes => "SAMPLE-AES",
            KeyMethod::Cenc => "cenc",
            KeyMethod::ClearKey => "clearkey",
        }
    }
}

/// Key material for a protected format.
///
/// For DASH content protection only `method` and `key_id` are known at parse
/// time; `key` and `iv` stay empty until the caller supplies them.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct DecryptionKey {
    pub method: KeyMethod,
    #[serde(with = "hex_bytes")]
    pub key: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub iv: Vec<u8>,
    pub key_id: Option<String>,
    /// Media sequence number of the first media segment.
    pub media_sequence: u64,
}

impl DecryptionKey {
    pub fn aes128(key: Vec<u8>, iv: Vec<u8>, media_sequence: u64) -> Self {
        Self {
            method: KeyMethod::Aes128,
            key,
            iv,
            key_id: None,
            media_sequence,
        }
    }

    pub fn stub(method: KeyMethod, key_id: Option<String>) -> Self {
        Self {
            method,
            key: Vec::new(),
            iv: Vec::new(),
            key_id,
            media_sequence: 0,
        }
    }
}

/// One concrete encoding of a media item.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct MediaFormat {
    pub format_id: String,
    pub media_type: MediaType,
    pub video_codec: Option<VideoCodec>,
    pub audio_codec: Option<AudioCodec>,
    pub width: u32,
    pub height: u32,
    /// Bits per second.
    pub bitrate: u64,
    /// Seconds.
    pub duration: f64,
    /// Mirror list, tried in order.
    pub urls: Vec<String>,
    /// Media segments; empty means the format is a single direct resource.
    pub segments: Vec<String>,
    pub init_segment: Option<String>,
    pub decryption_key: Option<DecryptionKey>,
    pub thumbnail_urls: Vec<String>,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub is_default: bool,
    /// Set by the resolver when a separate audio track must be muxed in.
    pub merge_audio: bool,
    /// Nested manifest failures recorded while this format was built.
    pub segment_errors: usize,
}

impl MediaFormat {
    pub fn new(format_id: impl Into<String>, media_type: MediaType) -> Self {
        Self {
            format_id: format_id.into(),
            media_type,
            video_codec: None,
            audio_codec: None,
            width: 0,
            height: 0,
            bitrate: 0,
            duration: 0.0,
            urls: Vec::new(),
            segments: Vec::new(),
            init_segment: None,
            decryption_key: None,
            thumbnail_urls: Vec::new(),
            title: None,
            artist: None,
            is_default: false,
            merge_audio: false,
            segment_errors: 0,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.urls.push(url.into());
        self
    }

    pub fn with_codecs(mut self, video: Option<VideoCodec>, audio: Option<AudioCodec>) -> Self {
        self.video_codec = video;
        self.audio_codec = audio;
        self
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_bitrate(mut self, bitrate: u64) -> Self {
        self.bitrate = bitrate;
        self
    }

    /// Whether this format is fetched segment by segment.
    #[inline]
    pub fn is_segmented(&self) -> bool {
        !self.segments.is_empty()
    }

    /// An audio format carrying no video codec.
    #[inline]
    pub fn is_audio_only(&self) -> bool {
        self.video_codec.is_none() && self.media_type == MediaType::Audio
    }

    pub fn resolution(&self) -> Option<Resolution> {
        (self.width > 0 && self.height > 0).then(|| Resolution::new(self.width, self.height))
    }

    /// Init segment (when present) followed by the media segments.
    pub fn segment_urls(&self) -> Vec<String> {
        self.init_segment
            .iter()
            .chain(self.segments.iter())
            .cloned()
            .collect()
    }

    /// Container extension inferred from type and codecs.
    pub fn extension(&self) -> &'static str {
        match self.media_type {
            MediaType::Photo => "jpg",
            MediaType::Audio => match self.audio_codec {
                Some(AudioCodec::Mp3) => "mp3",
                Some(AudioCodec::Opus) => "opus",
                Some(AudioCodec::Flac) => "flac",
                Some(AudioCodec::Vorbis) => "ogg",
                Some(AudioCodec::Aac) | None => "m4a",
            },
            MediaType::Video => {
                let webm_video = matches!(self.video_codec, Some(VideoCodec::Vp8 | VideoCodec::Vp9));
                let webm_audio = matches!(
                    self.audio_codec,
                    None | Some(AudioCodec::Opus | AudioCodec::Vorbis)
                );
                if webm_video && webm_audio { "webm" } else { "mp4" }
            }
        }
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_urls_prepend_init() {
        let mut format = MediaFormat::new("v1", MediaType::Video);
        format.segments = vec!["a.m4s".into(), "b.m4s".into()];
        format.init_segment = Some("init.mp4".into());
        assert!(format.is_segmented());
        assert_eq!(format.segment_urls(), vec!["init.mp4", "a.m4s", "b.m4s"]);
    }

    #[test]
    fn extension_follows_codecs() {
        let mp4 = MediaFormat::new("v", MediaType::Video)
            .with_codecs(Some(VideoCodec::Avc), Some(AudioCodec::Aac));
        assert_eq!(mp4.extension(), "mp4");

        let webm = MediaFormat::new("v", MediaType::Video)
            .with_codecs(Some(VideoCodec::Vp9), Some(AudioCodec::Opus));
        assert_eq!(webm.extension(), "webm");

        let vp9_aac = MediaFormat::new("v", MediaType::Video)
            .with_codecs(Some(VideoCodec::Vp9), Some(AudioCodec::Aac));
        assert_eq!(vp9_aac.extension(), "mp4");

        let mp3 = MediaFormat::new("a", MediaType::Audio).with_codecs(None, Some(AudioCodec::Mp3));
        assert_eq!(mp3.extension(), "mp3");
    }

    #[test]
    fn decryption_key_serializes_as_hex() {
        let key = DecryptionKey::aes128(vec![0xab; 16], vec![0; 16], 7);
        let json = serde_json::to_value(&key).unwrap();
        assert_eq!(json["key"], "ab".repeat(16));
        let back: DecryptionKey = serde_json::from_value(json).unwrap();
        assert_eq!(back, key);
    }
}
