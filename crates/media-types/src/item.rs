use serde::{Deserialize, Serialize};

use crate::{MediaFormat, MediaType};

/// One logical asset (a video, a track, a photo) and its known encodings.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct MediaItem {
    /// Stable content identifier, used to name output files.
    pub content_id: String,
    pub source_url: String,
    pub nsfw: bool,
    pub caption: Option<String>,
    pub formats: Vec<MediaFormat>,
}

impl MediaItem {
    pub fn new(content_id: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            content_id: content_id.into(),
            source_url: source_url.into(),
            nsfw: false,
            caption: None,
            formats: Vec::new(),
        }
    }

    pub fn push_format(&mut self, format: MediaFormat) {
        self.formats.push(format);
    }

    pub fn extend_formats(&mut self, formats: impl IntoIterator<Item = MediaFormat>) {
        self.formats.extend(formats);
    }

    pub fn format(&self, format_id: &str) -> Option<&MediaFormat> {
        self.formats.iter().find(|f| f.format_id == format_id)
    }

    /// The format flagged as default for `media_type`, if any.
    pub fn default_of(&self, media_type: MediaType) -> Option<&MediaFormat> {
        self.formats
            .iter()
            .find(|f| f.is_default && f.media_type == media_type)
    }
}
