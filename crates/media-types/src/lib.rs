//! Shared media domain types.
//!
//! Everything a manifest parser or a source collaborator produces, and
//! everything the download engine consumes read-only, lives here: media
//! categories, the closed codec sets and their classifier, and the
//! [`MediaFormat`] / [`MediaItem`] records.

mod codec;
mod format;
mod item;

pub use codec::{AudioCodec, VideoCodec, classify_codecs, media_type_from_mime};
pub use format::{DecryptionKey, KeyMethod, MediaFormat, MediaType};
pub use item::MediaItem;

/// Video resolution information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    #[inline]
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_display() {
        let r = Resolution::new(1920, 1080);
        assert_eq!(r.to_string(), "1920x1080");
    }
}
