use std::fmt::Write as _;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use mediagrab_engine::{MediaFormat, MediaItem};
use serde::Serialize;

use crate::error::Result;

/// Resolution of the progress bar (fraction × this).
pub const PROGRESS_SCALE: u64 = 1000;

#[derive(Serialize)]
struct ProbeReport<'a> {
    content_id: &'a str,
    source_url: &'a str,
    formats: &'a [MediaFormat],
}

fn codecs(format: &MediaFormat) -> String {
    match (format.video_codec, format.audio_codec) {
        (Some(v), Some(a)) => format!("{}+{}", v.as_str(), a.as_str()),
        (Some(v), None) => v.as_str().to_string(),
        (None, Some(a)) => a.as_str().to_string(),
        (None, None) => "-".to_string(),
    }
}

/// One line per format; the resolved defaults are starred.
pub fn format_table(formats: &[MediaFormat]) -> String {
    let mut output = String::new();
    let _ = writeln!(
        output,
        "  {:<20} {:<6} {:<10} {:<10} {:>9} {:>8}",
        "ID", "TYPE", "CODECS", "RES", "KBPS", "SEGMENTS"
    );
    for format in formats {
        let marker = if format.is_default { '*' } else { ' ' };
        let resolution = format
            .resolution()
            .map(|r| r.to_string())
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            output,
            "{marker} {:<20} {:<6} {:<10} {:<10} {:>9} {:>8}",
            format.format_id,
            format.media_type.as_str(),
            codecs(format),
            resolution,
            format.bitrate / 1000,
            format.segments.len()
        );
    }
    output
}

pub fn format_json(item: &MediaItem, ranked: &[MediaFormat]) -> Result<String> {
    let report = ProbeReport {
        content_id: &item.content_id,
        source_url: &item.source_url,
        formats: ranked,
    };
    Ok(serde_json::to_string_pretty(&report)?)
}

/// Download bar fed by the engine's progress callback.
pub fn progress_bar(hidden: bool) -> ProgressBar {
    if hidden {
        return ProgressBar::with_draw_target(Some(PROGRESS_SCALE), ProgressDrawTarget::hidden());
    }
    let style = ProgressStyle::default_bar()
        .template("{spinner:.yellow} [{bar:30.yellow/white}] {percent:>3}% {elapsed_precise} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    ProgressBar::new(PROGRESS_SCALE).with_style(style)
}
