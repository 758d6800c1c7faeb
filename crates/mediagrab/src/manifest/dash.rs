//! DASH MPDs via `quick-xml` serde.
//!
//! Only the first `Period` is read. Each `Representation` becomes one format;
//! representations that cannot be turned into URLs are skipped and counted.

use media_types::{
    DecryptionKey, KeyMethod, MediaFormat, MediaType, classify_codecs, media_type_from_mime,
};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use super::duration::parse_iso8601_duration;
use super::resolve_url;
use super::template::{TemplateVars, expand_template};
use crate::error::DownloadError;

const MP4_PROTECTION_SCHEME: &str = "urn:mpeg:dash:mp4protection:2011";
const CLEARKEY_SYSTEM_ID: &str = "e2719d58-a985-b3c9-781a-b030af78d30e";

/// Segment duration assumed when a template declares none.
const DEFAULT_SEGMENT_SECONDS: f64 = 10.0;

/// Upper bound on expanded segments per representation.
const MAX_SEGMENTS: usize = 200_000;

#[derive(Debug, Deserialize)]
struct Mpd {
    #[serde(rename = "@mediaPresentationDuration")]
    media_presentation_duration: Option<String>,
    #[serde(rename = "BaseURL", default)]
    base_urls: Vec<BaseUrl>,
    #[serde(rename = "Period", default)]
    periods: Vec<Period>,
}

#[derive(Debug, Deserialize)]
struct BaseUrl {
    #[serde(rename = "$text", default)]
    url: String,
}

#[derive(Debug, Deserialize)]
struct Period {
    #[serde(rename = "@duration")]
    duration: Option<String>,
    #[serde(rename = "BaseURL", default)]
    base_urls: Vec<BaseUrl>,
    #[serde(rename = "AdaptationSet", default)]
    adaptation_sets: Vec<AdaptationSet>,
}

#[derive(Debug, Deserialize)]
struct AdaptationSet {
    #[serde(rename = "@mimeType")]
    mime_type: Option<String>,
    #[serde(rename = "@contentType")]
    content_type: Option<String>,
    #[serde(rename = "@codecs")]
    codecs: Option<String>,
    #[serde(rename = "@width")]
    width: Option<u32>,
    #[serde(rename = "@height")]
    height: Option<u32>,
    #[serde(rename = "BaseURL", default)]
    base_urls: Vec<BaseUrl>,
    #[serde(rename = "SegmentTemplate")]
    segment_template: Option<SegmentTemplate>,
    #[serde(rename = "SegmentList")]
    segment_list: Option<SegmentList>,
    #[serde(rename = "ContentProtection", default)]
    content_protection: Vec<ContentProtection>,
    #[serde(rename = "Representation", default)]
    representations: Vec<Representation>,
}

#[derive(Debug, Deserialize)]
struct Representation {
    #[serde(rename = "@id")]
    id: Option<String>,
    #[serde(rename = "@bandwidth")]
    bandwidth: Option<u64>,
    #[serde(rename = "@width")]
    width: Option<u32>,
    #[serde(rename = "@height")]
    height: Option<u32>,
    #[serde(rename = "@codecs")]
    codecs: Option<String>,
    #[serde(rename = "@mimeType")]
    mime_type: Option<String>,
    #[serde(rename = "BaseURL", default)]
    base_urls: Vec<BaseUrl>,
    #[serde(rename = "SegmentTemplate")]
    segment_template: Option<SegmentTemplate>,
    #[serde(rename = "SegmentList")]
    segment_list: Option<SegmentList>,
    #[serde(rename = "ContentProtection", default)]
    content_protection: Vec<ContentProtection>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SegmentTemplate {
    #[serde(rename = "@media")]
    media: Option<String>,
    #[serde(rename = "@initialization")]
    initialization: Option<String>,
    #[serde(rename = "@startNumber")]
    start_number: Option<u64>,
    #[serde(rename = "@duration")]
    duration: Option<u64>,
    #[serde(rename = "@timescale")]
    timescale: Option<u64>,
    #[serde(rename = "SegmentTimeline")]
    timeline: Option<SegmentTimeline>,
}

impl SegmentTemplate {
    /// Representation-level attributes win over the adaptation set defaults.
    fn merge(rep: Option<&Self>, set: Option<&Self>) -> Option<Self> {
        match (rep, set) {
            (None, None) => None,
            (Some(t), None) | (None, Some(t)) => Some(t.clone()),
            (Some(r), Some(s)) => Some(Self {
                media: r.media.clone().or_else(|| s.media.clone()),
                initialization: r.initialization.clone().or_else(|| s.initialization.clone()),
                start_number: r.start_number.or(s.start_number),
                duration: r.duration.or(s.duration),
                timescale: r.timescale.or(s.timescale),
                timeline: r.timeline.clone().or_else(|| s.timeline.clone()),
            }),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SegmentTimeline {
    #[serde(rename = "S", default)]
    entries: Vec<TimelineEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct TimelineEntry {
    #[serde(rename = "@t")]
    t: Option<u64>,
    #[serde(rename = "@d")]
    d: u64,
    #[serde(rename = "@r")]
    r: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct SegmentList {
    #[serde(rename = "Initialization")]
    initialization: Option<Initialization>,
    #[serde(rename = "SegmentURL", default)]
    segment_urls: Vec<SegmentUrl>,
}

#[derive(Debug, Clone, Deserialize)]
struct Initialization {
    #[serde(rename = "@sourceURL")]
    source_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SegmentUrl {
    #[serde(rename = "@media")]
    media: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ContentProtection {
    #[serde(rename = "@schemeIdUri", default)]
    scheme_id_uri: String,
    #[serde(rename = "@value")]
    value: Option<String>,
    #[serde(rename = "@default_KID", alias = "@cenc:default_KID")]
    default_kid: Option<String>,
}

pub(crate) fn parse(bytes: &[u8], url: &Url) -> Result<Vec<MediaFormat>, DownloadError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| DownloadError::manifest(format!("MPD at {url} is not UTF-8: {e}")))?;
    let mpd: Mpd = quick_xml::de::from_str(text.trim_start_matches('\u{feff}'))
        .map_err(|e| DownloadError::manifest(format!("failed to parse MPD {url}: {e}")))?;

    let period = mpd
        .periods
        .first()
        .ok_or_else(|| DownloadError::manifest(format!("MPD {url} has no Period")))?;
    if mpd.periods.len() > 1 {
        debug!(periods = mpd.periods.len(), "Only the first period is processed");
    }

    let total = period
        .duration
        .as_deref()
        .and_then(parse_iso8601_duration)
        .or_else(|| {
            mpd.media_presentation_duration
                .as_deref()
                .and_then(parse_iso8601_duration)
        });

    let explicit_base = !mpd.base_urls.is_empty() || !period.base_urls.is_empty();
    let period_base = chain_base(&chain_base(url, &mpd.base_urls)?, &period.base_urls)?;

    let mut formats = Vec::new();
    let mut failures = 0usize;
    let mut last_error = None;

    for (set_index, set) in period.adaptation_sets.iter().enumerate() {
        if is_text(set.mime_type.as_deref()) || is_text(set.content_type.as_deref()) {
            continue;
        }
        let set_base = match chain_base(&period_base, &set.base_urls) {
            Ok(base) => base,
            Err(e) => {
                warn!(adaptation_set = set_index, error = %e, "Skipping adaptation set");
                failures += set.representations.len().max(1);
                last_error = Some(e);
                continue;
            }
        };

        for (rep_index, rep) in set.representations.iter().enumerate() {
            let context = RepresentationContext {
                set,
                set_base: &set_base,
                explicit_base: explicit_base || !set.base_urls.is_empty(),
                total,
                fallback_id: format!("dash-{set_index}-{rep_index}"),
            };
            match build_format(rep, &context) {
                Ok(Some(format)) => formats.push(format),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        representation = %context.fallback_id,
                        id = rep.id.as_deref().unwrap_or(""),
                        error = %e,
                        "Skipping representation"
                    );
                    failures += 1;
                    last_error = Some(e);
                }
            }
        }
    }

    if formats.is_empty() {
        return Err(DownloadError::PartialManifest {
            failures,
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| format!("MPD {url} has no usable representation")),
        });
    }
    Ok(formats)
}

struct RepresentationContext<'a> {
    set: &'a AdaptationSet,
    set_base: &'a Url,
    explicit_base: bool,
    total: Option<f64>,
    fallback_id: String,
}

fn is_text(value: Option<&str>) -> bool {
    value.is_some_and(|v| v == "text" || v.starts_with("text/"))
}

fn chain_base(base: &Url, urls: &[BaseUrl]) -> Result<Url, DownloadError> {
    match urls.iter().map(|b| b.url.trim()).find(|u| !u.is_empty()) {
        Some(reference) => resolve_url(base, reference),
        None => Ok(base.clone()),
    }
}

fn classify_media_type(
    mime: Option<&str>,
    content_type: Option<&str>,
    codecs: (Option<media_types::VideoCodec>, Option<media_types::AudioCodec>),
) -> Option<MediaType> {
    mime.and_then(media_type_from_mime)
        .or_else(|| match content_type {
            Some("video") => Some(MediaType::Video),
            Some("audio") => Some(MediaType::Audio),
            Some("image") => Some(MediaType::Photo),
            _ => None,
        })
        .or_else(|| match codecs {
            (Some(_), _) => Some(MediaType::Video),
            (None, Some(_)) => Some(MediaType::Audio),
            (None, None) => None,
        })
}

fn protection(list: &[ContentProtection]) -> Option<DecryptionKey> {
    let key_id = list.iter().find_map(|cp| cp.default_kid.clone());
    let clearkey = list
        .iter()
        .any(|cp| cp.scheme_id_uri.to_ascii_lowercase().contains(CLEARKEY_SYSTEM_ID));
    let cenc = list.iter().any(|cp| {
        cp.scheme_id_uri.eq_ignore_ascii_case(MP4_PROTECTION_SCHEME)
            || cp.value.as_deref() == Some("cenc")
    });

    if clearkey {
        Some(DecryptionKey::stub(KeyMethod::ClearKey, key_id))
    } else if cenc {
        Some(DecryptionKey::stub(KeyMethod::Cenc, key_id))
    } else {
        None
    }
}

fn build_format(
    rep: &Representation,
    ctx: &RepresentationContext<'_>,
) -> Result<Option<MediaFormat>, DownloadError> {
    let set = ctx.set;
    let mime = rep.mime_type.as_deref().or(set.mime_type.as_deref());
    if is_text(mime) {
        return Ok(None);
    }
    let codecs = rep.codecs.as_deref().or(set.codecs.as_deref()).unwrap_or("");
    let (video, audio) = classify_codecs(codecs);
    let Some(media_type) = classify_media_type(mime, set.content_type.as_deref(), (video, audio))
    else {
        debug!(representation = %ctx.fallback_id, "Representation has no recognisable media type");
        return Ok(None);
    };

    let id = rep.id.clone().unwrap_or_else(|| ctx.fallback_id.clone());
    let bandwidth = rep.bandwidth.unwrap_or(0);
    let base = chain_base(ctx.set_base, &rep.base_urls)?;

    let mut format = MediaFormat::new(id.clone(), media_type)
        .with_codecs(video, audio)
        .with_resolution(
            rep.width.or(set.width).unwrap_or(0),
            rep.height.or(set.height).unwrap_or(0),
        )
        .with_bitrate(bandwidth);
    format.duration = ctx.total.unwrap_or(0.0);

    let protections = if rep.content_protection.is_empty() {
        &set.content_protection
    } else {
        &rep.content_protection
    };
    format.decryption_key = protection(protections);

    let template = SegmentTemplate::merge(rep.segment_template.as_ref(), set.segment_template.as_ref());
    let list = rep.segment_list.as_ref().or(set.segment_list.as_ref());

    if let Some(template) = template {
        let vars = TemplateVars {
            representation_id: &id,
            bandwidth,
            number: None,
            time: None,
        };
        if let Some(init) = &template.initialization {
            format.init_segment = Some(resolve_url(&base, &expand_template(init, &vars))?.to_string());
        }
        format.segments = expand_segments(&template, &vars, &base, ctx.total)?;
    } else if let Some(list) = list {
        if let Some(source) = list
            .initialization
            .as_ref()
            .and_then(|init| init.source_url.as_deref())
        {
            format.init_segment = Some(resolve_url(&base, source)?.to_string());
        }
        for segment in &list.segment_urls {
            let media = segment.media.as_deref().ok_or_else(|| {
                DownloadError::manifest("SegmentURL without media attribute (byte ranges are not supported)")
            })?;
            format.segments.push(resolve_url(&base, media)?.to_string());
        }
        if format.segments.is_empty() {
            return Err(DownloadError::manifest("SegmentList has no segments"));
        }
    } else {
        if !ctx.explicit_base && rep.base_urls.is_empty() {
            return Err(DownloadError::manifest(
                "representation has no BaseURL, SegmentTemplate or SegmentList",
            ));
        }
        format.urls.push(base.to_string());
    }

    Ok(Some(format))
}

fn expand_segments(
    template: &SegmentTemplate,
    vars: &TemplateVars<'_>,
    base: &Url,
    total: Option<f64>,
) -> Result<Vec<String>, DownloadError> {
    let media = template
        .media
        .as_deref()
        .ok_or_else(|| DownloadError::manifest("SegmentTemplate without media attribute"))?;
    let timescale = template.timescale.unwrap_or(1).max(1);
    let start_number = template.start_number.unwrap_or(1);

    let mut points: Vec<(u64, u64)> = Vec::new();
    let mut number = start_number;
    let mut push = |points: &mut Vec<(u64, u64)>, time: u64| -> Result<(), DownloadError> {
        if points.len() >= MAX_SEGMENTS {
            return Err(DownloadError::manifest(format!(
                "SegmentTemplate expands to more than {MAX_SEGMENTS} segments"
            )));
        }
        points.push((number, time));
        number += 1;
        Ok(())
    };

    match &template.timeline {
        Some(timeline) => {
            let origin = timeline.entries.first().and_then(|s| s.t).unwrap_or(0);
            let period_end =
                total.map(|secs| origin.saturating_add((secs * timescale as f64).round() as u64));
            let mut time = origin;
            for (index, entry) in timeline.entries.iter().enumerate() {
                if let Some(t) = entry.t {
                    time = t;
                }
                if entry.d == 0 {
                    return Err(DownloadError::manifest("SegmentTimeline entry with zero duration"));
                }
                match entry.r.unwrap_or(0) {
                    r if r < 0 => {
                        let end = timeline
                            .entries
                            .get(index + 1)
                            .and_then(|next| next.t)
                            .or(period_end);
                        match end {
                            Some(end) => {
                                while time < end {
                                    push(&mut points, time)?;
                                    time = advance(time, entry.d)?;
                                }
                            }
                            None => {
                                warn!("Open-ended SegmentTimeline repeat without a period duration");
                                push(&mut points, time)?;
                                time = advance(time, entry.d)?;
                            }
                        }
                    }
                    r => {
                        for _ in 0..=r {
                            push(&mut points, time)?;
                            time = advance(time, entry.d)?;
                        }
                    }
                }
            }
        }
        None => {
            let total = total.ok_or_else(|| {
                DownloadError::manifest("cannot size a SegmentTemplate without a presentation duration")
            })?;
            let segment_ticks = template
                .duration
                .filter(|d| *d > 0)
                .unwrap_or(DEFAULT_SEGMENT_SECONDS as u64 * timescale);
            let segment_seconds = segment_ticks as f64 / timescale as f64;
            let count = (total / segment_seconds).ceil() as u64;
            for offset in 0..count {
                let time = offset.checked_mul(segment_ticks).ok_or_else(|| {
                    DownloadError::manifest("SegmentTemplate time overflows")
                })?;
                push(&mut points, time)?;
            }
        }
    }

    points
        .into_iter()
        .map(|(number, time)| {
            let vars = TemplateVars {
                number: Some(number),
                time: Some(time),
                ..vars.clone()
            };
            resolve_url(base, &expand_template(media, &vars)).map(|u| u.to_string())
        })
        .collect()
}

fn advance(time: u64, duration: u64) -> Result<u64, DownloadError> {
    time.checked_add(duration)
        .ok_or_else(|| DownloadError::manifest("SegmentTimeline time overflows"))
}
