//! DASH `SegmentTemplate` identifier expansion.

use std::sync::LazyLock;

use regex::{Captures, Regex};

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(?:(RepresentationID|Number|Time|Bandwidth)(?:%0(\d+)d)?)?\$").unwrap()
});

/// Values substituted into a template.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars<'a> {
    pub representation_id: &'a str,
    pub bandwidth: u64,
    pub number: Option<u64>,
    pub time: Option<u64>,
}

/// Expand `$RepresentationID$`, `$Number$`, `$Time$`, `$Bandwidth$` (each
/// optionally with a `%0Nd` width) and the `$$` escape.
///
/// Identifiers without a value are left untouched.
pub fn expand_template(template: &str, vars: &TemplateVars<'_>) -> String {
    IDENTIFIER
        .replace_all(template, |caps: &Captures<'_>| {
            let Some(name) = caps.get(1) else {
                return "$".to_string();
            };
            let value = match name.as_str() {
                "RepresentationID" => Some(vars.representation_id.to_string()),
                "Number" => vars.number.map(|n| n.to_string()),
                "Time" => vars.time.map(|t| t.to_string()),
                "Bandwidth" => Some(vars.bandwidth.to_string()),
                _ => None,
            };
            match (value, caps.get(2)) {
                (Some(value), Some(width)) => {
                    let width = width.as_str().parse::<usize>().unwrap_or(0);
                    format!("{value:0>width$}")
                }
                (Some(value), None) => value,
                (None, _) => caps[0].to_string(),
            }
        })
        .into_owned()
}
