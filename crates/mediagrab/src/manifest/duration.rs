use std::sync::LazyLock;

use regex::Regex;

static ISO_DURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^P(?:(\d+(?:\.\d+)?)Y)?(?:(\d+(?:\.\d+)?)M)?(?:(\d+(?:\.\d+)?)W)?(?:(\d+(?:\.\d+)?)D)?(?:T(?:(\d+(?:\.\d+)?)H)?(?:(\d+(?:\.\d+)?)M)?(?:(\d+(?:\.\d+)?)S)?)?$",
    )
    .unwrap()
});

// Calendar units use fixed lengths, there is no reference date in a manifest.
const UNIT_SECONDS: [f64; 7] = [
    365.0 * 86_400.0,
    30.0 * 86_400.0,
    7.0 * 86_400.0,
    86_400.0,
    3_600.0,
    60.0,
    1.0,
];

/// Parse an ISO-8601 duration (`PT1H2M3.5S`, `P1DT12H`) into seconds.
pub fn parse_iso8601_duration(value: &str) -> Option<f64> {
    let value = value.trim();
    if value == "P" || value.ends_with('T') {
        return None;
    }
    let caps = ISO_DURATION.captures(value)?;
    let mut seconds = 0.0;
    for (index, unit) in UNIT_SECONDS.iter().enumerate() {
        if let Some(m) = caps.get(index + 1) {
            seconds += m.as_str().parse::<f64>().ok()? * unit;
        }
    }
    Some(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("PT10S", 10.0)]
    #[case("PT1H2M3.5S", 3723.5)]
    #[case("P1DT1S", 86_401.0)]
    #[case("PT0S", 0.0)]
    fn parses_common_forms(#[case] input: &str, #[case] expected: f64) {
        assert_eq!(parse_iso8601_duration(input), Some(expected));
    }

    #[rstest]
    #[case("10")]
    #[case("P")]
    #[case("PT")]
    #[case("PT1X")]
    fn rejects_garbage(#[case] input: &str) {
        assert_eq!(parse_iso8601_duration(input), None);
    }
}
