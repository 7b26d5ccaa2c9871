//! Duration argument parsing.
//!
//! Accepts a decimal count followed by a unit suffix: `us`, `ms`, `s`,
//! `m`, `h`, `d`, `w`. Used as a clap value parser for `--timeout` and
//! the cleanup flags.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

static DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<count>.*?)(?P<unit>[a-zA-Z]*)$").expect("static regex"));

/// Parse a duration argument like `100ms` or `1.5s`.
///
/// The error message names which part was bad so CLI users can tell a
/// typo'd count from a typo'd unit.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let captures = DURATION_RE.captures(value).expect("pattern matches any input");
    let count_str = &captures["count"];
    let unit_str = &captures["unit"];

    let count: Option<f64> = count_str.parse().ok().filter(|c: &f64| *c >= 0.0 && c.is_finite());

    let unit_seconds = match unit_str {
        "us" => Some(1e-6),
        "ms" => Some(1e-3),
        "s" => Some(1.0),
        "m" => Some(60.0),
        "h" => Some(3600.0),
        "d" => Some(86400.0),
        "w" => Some(604800.0),
        _ => None,
    };

    match (count, unit_seconds) {
        (Some(count), Some(unit_seconds)) => Ok(Duration::from_secs_f64(count * unit_seconds)),
        _ => {
            let mut reasons = Vec::new();
            if count.is_none() {
                reasons.push(format!("bad count: {count_str:?}"));
            }
            if unit_seconds.is_none() {
                reasons.push(format!("bad unit: {unit_str:?}"));
            }
            Err(format!(
                "{value:?} is not a valid time delta: {}",
                reasons.join(", ")
            ))
        }
    }
}
