//! Human-typed durations: `30`, `45m`, `1h`, `1.5h`, `1h30m`, `2h 15m`,
//! and bare decimals such as `1.5`, which count as hours. Plain integers
//! are minutes.

use std::sync::OnceLock;

use regex::Regex;

struct Shapes {
    /// `1h30m`, `2h15`
    combined: Regex,
    /// `3h`, `1.5h`
    hours: Regex,
    /// `45m`
    minutes: Regex,
    /// `1.5`, read as hours
    decimal: Regex,
    /// `30`
    plain: Regex,
}

fn shapes() -> &'static Shapes {
    static SHAPES: OnceLock<Shapes> = OnceLock::new();
    SHAPES.get_or_init(|| Shapes {
        combined: pattern(r"^(\d+)h(\d+)m?$"),
        hours: pattern(r"^(\d+\.?\d*)h$"),
        minutes: pattern(r"^(\d+)m$"),
        decimal: pattern(r"^(\d+\.\d+)$"),
        plain: pattern(r"^(\d+)$"),
    })
}

fn pattern(source: &str) -> Regex {
    Regex::new(source).expect("duration pattern is a valid regex")
}

/// Whole minutes, or `None` when `text` is not a duration or does not fit
/// in a `u64`.
pub fn parse_minutes(text: &str) -> Option<u64> {
    let text: String = text
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| *c != ' ')
        .collect();
    let shapes = shapes();

    if let Some(caps) = shapes.combined.captures(&text) {
        let hours: u64 = caps[1].parse().ok()?;
        let minutes: u64 = caps[2].parse().ok()?;
        return hours.checked_mul(60)?.checked_add(minutes);
    }
    if let Some(caps) = shapes.hours.captures(&text) {
        return hours_to_minutes(&caps[1]);
    }
    if let Some(caps) = shapes.minutes.captures(&text) {
        return caps[1].parse().ok();
    }
    if let Some(caps) = shapes.decimal.captures(&text) {
        return hours_to_minutes(&caps[1]);
    }
    if let Some(caps) = shapes.plain.captures(&text) {
        return caps[1].parse().ok();
    }
    None
}

fn hours_to_minutes(hours: &str) -> Option<u64> {
    let minutes = (hours.parse::<f64>().ok()? * 60.0).floor();
    (minutes.is_finite() && minutes < u64::MAX as f64).then_some(minutes as u64)
}
