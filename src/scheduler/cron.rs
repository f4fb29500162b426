use std::time::Duration;

use chrono::{DateTime, Local};
use croner::Cron;

/// Outcome of interpreting a stored schedule string.
#[derive(Debug, Clone)]
pub enum ParsedSchedule {
    /// Empty, `off` or `mati`.
    Disabled,
    Invalid { schedule: String, reason: String },
    Valid(Cron),
}

/// Words that switch a schedule off.
const OFF_WORDS: &[&str] = &["off", "mati"];

/// Accepts standard 5-field cron and 6-field cron with leading seconds.
pub fn parse_schedule(schedule: Option<&str>) -> ParsedSchedule {
    let Some(raw) = schedule.map(str::trim).filter(|s| !s.is_empty()) else {
        return ParsedSchedule::Disabled;
    };
    if OFF_WORDS.iter().any(|w| raw.eq_ignore_ascii_case(w)) {
        return ParsedSchedule::Disabled;
    }
    match Cron::new(raw).with_seconds_optional().parse() {
        Ok(cron) => ParsedSchedule::Valid(cron),
        Err(e) => ParsedSchedule::Invalid {
            schedule: raw.to_string(),
            reason: e.to_string(),
        },
    }
}

pub fn is_valid(schedule: &str) -> bool {
    matches!(parse_schedule(Some(schedule)), ParsedSchedule::Valid(_))
}

/// Time from `now` until the next occurrence, or `None` if there is none.
pub fn until_next(cron: &Cron, now: &DateTime<Local>) -> Option<Duration> {
    let next = cron.find_next_occurrence(now, false).ok()?;
    Some((next - *now).to_std().unwrap_or_default())
}
