//! Small hand-written grammars: the snapshot directory timestamp, the CLI's
//! duration shorthand, and the comma-separated retention plan spec. Kept as
//! direct regex matchers rather than a parser-combinator dependency, the way
//! the original Python (`re.fullmatch`) and this crate's teacher both favor
//! small hand-rolled grammars over a heavier crate for this kind of fixed
//! shape.

use anyhow::{anyhow, bail, Result};
use chrono::{Duration, Local, NaiveDate, NaiveDateTime, TimeZone};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref SNAPSHOT_NAME: Regex = Regex::new(
        r"^(?P<year>\d{4})[-_]?(?P<month>\d{2})[-_]?(?P<day>\d{2})(?:[-_Tt](?P<hour>\d{2})[-_]?(?P<minute>\d{2})(?:[-_]?(?P<second>\d{2}))?)?$"
    )
    .unwrap();
    static ref DURATION_SHORTHAND: Regex = Regex::new(r"^(?P<count>\d+)(?P<unit>[mhdw])$").unwrap();
}

/// Parses a snapshot directory name into a local civil-time instant, per the
/// grammar `YYYY[-_]?MM[-_]?DD( [-_Tt] HH [-_]? MM ( [-_]? SS )? )?`, falling
/// back to ISO-8601 (RFC 3339) when the fixed grammar doesn't match.
pub fn parse_snapshot_name(name: &str) -> Option<chrono::DateTime<Local>> {
    if let Some(caps) = SNAPSHOT_NAME.captures(name) {
        let year: i32 = caps["year"].parse().ok()?;
        let month: u32 = caps["month"].parse().ok()?;
        let day: u32 = caps["day"].parse().ok()?;
        let hour: u32 = caps.name("hour").map_or(Ok(0), |m| m.as_str().parse()).ok()?;
        let minute: u32 = caps.name("minute").map_or(Ok(0), |m| m.as_str().parse()).ok()?;
        let second: u32 = caps.name("second").map_or(Ok(0), |m| m.as_str().parse()).ok()?;

        let date = NaiveDate::from_ymd_opt(year, month, day)?;
        let naive = date.and_hms_opt(hour, minute, second)?;
        return local_from_naive(naive);
    }

    chrono::DateTime::parse_from_rfc3339(name)
        .ok()
        .map(|dt| dt.with_timezone(&Local))
}

fn local_from_naive(naive: NaiveDateTime) -> Option<chrono::DateTime<Local>> {
    match Local.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) => Some(dt),
        chrono::LocalResult::Ambiguous(earliest, _) => Some(earliest),
        chrono::LocalResult::None => None,
    }
}

/// Formats an instant back into the canonical `YYYY-MM-DD_HH-MM-SS` form
/// this crate writes for new snapshots (always the fully-qualified form,
/// even though the parser accepts several shorthands on input).
pub fn format_snapshot_name(when: chrono::DateTime<Local>) -> String {
    when.format("%Y-%m-%d_%H-%M-%S").to_string()
}

/// Parses the CLI's duration shorthand: `<non-negative integer><m|h|d|w>`.
pub fn parse_duration(text: &str) -> Result<Duration> {
    let caps = DURATION_SHORTHAND
        .captures(text)
        .ok_or_else(|| anyhow!("malformed duration {:?}, expected e.g. \"3d\"", text))?;
    let count: i64 = caps["count"].parse()?;
    Ok(match &caps["unit"] {
        "m" => Duration::minutes(count),
        "h" => Duration::hours(count),
        "d" => Duration::days(count),
        "w" => Duration::weeks(count),
        _ => unreachable!("regex only matches m|h|d|w"),
    })
}

/// A single `(interval, count)` entry of a retention plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionRule {
    pub interval: Duration,
    pub count: u32,
}

/// Parses the `cleanup --retention-plan` grammar: comma-separated `D:N`
/// pairs, order preserved (order is significant to the planner).
pub fn parse_retention_plan(text: &str) -> Result<Vec<RetentionRule>> {
    text.split(',')
        .map(|entry| {
            let (duration_part, count_part) = entry
                .split_once(':')
                .ok_or_else(|| anyhow!("malformed retention plan entry {:?}, expected \"D:N\"", entry))?;
            let interval = parse_duration(duration_part)?;
            let count: u32 = count_part
                .parse()
                .map_err(|_| anyhow!("malformed retention plan entry {:?}: {:?} is not a count", entry, count_part))?;
            Ok(RetentionRule { interval, count })
        })
        .collect()
}

/// Parses a non-negative integer CLI argument (`--force-delete`).
pub fn non_negative_int(text: &str) -> Result<u32> {
    let value: i64 = text.parse()?;
    if value < 0 {
        bail!("illegal argument: {}", text);
    }
    Ok(value as u32)
}
