//! Calendar bucket arithmetic for the five aggregation scales.
//!
//! All timestamps are milliseconds since the Unix epoch, interpreted in UTC.
//! A window-list holds one entry per bucket with index 0 being the bucket of
//! the most recent processed time.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{AggregatorError, Result};

const SECOND_MILLIS: i64 = 1_000;
const MINUTE_MILLIS: i64 = 60 * SECOND_MILLIS;
const HOUR_MILLIS: i64 = 60 * MINUTE_MILLIS;
const DAY_MILLIS: i64 = 24 * HOUR_MILLIS;
/// Average Gregorian month, only used outside chrono's representable range.
const AVERAGE_MONTH_MILLIS: i64 = 2_629_746_000;
/// Consumers stay listed for this many calendar months before slack applies.
pub const RETENTION_MONTHS: i32 = 2;
/// Largest slack width accepted from configuration.
pub const MAX_SLACK_WIDTH: u32 = 1_000_000;

static SLACK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9]+)([MDhms])$").expect("valid slack regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scale {
    Second,
    Minute,
    Hour,
    Day,
    Month,
}

/// Window slots of a metric, in storage order.
pub const SCALES: [Scale; 5] = [
    Scale::Second,
    Scale::Minute,
    Scale::Hour,
    Scale::Day,
    Scale::Month,
];

impl Scale {
    pub fn code(self) -> char {
        match self {
            Self::Second => 's',
            Self::Minute => 'm',
            Self::Hour => 'h',
            Self::Day => 'D',
            Self::Month => 'M',
        }
    }

    pub fn from_code(code: char) -> Option<Self> {
        match code {
            's' => Some(Self::Second),
            'm' => Some(Self::Minute),
            'h' => Some(Self::Hour),
            'D' => Some(Self::Day),
            'M' => Some(Self::Month),
            _ => None,
        }
    }

    /// Position of this scale inside `Metric::windows`.
    pub fn slot(self) -> usize {
        match self {
            Self::Second => 0,
            Self::Minute => 1,
            Self::Hour => 2,
            Self::Day => 3,
            Self::Month => 4,
        }
    }
}

impl fmt::Display for Scale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Calendar bucket number of `millis` at `scale`.
pub fn bucket(millis: i64, scale: Scale) -> i64 {
    match scale {
        Scale::Second => millis.div_euclid(SECOND_MILLIS),
        Scale::Minute => millis.div_euclid(MINUTE_MILLIS),
        Scale::Hour => millis.div_euclid(HOUR_MILLIS),
        Scale::Day => millis.div_euclid(DAY_MILLIS),
        Scale::Month => match DateTime::<Utc>::from_timestamp_millis(millis) {
            Some(at) => i64::from(at.year()) * 12 + i64::from(at.month0()),
            None => millis.div_euclid(AVERAGE_MONTH_MILLIS),
        },
    }
}

/// Number of bucket boundaries crossed going from `from` to `to`.
pub fn bucket_distance(from: i64, to: i64, scale: Scale) -> i64 {
    bucket(to, scale) - bucket(from, scale)
}

/// Ages `window` by the number of buckets between `old` and `new`.
///
/// Entries move toward higher indices, anything pushed past the current
/// length is dropped and the vacated leading slots become absent. The list
/// length never changes.
pub fn shift_window<T>(old: i64, new: i64, window: &mut Vec<Option<T>>, scale: Scale) {
    let distance = bucket_distance(old, new, scale);
    if distance <= 0 || window.is_empty() {
        return;
    }

    let len = window.len();
    let distance = usize::try_from(distance).unwrap_or(usize::MAX);
    if distance >= len {
        window.iter_mut().for_each(|slot| *slot = None);
        return;
    }

    window.truncate(len - distance);
    for _ in 0..distance {
        window.insert(0, None);
    }
}

/// Index of the bucket holding `doc_end` as seen from `now`, clamped to the
/// bounds of `window`.
pub fn time_window_index<T>(window: &[Option<T>], now: i64, doc_end: i64, scale: Scale) -> usize {
    if window.is_empty() {
        return 0;
    }
    let last = window.len() - 1;
    let distance = bucket_distance(doc_end, now, scale);
    if distance <= 0 {
        0
    } else {
        usize::try_from(distance).map_or(last, |index| index.min(last))
    }
}

/// Extra retention granted to consumer entries past the two month baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slack {
    pub scale: Scale,
    pub width: u32,
}

impl Slack {
    pub fn new(scale: Scale, width: u32) -> Self {
        Self { scale, width }
    }
}

impl fmt::Display for Slack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.width, self.scale.code())
    }
}

impl FromStr for Slack {
    type Err = AggregatorError;

    fn from_str(value: &str) -> Result<Self> {
        let invalid = || AggregatorError::Config(format!("invalid slack value '{value}'"));
        let captures = SLACK_RE.captures(value.trim()).ok_or_else(invalid)?;
        let width = captures[1]
            .parse::<u32>()
            .ok()
            .filter(|width| *width <= MAX_SLACK_WIDTH)
            .ok_or_else(invalid)?;
        let scale = captures[2]
            .chars()
            .next()
            .and_then(Scale::from_code)
            .ok_or_else(invalid)?;
        Ok(Self { scale, width })
    }
}

impl Serialize for Slack {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Slack {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value
            .parse::<Slack>()
            .map_err(|err| serde::de::Error::custom(err.to_string()))
    }
}

/// Instant after which an entry stamped at `millis` is no longer retained.
///
/// The baseline is the first instant of the calendar month two months after
/// `millis`. Slack finer than a month keeps the stamp's own day, hour,
/// minute and second down to the slack scale and adds `width` there;
/// overflowing components roll over the way calendar arithmetic does.
pub fn retention_deadline(millis: i64, slack: Option<&Slack>) -> Option<i64> {
    let at = DateTime::<Utc>::from_timestamp_millis(millis)?;

    let extra_months = match slack {
        Some(slack) if slack.scale == Scale::Month => i32::try_from(slack.width).ok()?,
        _ => 0,
    };
    let months = (at.year() * 12 + at.month0() as i32)
        .checked_add(RETENTION_MONTHS)?
        .checked_add(extra_months)?;
    let month_start = NaiveDate::from_ymd_opt(months.div_euclid(12), months.rem_euclid(12) as u32 + 1, 1)?
        .and_hms_opt(0, 0, 0)?
        .and_utc();

    let offset = match slack {
        None => Duration::zero(),
        Some(slack) => {
            let width = i64::from(slack.width);
            let day = i64::from(at.day0());
            let hour = i64::from(at.hour());
            let minute = i64::from(at.minute());
            let second = i64::from(at.second());
            match slack.scale {
                Scale::Month => Duration::zero(),
                Scale::Day => Duration::days(day + width),
                Scale::Hour => Duration::days(day) + Duration::hours(hour + width),
                Scale::Minute => {
                    Duration::days(day) + Duration::hours(hour) + Duration::minutes(minute + width)
                }
                Scale::Second => {
                    Duration::days(day)
                        + Duration::hours(hour)
                        + Duration::minutes(minute)
                        + Duration::seconds(second + width)
                }
            }
        }
    };

    month_start
        .checked_add_signed(offset)
        .map(|deadline| deadline.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn ms(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> i64 {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s)
            .single()
            .unwrap()
            .timestamp_millis()
    }

    #[test]
    fn buckets_follow_calendar_months() {
        let jan = ms(2024, 1, 31, 23, 59, 59);
        let feb = ms(2024, 2, 1, 0, 0, 0);
        assert_eq!(bucket_distance(jan, feb, Scale::Month), 1);
        assert_eq!(bucket_distance(jan, feb, Scale::Day), 1);
        assert_eq!(bucket_distance(jan, feb, Scale::Second), 1);
        assert_eq!(bucket_distance(jan, ms(2024, 3, 1, 0, 0, 0), Scale::Month), 2);
        assert_eq!(bucket_distance(ms(2023, 12, 5, 0, 0, 0), feb, Scale::Month), 2);
    }

    #[test]
    fn shift_moves_entries_toward_older_indices() {
        let mut window = vec![Some(1), Some(2), Some(3)];
        shift_window(0, 2 * MINUTE_MILLIS, &mut window, Scale::Minute);
        assert_eq!(window, vec![None, None, Some(1)]);
    }

    #[test]
    fn shift_past_retention_clears_window() {
        let mut window = vec![Some(1), Some(2)];
        shift_window(0, 5 * HOUR_MILLIS, &mut window, Scale::Hour);
        assert_eq!(window, vec![None, None]);
    }

    #[test]
    fn shift_within_bucket_is_noop() {
        let mut window = vec![Some(1), Some(2)];
        shift_window(1_000, 59_000, &mut window, Scale::Minute);
        assert_eq!(window, vec![Some(1), Some(2)]);
        shift_window(59_000, 1_000, &mut window, Scale::Second);
        assert_eq!(window, vec![Some(1), Some(2)]);
    }

    #[test]
    fn index_is_clamped_to_window() {
        let window: Vec<Option<u8>> = vec![None, None, None];
        let now = ms(2024, 5, 10, 12, 0, 0);
        assert_eq!(time_window_index(&window, now, now, Scale::Day), 0);
        assert_eq!(
            time_window_index(&window, now, ms(2024, 5, 9, 23, 0, 0), Scale::Day),
            1
        );
        assert_eq!(
            time_window_index(&window, now, ms(2024, 1, 1, 0, 0, 0), Scale::Day),
            2
        );
        assert_eq!(
            time_window_index(&window, now, ms(2024, 6, 1, 0, 0, 0), Scale::Month),
            0
        );
        let empty: Vec<Option<u8>> = Vec::new();
        assert_eq!(time_window_index(&empty, now, 0, Scale::Month), 0);
    }

    #[test]
    fn slack_parses_and_prints() {
        let slack: Slack = "3D".parse().unwrap();
        assert_eq!(slack, Slack::new(Scale::Day, 3));
        assert_eq!(slack.to_string(), "3D");
        assert!("3d".parse::<Slack>().is_err());
        assert!("D".parse::<Slack>().is_err());
        assert!("12h".parse::<Slack>().is_ok());
    }

    #[test]
    fn deadline_starts_two_months_later() {
        let stamp = ms(2024, 11, 17, 8, 30, 15);
        assert_eq!(
            retention_deadline(stamp, None),
            Some(ms(2025, 1, 1, 0, 0, 0))
        );
        let months = Slack::new(Scale::Month, 1);
        assert_eq!(
            retention_deadline(stamp, Some(&months)),
            Some(ms(2025, 2, 1, 0, 0, 0))
        );
        let days = Slack::new(Scale::Day, 2);
        assert_eq!(
            retention_deadline(stamp, Some(&days)),
            Some(ms(2025, 1, 19, 0, 0, 0))
        );
        let seconds = Slack::new(Scale::Second, 50);
        assert_eq!(
            retention_deadline(stamp, Some(&seconds)),
            Some(ms(2025, 1, 17, 8, 31, 5))
        );
    }

    #[test]
    fn oversized_slack_is_rejected() {
        assert!("2147483647M".parse::<Slack>().is_err());
        assert!("99999999999D".parse::<Slack>().is_err());
        let widest: Slack = format!("{MAX_SLACK_WIDTH}M").parse().unwrap();
        assert!(retention_deadline(ms(2024, 1, 1, 0, 0, 0), Some(&widest)).is_some());
        let widest: Slack = format!("{MAX_SLACK_WIDTH}D").parse().unwrap();
        assert!(retention_deadline(ms(2024, 1, 1, 0, 0, 0), Some(&widest)).is_some());
    }

    #[test]
    fn overflowing_month_slack_has_no_deadline() {
        let slack = Slack::new(Scale::Month, i32::MAX as u32);
        assert_eq!(retention_deadline(0, Some(&slack)), None);
        let slack = Slack::new(Scale::Month, u32::MAX);
        assert_eq!(retention_deadline(0, Some(&slack)), None);
    }

    #[test]
    fn deadline_rolls_over_short_months() {
        let stamp = ms(2023, 12, 31, 0, 0, 0);
        let hours = Slack::new(Scale::Hour, 1);
        assert_eq!(
            retention_deadline(stamp, Some(&hours)),
            Some(ms(2024, 3, 2, 1, 0, 0))
        );
    }
}
