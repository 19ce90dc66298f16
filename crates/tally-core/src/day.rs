//! Virtual day resolution.
//!
//! A virtual day starts `day_boundary_hour` hours after local midnight, so late-night
//! activity is attributed to the calendar day on which it began. Every day bucket in the
//! engine is computed here.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::{format_description, Date, Duration, OffsetDateTime};

use crate::{EngineConfig, LedgerError};

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 3_600_000;
const DAY_KEY_FORMAT: &str = "[year]-[month]-[day]";

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DayKey(pub Date);

impl DayKey {
    #[must_use]
    pub fn date(self) -> Date {
        self.0
    }

    #[must_use]
    pub fn next(self) -> Option<Self> {
        self.0.next_day().map(Self)
    }

    #[must_use]
    pub fn previous(self) -> Option<Self> {
        self.0.previous_day().map(Self)
    }

    /// Whole days from `earlier` to `self`; negative when `earlier` is later.
    #[must_use]
    pub fn days_since(self, earlier: Self) -> i64 {
        (self.0 - earlier.0).whole_days()
    }

    /// Monday of the week containing this day.
    #[must_use]
    pub fn week_start(self) -> Self {
        let back = i64::from(self.0.weekday().number_days_from_monday());
        self.0.checked_sub(Duration::days(back)).map_or(self, Self)
    }

    /// First day of the month containing this day.
    #[must_use]
    pub fn month_start(self) -> Self {
        self.0.replace_day(1).map_or(self, Self)
    }

    /// Parse a `YYYY-MM-DD` day key.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when the text is not a valid calendar date.
    pub fn parse(raw: &str) -> Result<Self, LedgerError> {
        let format = format_description::parse(DAY_KEY_FORMAT)
            .map_err(|err| LedgerError::Validation(err.to_string()))?;
        Date::parse(raw.trim(), &format).map(Self).map_err(|err| {
            LedgerError::Validation(format!("invalid day key (want YYYY-MM-DD): {raw}: {err}"))
        })
    }
}

impl Display for DayKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let format = format_description::parse(DAY_KEY_FORMAT).map_err(|_| std::fmt::Error)?;
        let text = self.0.format(&format).map_err(|_| std::fmt::Error)?;
        f.write_str(&text)
    }
}

impl FromStr for DayKey {
    type Err = LedgerError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw)
    }
}

impl Serialize for DayKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DayKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

fn boundary_shift_ms(config: &EngineConfig) -> i64 {
    i64::from(config.utc_offset_minutes) * MINUTE_MS - i64::from(config.day_boundary_hour) * HOUR_MS
}

/// Map an instant (epoch milliseconds) to its virtual day.
///
/// # Errors
/// Returns [`LedgerError::Time`] when the instant is outside the supported calendar range.
pub fn virtual_date(instant_ms: i64, config: &EngineConfig) -> Result<DayKey, LedgerError> {
    let shifted_ms = instant_ms
        .checked_add(boundary_shift_ms(config))
        .ok_or_else(|| LedgerError::Time(format!("instant {instant_ms} overflows")))?;
    let shifted = OffsetDateTime::from_unix_timestamp_nanos(i128::from(shifted_ms) * 1_000_000)
        .map_err(|err| LedgerError::Time(format!("instant {instant_ms} out of range: {err}")))?;
    Ok(DayKey(shifted.date()))
}

/// First instant (epoch milliseconds) belonging to `day`.
#[must_use]
pub fn day_start_ms(day: DayKey, config: &EngineConfig) -> i64 {
    let midnight_ms = day.0.midnight().assume_utc().unix_timestamp() * 1000;
    midnight_ms - boundary_shift_ms(config)
}

/// Representative instant used as the timestamp of a day's check-in.
#[must_use]
pub fn day_anchor_ms(day: DayKey, config: &EngineConfig) -> i64 {
    day_start_ms(day, config) + i64::from(config.check_anchor_offset_hours) * HOUR_MS
}
