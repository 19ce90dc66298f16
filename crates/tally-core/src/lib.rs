use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

pub mod checks;
pub mod config;
pub mod day;
pub mod oracle;
pub mod period;
pub mod recalc;
pub mod snapshot;

pub use checks::resolve_checks;
pub use config::EngineConfig;
pub use day::{day_anchor_ms, day_start_ms, virtual_date, DayKey};
pub use oracle::{BonusOracle, ExerciseCredit, StandardOracle};
pub use period::{
    boundary_for, decide_rollover, refresh_archive, restore_plan, seal_archive, settings_for_mode,
    RestorePlan, RolloverDecision,
};
pub use recalc::{
    plan_recalculation, regenerate_memo, strip_bonus_markers, ExerciseRewrite, RecalcPlan,
};
pub use snapshot::{DayAggregate, LedgerSnapshot};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("time error: {0}")]
    Time(String),
}

macro_rules! ulid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Parse the canonical ULID text form.
            ///
            /// # Errors
            /// Returns [`LedgerError::Validation`] when `raw` is not a ULID.
            pub fn parse(raw: &str) -> Result<Self, LedgerError> {
                Ulid::from_string(raw)
                    .map(Self)
                    .map_err(|err| LedgerError::Validation(format!("invalid ULID {raw}: {err}")))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(LogId);
ulid_id!(CheckId);
ulid_id!(ArchiveId);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    Beer,
    Exercise,
}

impl LogType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Beer => "beer",
            Self::Exercise => "exercise",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "beer" => Some(Self::Beer),
            "exercise" => Some(Self::Exercise),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BeerLog {
    pub style: Option<String>,
    pub brand: Option<String>,
    pub size_label: Option<String>,
    pub volume_ml: f64,
    pub abv_percent: f64,
    pub carb_factor: f64,
    pub count: u32,
    pub rating: Option<u8>,
    #[serde(default)]
    pub memo: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExerciseLog {
    pub exercise_key: String,
    pub minutes: f64,
    #[serde(default)]
    pub memo: String,
}

/// Event-specific fields of a ledger entry.
///
/// New event types are added here; every `match` on this enum in the planner and the
/// snapshot builder is exhaustive so the compiler points at each place to extend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "log_type", rename_all = "snake_case")]
pub enum LogDetail {
    Beer(BeerLog),
    Exercise(ExerciseLog),
}

impl LogDetail {
    #[must_use]
    pub fn log_type(&self) -> LogType {
        match self {
            Self::Beer(_) => LogType::Beer,
            Self::Exercise(_) => LogType::Exercise,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub id: LogId,
    pub timestamp_ms: i64,
    pub kcal: Option<f64>,
    pub detail: LogDetail,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl LogEntry {
    #[must_use]
    pub fn log_type(&self) -> LogType {
        self.detail.log_type()
    }

    /// Validate user-owned fields before the entry is persisted.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when quantities are out of range.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if let Some(kcal) = self.kcal {
            if !kcal.is_finite() {
                return Err(LedgerError::Validation("kcal MUST be finite".to_string()));
            }
        }

        match &self.detail {
            LogDetail::Beer(beer) => {
                if !(beer.volume_ml.is_finite() && beer.volume_ml > 0.0) {
                    return Err(LedgerError::Validation("volume_ml MUST be > 0".to_string()));
                }
                if !(0.0..=100.0).contains(&beer.abv_percent) {
                    return Err(LedgerError::Validation(
                        "abv_percent MUST be in [0, 100]".to_string(),
                    ));
                }
                if !(beer.carb_factor.is_finite() && beer.carb_factor >= 0.0) {
                    return Err(LedgerError::Validation("carb_factor MUST be >= 0".to_string()));
                }
                if beer.count == 0 {
                    return Err(LedgerError::Validation("count MUST be >= 1".to_string()));
                }
                if let Some(rating) = beer.rating {
                    if rating > 5 {
                        return Err(LedgerError::Validation(
                            "rating MUST be in [0, 5]".to_string(),
                        ));
                    }
                }
            }
            LogDetail::Exercise(exercise) => {
                if exercise.exercise_key.trim().is_empty() {
                    return Err(LedgerError::Validation(
                        "exercise_key MUST be non-empty".to_string(),
                    ));
                }
                if !(exercise.minutes.is_finite() && exercise.minutes > 0.0) {
                    return Err(LedgerError::Validation("minutes MUST be > 0".to_string()));
                }
            }
        }

        Ok(())
    }

    /// [`LogEntry::validate`] plus a check that the timestamp maps to a virtual day
    /// under `config`. An entry failing this would break every later snapshot build.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for bad fields or an out-of-range timestamp.
    pub fn validate_for(&self, config: &EngineConfig) -> Result<(), LedgerError> {
        self.validate()?;
        virtual_date(self.timestamp_ms, config).map(|_| ()).map_err(|_| {
            LedgerError::Validation(format!(
                "timestamp_ms {} is outside the supported calendar range",
                self.timestamp_ms
            ))
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct WellnessFlags {
    pub slept_well: Option<bool>,
    pub hydrated: Option<bool>,
    pub headache: Option<bool>,
    pub energetic: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckEntry {
    pub id: CheckId,
    pub timestamp_ms: i64,
    pub is_dry_day: bool,
    #[serde(default)]
    pub wellness: WellnessFlags,
    pub weight_kg: Option<f64>,
    pub is_saved: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PeriodMode {
    Weekly,
    Monthly,
    Custom,
    Permanent,
}

impl PeriodMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Custom => "custom",
            Self::Permanent => "permanent",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "weekly" => Some(Self::Weekly),
            "monthly" => Some(Self::Monthly),
            "custom" => Some(Self::Custom),
            "permanent" => Some(Self::Permanent),
            _ => None,
        }
    }
}

/// Period accounting settings, persisted through the store's key-value table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct PeriodSettings {
    pub mode: PeriodMode,
    pub period_start_ms: i64,
    pub custom_end_ms: Option<i64>,
}

impl Default for PeriodSettings {
    fn default() -> Self {
        Self { mode: PeriodMode::Permanent, period_start_ms: 0, custom_end_ms: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodArchive {
    pub id: ArchiveId,
    pub start_date_ms: i64,
    pub end_date_ms: i64,
    pub mode: PeriodMode,
    pub total_balance: f64,
    pub logs: Vec<LogEntry>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl PeriodArchive {
    #[must_use]
    pub fn contains(&self, timestamp_ms: i64) -> bool {
        (self.start_date_ms..=self.end_date_ms).contains(&timestamp_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Sex {
    Female,
    Male,
    Unspecified,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    pub weight_kg: f64,
    pub height_cm: f64,
    pub age_years: u32,
    pub sex: Sex,
}

impl Default for Profile {
    fn default() -> Self {
        Self { weight_kg: 65.0, height_cm: 170.0, age_years: 30, sex: Sex::Unspecified }
    }
}

impl Profile {
    /// # Errors
    /// Returns [`LedgerError::Validation`] when body measurements are not positive.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if !(self.weight_kg.is_finite() && self.weight_kg > 0.0) {
            return Err(LedgerError::Validation("weight_kg MUST be > 0".to_string()));
        }
        if !(self.height_cm.is_finite() && self.height_cm > 0.0) {
            return Err(LedgerError::Validation("height_cm MUST be > 0".to_string()));
        }
        Ok(())
    }
}

/// Sum of stored kcal over entries; entries without a value contribute nothing.
#[must_use]
pub fn kcal_total(logs: &[LogEntry]) -> f64 {
    logs.iter().filter_map(|log| log.kcal).sum()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use time::Duration;

    pub const DAY_MS: i64 = 86_400_000;
    pub const HOUR_MS: i64 = 3_600_000;

    /// 2023-11-13 12:00:00 UTC, a Monday.
    pub const MONDAY_NOON_MS: i64 = 1_699_876_800_000;

    pub fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    pub fn exercise(timestamp_ms: i64, kcal: f64, memo: &str) -> LogEntry {
        LogEntry {
            id: LogId::new(),
            timestamp_ms,
            kcal: Some(kcal),
            detail: LogDetail::Exercise(ExerciseLog {
                exercise_key: "running".to_string(),
                minutes: 30.0,
                memo: memo.to_string(),
            }),
            created_at: fixture_time(),
            updated_at: fixture_time(),
        }
    }

    pub fn beer(timestamp_ms: i64, kcal: f64) -> LogEntry {
        LogEntry {
            id: LogId::new(),
            timestamp_ms,
            kcal: Some(kcal),
            detail: LogDetail::Beer(BeerLog {
                style: Some("lager".to_string()),
                brand: None,
                size_label: Some("can".to_string()),
                volume_ml: 350.0,
                abv_percent: 5.0,
                carb_factor: 3.0,
                count: 1,
                rating: None,
                memo: String::new(),
            }),
            created_at: fixture_time(),
            updated_at: fixture_time(),
        }
    }

    pub fn check(timestamp_ms: i64, is_dry_day: bool, is_saved: bool) -> CheckEntry {
        CheckEntry {
            id: CheckId::new(),
            timestamp_ms,
            is_dry_day,
            wellness: WellnessFlags::default(),
            weight_kg: None,
            is_saved,
            created_at: fixture_time(),
            updated_at: fixture_time(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn assert_validation_error_contains(log: &LogEntry, expected_substring: &str) {
        let err = match log.validate() {
            Ok(()) => panic!("expected validation error containing: {expected_substring}"),
            Err(err) => err,
        };

        assert!(
            err.to_string().contains(expected_substring),
            "validation error `{err}` did not contain `{expected_substring}`"
        );
    }

    #[test]
    fn validate_rejects_zero_beer_count() {
        let mut log = beer(MONDAY_NOON_MS, -140.0);
        if let LogDetail::Beer(detail) = &mut log.detail {
            detail.count = 0;
        }
        assert_validation_error_contains(&log, "count MUST be >= 1");
    }

    #[test]
    fn validate_rejects_blank_exercise_key() {
        let mut log = exercise(MONDAY_NOON_MS, 100.0, "");
        if let LogDetail::Exercise(detail) = &mut log.detail {
            detail.exercise_key = "  ".to_string();
        }
        assert_validation_error_contains(&log, "exercise_key MUST be non-empty");
    }

    #[test]
    fn validate_rejects_non_finite_kcal() {
        let mut log = exercise(MONDAY_NOON_MS, 100.0, "");
        log.kcal = Some(f64::NAN);
        assert_validation_error_contains(&log, "kcal MUST be finite");
    }

    #[test]
    fn validate_for_rejects_timestamps_beyond_the_calendar() {
        let config = EngineConfig::default();
        assert_eq!(exercise(MONDAY_NOON_MS, 100.0, "").validate_for(&config), Ok(()));

        for timestamp_ms in [400_000_000_000_000, i64::MIN] {
            let log = beer(timestamp_ms, -140.0);
            assert_eq!(log.validate(), Ok(()));
            let err = log.validate_for(&config);
            assert!(
                matches!(&err, Err(LedgerError::Validation(message)) if message.contains("calendar range")),
                "unexpected result for {timestamp_ms}: {err:?}"
            );
        }
    }

    #[test]
    fn log_detail_serializes_with_type_tag() {
        let log = exercise(MONDAY_NOON_MS, 100.0, "easy run");
        let value = match serde_json::to_value(&log) {
            Ok(value) => value,
            Err(err) => panic!("log should serialize: {err}"),
        };
        let detail = value.get("detail").cloned().unwrap_or_default();
        assert_eq!(detail.get("log_type").and_then(serde_json::Value::as_str), Some("exercise"));
        assert_eq!(detail.get("memo").and_then(serde_json::Value::as_str), Some("easy run"));
    }

    #[test]
    fn kcal_total_ignores_uncomputed_entries() {
        let mut pending = exercise(MONDAY_NOON_MS, 0.0, "");
        pending.kcal = None;
        let logs = vec![beer(MONDAY_NOON_MS, -140.0), exercise(MONDAY_NOON_MS, 90.0, ""), pending];
        assert!((kcal_total(&logs) - (-50.0)).abs() < f64::EPSILON);
    }

    #[test]
    fn ids_parse_their_display_form() {
        let id = LogId::new();
        assert_eq!(LogId::parse(&id.to_string()), Ok(id));
        assert!(matches!(LogId::parse("not-a-ulid"), Err(LedgerError::Validation(_))));
    }
}
