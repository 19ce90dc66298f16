use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::LedgerError;

pub const DEFAULT_DAY_BOUNDARY_HOUR: u8 = 4;
pub const DEFAULT_CHECK_ANCHOR_OFFSET_HOURS: u8 = 8;
pub const DEFAULT_MAX_WALK_DAYS: u32 = 3650;
pub const DEFAULT_KCAL_EPSILON: f64 = 0.1;

/// Tunables shared by the day resolver, the recalculation walk, and period math.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Hour of local time at which a new virtual day begins.
    pub day_boundary_hour: u8,
    /// Fixed offset of local time from UTC.
    pub utc_offset_minutes: i16,
    /// Hours after the virtual day start where check-in timestamps are anchored.
    pub check_anchor_offset_hours: u8,
    /// Upper bound on days visited by one recalculation walk.
    pub max_walk_days: u32,
    /// Stored and recomputed kcal closer than this are treated as equal.
    pub kcal_epsilon: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            day_boundary_hour: DEFAULT_DAY_BOUNDARY_HOUR,
            utc_offset_minutes: 0,
            check_anchor_offset_hours: DEFAULT_CHECK_ANCHOR_OFFSET_HOURS,
            max_walk_days: DEFAULT_MAX_WALK_DAYS,
            kcal_epsilon: DEFAULT_KCAL_EPSILON,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON config document; missing fields take their defaults.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for malformed JSON, unknown fields, or
    /// out-of-range values.
    pub fn from_json(raw: &str) -> Result<Self, LedgerError> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|err| LedgerError::Validation(format!("invalid engine config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON config file.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, LedgerError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            LedgerError::Validation(format!("failed to read engine config {}: {err}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    /// # Errors
    /// Returns [`LedgerError::Validation`] when a field is out of range.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.day_boundary_hour > 23 {
            return Err(LedgerError::Validation("day_boundary_hour MUST be in [0, 23]".to_string()));
        }
        if self.check_anchor_offset_hours > 23 {
            return Err(LedgerError::Validation(
                "check_anchor_offset_hours MUST be in [0, 23]".to_string(),
            ));
        }
        if !(-18 * 60..=18 * 60).contains(&self.utc_offset_minutes) {
            return Err(LedgerError::Validation(
                "utc_offset_minutes MUST be within +/-18 hours".to_string(),
            ));
        }
        if self.max_walk_days == 0 {
            return Err(LedgerError::Validation("max_walk_days MUST be >= 1".to_string()));
        }
        if !(self.kcal_epsilon.is_finite() && self.kcal_epsilon >= 0.0) {
            return Err(LedgerError::Validation("kcal_epsilon MUST be >= 0".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults_for_missing_fields() {
        let config = match EngineConfig::from_json(r#"{"utc_offset_minutes": 540}"#) {
            Ok(config) => config,
            Err(err) => panic!("config should parse: {err}"),
        };
        assert_eq!(config.utc_offset_minutes, 540);
        assert_eq!(config.day_boundary_hour, DEFAULT_DAY_BOUNDARY_HOUR);
        assert_eq!(config.max_walk_days, DEFAULT_MAX_WALK_DAYS);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(matches!(
            EngineConfig::from_json(r#"{"day_boundry_hour": 5}"#),
            Err(LedgerError::Validation(_))
        ));
    }

    #[test]
    fn out_of_range_boundary_is_rejected() {
        let err = match EngineConfig::from_json(r#"{"day_boundary_hour": 24}"#) {
            Ok(_) => panic!("boundary hour 24 should be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("day_boundary_hour"));
    }

    #[test]
    fn missing_file_is_a_validation_error() {
        let path = std::env::temp_dir().join("tally-config-does-not-exist.json");
        assert!(matches!(EngineConfig::load(&path), Err(LedgerError::Validation(_))));
    }
}
