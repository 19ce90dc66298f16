use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::checks::resolve_checks;
use crate::{
    virtual_date, BonusOracle, CheckEntry, DayKey, EngineConfig, LedgerError, LogDetail, LogEntry,
    Profile,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DayAggregate {
    pub has_debit_event: bool,
    pub has_credit_event: bool,
    pub balance: f64,
}

impl DayAggregate {
    fn fold(&mut self, kcal: f64) {
        if kcal < 0.0 {
            self.has_debit_event = true;
        } else if kcal > 0.0 {
            self.has_credit_event = true;
        }
        self.balance += kcal;
    }
}

/// Per-day view of the whole ledger, built by one linear scan.
///
/// Owned by a single recalculation; the walk adjusts `days[..].balance` in place as it
/// rewrites entries so later days observe the corrected running balance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerSnapshot {
    pub days: BTreeMap<DayKey, DayAggregate>,
    pub dry_days: BTreeMap<DayKey, bool>,
    pub exercise_logs_by_day: BTreeMap<DayKey, Vec<LogEntry>>,
    pub anchor: Option<DayKey>,
}

impl LedgerSnapshot {
    /// Fold every log and check into its virtual day.
    ///
    /// # Errors
    /// Returns [`LedgerError::Time`] when an entry timestamp cannot be mapped to a day.
    pub fn build<O: BonusOracle + ?Sized>(
        logs: &[LogEntry],
        checks: &[CheckEntry],
        profile: &Profile,
        oracle: &O,
        config: &EngineConfig,
    ) -> Result<Self, LedgerError> {
        let mut snapshot = Self::default();
        let mut earliest_ms: Option<i64> = None;

        for log in logs {
            let day = virtual_date(log.timestamp_ms, config)?;
            earliest_ms = Some(earliest_ms.map_or(log.timestamp_ms, |ms| ms.min(log.timestamp_ms)));

            let kcal = match log.kcal {
                Some(kcal) => kcal,
                None => fallback_kcal(log, profile, oracle),
            };
            snapshot.days.entry(day).or_default().fold(kcal);

            match &log.detail {
                LogDetail::Exercise(_) => {
                    snapshot.exercise_logs_by_day.entry(day).or_default().push(log.clone());
                }
                LogDetail::Beer(_) => {}
            }
        }

        for check in resolve_checks(checks, config)? {
            let day = virtual_date(check.timestamp_ms, config)?;
            earliest_ms =
                Some(earliest_ms.map_or(check.timestamp_ms, |ms| ms.min(check.timestamp_ms)));
            snapshot.dry_days.insert(day, check.is_dry_day);
        }

        for entries in snapshot.exercise_logs_by_day.values_mut() {
            entries.sort_by(|lhs, rhs| {
                lhs.timestamp_ms.cmp(&rhs.timestamp_ms).then_with(|| lhs.id.cmp(&rhs.id))
            });
        }

        snapshot.anchor = earliest_ms.map(|ms| virtual_date(ms, config)).transpose()?;
        Ok(snapshot)
    }

    #[must_use]
    pub fn balance_between(&self, from: DayKey, to: DayKey) -> f64 {
        self.days.range(from..=to).map(|(_, aggregate)| aggregate.balance).sum()
    }
}

/// Kcal for an entry that was stored without a computed value.
pub fn fallback_kcal<O: BonusOracle + ?Sized>(log: &LogEntry, profile: &Profile, oracle: &O) -> f64 {
    match &log.detail {
        LogDetail::Beer(beer) => {
            oracle.beer_debit(beer.volume_ml, beer.abv_percent, beer.carb_factor, beer.count)
        }
        LogDetail::Exercise(exercise) => oracle.exercise_burn(
            oracle.metabolic_factor(&exercise.exercise_key),
            exercise.minutes,
            profile,
        ),
    }
}
