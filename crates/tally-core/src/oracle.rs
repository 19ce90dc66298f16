//! Streak and bonus rules consulted by the recalculation walk.
//!
//! The walk only depends on the [`BonusOracle`] signatures. [`StandardOracle`] is the
//! rule set shipped with the diary; tests and embedders can supply their own.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::snapshot::DayAggregate;
use crate::{DayKey, Profile};

/// Metabolic equivalents for known exercise categories.
const METABOLIC_FACTORS: &[(&str, f64)] = &[
    ("walking", 3.5),
    ("brisk_walking", 4.3),
    ("running", 8.0),
    ("cycling", 6.8),
    ("swimming", 7.0),
    ("strength", 5.0),
    ("yoga", 2.5),
    ("hiking", 6.0),
    ("stretching", 2.3),
];

pub const DEFAULT_METABOLIC_FACTOR: f64 = 3.5;

/// Never look further back than this many days when measuring a streak.
const MAX_STREAK_LOOKBACK_DAYS: u32 = 3650;

const ETHANOL_DENSITY_G_PER_ML: f64 = 0.789;
const KCAL_PER_GRAM_ETHANOL: f64 = 7.0;
const KCAL_PER_GRAM_CARB: f64 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExerciseCredit {
    pub kcal: f64,
    pub bonus_multiplier: f64,
}

pub trait BonusOracle {
    /// Length of the qualifying-day streak that applies on `target`.
    fn streak_length(
        &self,
        days: &BTreeMap<DayKey, DayAggregate>,
        dry_days: &BTreeMap<DayKey, bool>,
        anchor: Option<DayKey>,
        target: DayKey,
    ) -> u32;

    /// Bonus-adjusted credit for an exercise; the multiplier is never below 1.0.
    fn exercise_credit(&self, base_kcal: f64, streak: u32) -> ExerciseCredit;

    /// Base (streak-independent) burn for an exercise session.
    fn exercise_burn(&self, metabolic_factor: f64, minutes: f64, profile: &Profile) -> f64;

    /// Signed (negative) kcal for a beer entry.
    fn beer_debit(&self, volume_ml: f64, abv_percent: f64, carb_factor: f64, count: u32) -> f64;

    fn metabolic_factor(&self, exercise_key: &str) -> f64 {
        catalog_metabolic_factor(exercise_key).unwrap_or(DEFAULT_METABOLIC_FACTOR)
    }
}

#[must_use]
pub fn catalog_metabolic_factor(exercise_key: &str) -> Option<f64> {
    METABOLIC_FACTORS.iter().find(|(key, _)| *key == exercise_key).map(|(_, factor)| *factor)
}

/// Shipped rule set.
///
/// A day qualifies when its check-in marks it dry and it holds no debit event. The streak
/// applied on a day counts the consecutive qualifying days immediately before it, never
/// reaching past the anchor. Multipliers: 1.2 from one day, 1.5 from three, 2.0 from seven.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardOracle;

impl StandardOracle {
    fn qualifies(
        days: &BTreeMap<DayKey, DayAggregate>,
        dry_days: &BTreeMap<DayKey, bool>,
        day: DayKey,
    ) -> bool {
        let dry = dry_days.get(&day).copied().unwrap_or(false);
        let debit = days.get(&day).is_some_and(|aggregate| aggregate.has_debit_event);
        dry && !debit
    }

    #[must_use]
    pub fn multiplier_for(streak: u32) -> f64 {
        match streak {
            0 => 1.0,
            1..=2 => 1.2,
            3..=6 => 1.5,
            _ => 2.0,
        }
    }
}

impl BonusOracle for StandardOracle {
    fn streak_length(
        &self,
        days: &BTreeMap<DayKey, DayAggregate>,
        dry_days: &BTreeMap<DayKey, bool>,
        anchor: Option<DayKey>,
        target: DayKey,
    ) -> u32 {
        let Some(anchor) = anchor else {
            return 0;
        };

        let mut streak = 0;
        let mut cursor = target.previous();
        while let Some(day) = cursor {
            if day < anchor || streak >= MAX_STREAK_LOOKBACK_DAYS {
                break;
            }
            if !Self::qualifies(days, dry_days, day) {
                break;
            }
            streak += 1;
            cursor = day.previous();
        }
        streak
    }

    fn exercise_credit(&self, base_kcal: f64, streak: u32) -> ExerciseCredit {
        let bonus_multiplier = Self::multiplier_for(streak);
        ExerciseCredit { kcal: round_tenth(base_kcal * bonus_multiplier), bonus_multiplier }
    }

    fn exercise_burn(&self, metabolic_factor: f64, minutes: f64, profile: &Profile) -> f64 {
        // kcal/min = MET * 3.5 * kg / 200
        round_tenth(metabolic_factor * 3.5 * profile.weight_kg / 200.0 * minutes)
    }

    fn beer_debit(&self, volume_ml: f64, abv_percent: f64, carb_factor: f64, count: u32) -> f64 {
        let ethanol_g = volume_ml * abv_percent / 100.0 * ETHANOL_DENSITY_G_PER_ML;
        let carb_g = volume_ml / 100.0 * carb_factor;
        let per_serving = ethanol_g * KCAL_PER_GRAM_ETHANOL + carb_g * KCAL_PER_GRAM_CARB;
        -round_tenth(per_serving * f64::from(count))
    }
}

fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(raw: &str) -> DayKey {
        match DayKey::parse(raw) {
            Ok(day) => day,
            Err(err) => panic!("invalid fixture day {raw}: {err}"),
        }
    }

    fn dry(days: &[&str]) -> BTreeMap<DayKey, bool> {
        days.iter().map(|raw| (day(raw), true)).collect()
    }

    #[test]
    fn streak_counts_qualifying_days_before_target() {
        let oracle = StandardOracle;
        let aggregates = BTreeMap::new();
        let dry_days = dry(&["2023-11-13", "2023-11-14", "2023-11-15"]);

        let streak = oracle.streak_length(
            &aggregates,
            &dry_days,
            Some(day("2023-11-13")),
            day("2023-11-16"),
        );
        assert_eq!(streak, 3);
    }

    #[test]
    fn streak_stops_at_anchor_and_on_debit_days() {
        let oracle = StandardOracle;
        let mut aggregates = BTreeMap::new();
        aggregates.insert(
            day("2023-11-14"),
            DayAggregate { has_debit_event: true, has_credit_event: false, balance: -140.0 },
        );
        let dry_days = dry(&["2023-11-12", "2023-11-13", "2023-11-14", "2023-11-15"]);

        assert_eq!(
            oracle.streak_length(&aggregates, &dry_days, Some(day("2023-11-13")), day("2023-11-16")),
            1
        );
        assert_eq!(
            oracle.streak_length(&aggregates, &dry_days, Some(day("2023-11-13")), day("2023-11-14")),
            1
        );
        assert_eq!(
            oracle.streak_length(&aggregates, &dry_days, Some(day("2023-11-14")), day("2023-11-14")),
            0
        );
        assert_eq!(oracle.streak_length(&aggregates, &dry_days, None, day("2023-11-16")), 0);
    }

    #[test]
    fn credit_multiplier_tiers_never_drop_below_one() {
        let oracle = StandardOracle;
        let plain = oracle.exercise_credit(100.0, 0);
        assert!((plain.bonus_multiplier - 1.0).abs() < f64::EPSILON);
        assert!((plain.kcal - 100.0).abs() < f64::EPSILON);

        let bonus = oracle.exercise_credit(100.0, 1);
        assert!((bonus.bonus_multiplier - 1.2).abs() < f64::EPSILON);
        assert!((bonus.kcal - 120.0).abs() < 1e-9);

        assert!((oracle.exercise_credit(100.0, 7).kcal - 200.0).abs() < 1e-9);
    }

    #[test]
    fn beer_debit_is_negative_and_scales_with_count() {
        let oracle = StandardOracle;
        let one = oracle.beer_debit(350.0, 5.0, 3.0, 1);
        let two = oracle.beer_debit(350.0, 5.0, 3.0, 2);
        assert!(one < 0.0);
        // 350ml * 5% * 0.789 * 7 + 3.5 * 3 * 4 = 96.65 + 42
        assert!((one - (-138.7)).abs() < 1e-9);
        assert!((two - 2.0 * one).abs() < 0.2);
    }

    #[test]
    fn exercise_burn_uses_catalog_and_profile_weight() {
        let oracle = StandardOracle;
        let profile = Profile { weight_kg: 70.0, ..Profile::default() };
        let factor = oracle.metabolic_factor("running");
        assert!((factor - 8.0).abs() < f64::EPSILON);
        // 8 * 3.5 * 70 / 200 * 30 = 294
        assert!((oracle.exercise_burn(factor, 30.0, &profile) - 294.0).abs() < 1e-9);
        assert!((oracle.metabolic_factor("unicycling") - DEFAULT_METABOLIC_FACTOR).abs() < 1e-9);
    }
}
