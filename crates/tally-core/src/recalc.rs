//! Forward walk that recomputes streak-dependent exercise credits.
//!
//! The walk is pure: it reads a freshly built [`LedgerSnapshot`] and returns the rewrites
//! to persist. The store runs it inside the same transaction that applies the rewrites
//! and refreshes archives.

use serde::{Deserialize, Serialize};

use crate::snapshot::LedgerSnapshot;
use crate::{
    virtual_date, BonusOracle, CheckEntry, DayKey, EngineConfig, LedgerError, LogDetail, LogEntry,
    LogId, Profile,
};

pub const BONUS_MARKER_PREFIX: &str = "[streak bonus x";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExerciseRewrite {
    pub log_id: LogId,
    pub day: DayKey,
    pub streak: u32,
    pub previous_kcal: Option<f64>,
    pub kcal: f64,
    pub bonus_multiplier: f64,
    pub memo: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecalcPlan {
    pub start_day: DayKey,
    pub end_day: DayKey,
    pub days_walked: u32,
    /// The walk stopped at `max_walk_days` before reaching `end_day`.
    pub capped: bool,
    pub rewrites: Vec<ExerciseRewrite>,
}

/// Walk virtual days from the day of `changed_ms` through the day of `now_ms` and
/// collect every exercise entry whose stored credit or memo is stale.
///
/// Days before the changed day are never visited. Beer entries are never rewritten.
///
/// # Errors
/// Returns [`LedgerError::Time`] when a timestamp cannot be mapped to a virtual day.
pub fn plan_recalculation<O: BonusOracle + ?Sized>(
    logs: &[LogEntry],
    checks: &[CheckEntry],
    changed_ms: i64,
    now_ms: i64,
    profile: &Profile,
    oracle: &O,
    config: &EngineConfig,
) -> Result<RecalcPlan, LedgerError> {
    let mut snapshot = LedgerSnapshot::build(logs, checks, profile, oracle, config)?;
    let start_day = virtual_date(changed_ms, config)?;
    let end_day = virtual_date(now_ms, config)?;

    let mut rewrites = Vec::new();
    let mut days_walked = 0_u32;
    let mut capped = false;
    let mut cursor = Some(start_day);

    while let Some(current) = cursor {
        if current > end_day {
            break;
        }
        if days_walked >= config.max_walk_days {
            capped = true;
            break;
        }
        days_walked += 1;

        let streak =
            oracle.streak_length(&snapshot.days, &snapshot.dry_days, snapshot.anchor, current);

        if let Some(entries) = snapshot.exercise_logs_by_day.get(&current) {
            for log in entries {
                let exercise = match &log.detail {
                    LogDetail::Exercise(exercise) => exercise,
                    LogDetail::Beer(_) => continue,
                };

                let base_kcal = oracle.exercise_burn(
                    oracle.metabolic_factor(&exercise.exercise_key),
                    exercise.minutes,
                    profile,
                );
                let credit = oracle.exercise_credit(base_kcal, streak);
                let memo = regenerate_memo(&exercise.memo, credit.bonus_multiplier);

                let kcal_stale = match log.kcal {
                    Some(stored) => (stored - credit.kcal).abs() > config.kcal_epsilon,
                    None => true,
                };
                if !kcal_stale && memo == exercise.memo {
                    continue;
                }

                // Uncomputed entries were folded in with their base burn.
                let counted = log.kcal.unwrap_or(base_kcal);
                snapshot.days.entry(current).or_default().balance += credit.kcal - counted;

                rewrites.push(ExerciseRewrite {
                    log_id: log.id,
                    day: current,
                    streak,
                    previous_kcal: log.kcal,
                    kcal: credit.kcal,
                    bonus_multiplier: credit.bonus_multiplier,
                    memo,
                });
            }
        }

        cursor = current.next();
    }

    Ok(RecalcPlan { start_day, end_day, days_walked, capped, rewrites })
}

/// Remove every bonus marker from `memo`, together with the space that introduced it.
#[must_use]
pub fn strip_bonus_markers(memo: &str) -> String {
    let mut stripped = String::with_capacity(memo.len());
    let mut rest = memo;

    while let Some(start) = rest.find(BONUS_MARKER_PREFIX) {
        let after_prefix = &rest[start + BONUS_MARKER_PREFIX.len()..];
        let Some(close) = after_prefix.find(']') else {
            break;
        };
        let before = &rest[..start];
        stripped.push_str(before.strip_suffix(' ').unwrap_or(before));
        rest = &after_prefix[close + 1..];
    }

    stripped.push_str(rest);
    stripped
}

/// Memo text with exactly one marker for `bonus_multiplier`, or none when it is 1.0.
#[must_use]
pub fn regenerate_memo(memo: &str, bonus_multiplier: f64) -> String {
    let base = strip_bonus_markers(memo);
    if bonus_multiplier <= 1.0 {
        return base;
    }

    let marker = format!("{BONUS_MARKER_PREFIX}{}]", format_multiplier(bonus_multiplier));
    if base.is_empty() {
        marker
    } else {
        format!("{base} {marker}")
    }
}

fn format_multiplier(value: f64) -> String {
    let fixed = format!("{value:.2}");
    let trimmed = fixed.trim_end_matches('0');
    if trimmed.ends_with('.') {
        format!("{trimmed}0")
    } else {
        trimmed.to_string()
    }
}
