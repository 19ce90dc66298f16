//! Period boundaries, rollover decisions, and archive snapshot math.
//!
//! Everything here is pure. The store applies the decisions inside its transactions.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    day_start_ms, kcal_total, virtual_date, ArchiveId, EngineConfig, LedgerError, LogEntry, LogId,
    PeriodArchive, PeriodMode, PeriodSettings,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RolloverDecision {
    Unchanged,
    /// Seal `[current_start_ms, next_start_ms)` and move the period start forward.
    Archive { current_start_ms: i64, next_start_ms: i64, mode: PeriodMode },
    /// A custom period is over; nothing is archived and the start does not move.
    PeriodEnded { end_ms: i64 },
}

/// Start of the period containing `now_ms`, for modes with calendar boundaries.
///
/// # Errors
/// Returns [`LedgerError::Time`] when `now_ms` cannot be mapped to a virtual day.
pub fn boundary_for(
    mode: PeriodMode,
    now_ms: i64,
    config: &EngineConfig,
) -> Result<Option<i64>, LedgerError> {
    let today = virtual_date(now_ms, config)?;
    let start_day = match mode {
        PeriodMode::Weekly => today.week_start(),
        PeriodMode::Monthly => today.month_start(),
        PeriodMode::Custom | PeriodMode::Permanent => return Ok(None),
    };
    Ok(Some(day_start_ms(start_day, config)))
}

/// # Errors
/// Returns [`LedgerError::Time`] when `now_ms` cannot be mapped to a virtual day.
pub fn decide_rollover(
    settings: &PeriodSettings,
    now_ms: i64,
    config: &EngineConfig,
) -> Result<RolloverDecision, LedgerError> {
    match settings.mode {
        PeriodMode::Weekly | PeriodMode::Monthly => {
            let Some(boundary) = boundary_for(settings.mode, now_ms, config)? else {
                return Ok(RolloverDecision::Unchanged);
            };
            // A start later than the boundary means the clock went backwards.
            if settings.period_start_ms >= boundary {
                return Ok(RolloverDecision::Unchanged);
            }
            Ok(RolloverDecision::Archive {
                current_start_ms: settings.period_start_ms,
                next_start_ms: boundary,
                mode: settings.mode,
            })
        }
        PeriodMode::Custom => match settings.custom_end_ms {
            Some(end_ms) if end_ms < now_ms => Ok(RolloverDecision::PeriodEnded { end_ms }),
            _ => Ok(RolloverDecision::Unchanged),
        },
        PeriodMode::Permanent => Ok(RolloverDecision::Unchanged),
    }
}

/// Settings after switching to `mode` at `now_ms`.
///
/// `custom_range` is required for [`PeriodMode::Custom`] and ignored otherwise.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when a custom range is missing or inverted.
pub fn settings_for_mode(
    mode: PeriodMode,
    now_ms: i64,
    custom_range: Option<(i64, i64)>,
    config: &EngineConfig,
) -> Result<PeriodSettings, LedgerError> {
    match mode {
        PeriodMode::Weekly | PeriodMode::Monthly => {
            let start = boundary_for(mode, now_ms, config)?.unwrap_or(0);
            Ok(PeriodSettings { mode, period_start_ms: start, custom_end_ms: None })
        }
        PeriodMode::Custom => {
            let Some((start_ms, end_ms)) = custom_range else {
                return Err(LedgerError::Validation(
                    "custom period requires start and end".to_string(),
                ));
            };
            if end_ms < start_ms {
                return Err(LedgerError::Validation(
                    "custom period end MUST NOT precede its start".to_string(),
                ));
            }
            Ok(PeriodSettings { mode, period_start_ms: start_ms, custom_end_ms: Some(end_ms) })
        }
        PeriodMode::Permanent => Ok(PeriodSettings::default()),
    }
}

fn sorted_within(archive_start_ms: i64, archive_end_ms: i64, logs: &[LogEntry]) -> Vec<LogEntry> {
    let mut within = logs
        .iter()
        .filter(|log| (archive_start_ms..=archive_end_ms).contains(&log.timestamp_ms))
        .cloned()
        .collect::<Vec<_>>();
    within.sort_by(|lhs, rhs| lhs.timestamp_ms.cmp(&rhs.timestamp_ms).then_with(|| lhs.id.cmp(&rhs.id)));
    within
}

/// New archive sealing the live logs in `[current_start_ms, next_start_ms)`.
///
/// Returns `None` when the period holds no logs.
#[must_use]
pub fn seal_archive(
    current_start_ms: i64,
    next_start_ms: i64,
    mode: PeriodMode,
    live_logs: &[LogEntry],
    now: OffsetDateTime,
) -> Option<PeriodArchive> {
    let end_date_ms = next_start_ms - 1;
    let logs = sorted_within(current_start_ms, end_date_ms, live_logs);
    if logs.is_empty() {
        return None;
    }
    Some(PeriodArchive {
        id: ArchiveId::new(),
        start_date_ms: current_start_ms,
        end_date_ms,
        mode,
        total_balance: kcal_total(&logs),
        logs,
        created_at: now,
        updated_at: now,
    })
}

/// Archive with its snapshot and total recomputed from live logs, plus whether the
/// recomputed snapshot differs from the stored one.
///
/// The result is always meant to be persisted. `updated_at` moves only on a real change,
/// so refreshing an unchanged archive rewrites identical data.
#[must_use]
pub fn refresh_archive(
    archive: &PeriodArchive,
    live_logs: &[LogEntry],
    now: OffsetDateTime,
) -> (PeriodArchive, bool) {
    let logs = sorted_within(archive.start_date_ms, archive.end_date_ms, live_logs);
    let total_balance = kcal_total(&logs);
    let changed = !same_entries(&archive.logs, &logs)
        || (total_balance - archive.total_balance).abs() >= 1e-9;
    let updated_at = if changed { now } else { archive.updated_at };
    (PeriodArchive { logs, total_balance, updated_at, ..archive.clone() }, changed)
}

// Snapshot kcal has been through JSON; every other field must match exactly.
fn same_entries(stored: &[LogEntry], fresh: &[LogEntry]) -> bool {
    stored.len() == fresh.len()
        && stored.iter().zip(fresh).all(|(lhs, rhs)| {
            let kcal_matches = match (lhs.kcal, rhs.kcal) {
                (Some(a), Some(b)) => (a - b).abs() < 1e-9,
                (None, None) => true,
                _ => false,
            };
            kcal_matches && LogEntry { kcal: rhs.kcal, ..lhs.clone() } == *rhs
        })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestorePlan {
    /// Archived logs missing from the live ledger, in archive order.
    pub reinsert: Vec<LogEntry>,
    pub archive_ids: Vec<ArchiveId>,
    /// Archived logs left out because they are live or appeared in an earlier archive.
    pub skipped: usize,
}

/// Plan the return to permanent mode: every archived log ends up live exactly once.
#[must_use]
pub fn restore_plan(archives: &[PeriodArchive], live_ids: &BTreeSet<LogId>) -> RestorePlan {
    let mut ordered = archives.iter().collect::<Vec<_>>();
    ordered.sort_by_key(|archive| archive.start_date_ms);

    let mut plan = RestorePlan::default();
    let mut seen = live_ids.clone();
    for archive in ordered {
        plan.archive_ids.push(archive.id);
        for log in &archive.logs {
            if seen.insert(log.id) {
                plan.reinsert.push(log.clone());
            } else {
                plan.skipped += 1;
            }
        }
    }
    plan
}
