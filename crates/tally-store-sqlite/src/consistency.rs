//! Transactional recalculation, period rollover, and archive restore.
//!
//! Logs, checks, and archives form one consistency domain: every operation here reads
//! and writes them inside a single `BEGIN IMMEDIATE` transaction, so a failure anywhere
//! leaves all three exactly as they were.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tally_core::{
    decide_rollover, plan_recalculation, refresh_archive, restore_plan, seal_archive, ArchiveId,
    BonusOracle, DayKey, EngineConfig, LedgerError, LogDetail, LogEntry, LogId, PeriodMode,
    PeriodSettings, Profile, RolloverDecision,
};
use time::OffsetDateTime;

use crate::{
    archive_exists_with_start, insert_archive_row, insert_log_row, load_archives, load_checks,
    load_log_ids, load_logs, load_period_settings, save_setting, update_archive_snapshot,
    update_log_row, LedgerWriter, SqliteStore, PERIOD_SETTINGS_KEY,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecalcReport {
    pub start_day: DayKey,
    pub end_day: DayKey,
    pub days_walked: u32,
    pub capped: bool,
    pub rewritten_logs: usize,
    /// Archives reaching the changed instant; every one is rewritten.
    pub refreshed_archives: usize,
    /// Refreshed archives whose snapshot or total actually differed.
    pub changed_archives: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveOutcome {
    /// Set when this call sealed a new archive.
    pub archive_id: Option<ArchiveId>,
    pub archived_logs: usize,
    /// An archive for this period start already existed, so nothing was sealed.
    pub already_archived: bool,
    pub period_start_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RolloverOutcome {
    RolledOver { previous_start_ms: i64, archive: ArchiveOutcome },
    PeriodEnded { end_ms: i64 },
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    pub restored_logs: usize,
    pub skipped_logs: usize,
    pub cleared_archives: usize,
    pub earliest_restored_ms: Option<i64>,
}

impl SqliteStore {
    /// Bring streak credits, memos, and archive snapshots up to date from `changed_ms`
    /// through `now_ms`.
    ///
    /// # Errors
    /// Returns an error when any read, plan, or write fails; nothing is persisted then.
    pub fn recalculate<O: BonusOracle + ?Sized>(
        &mut self,
        changed_ms: i64,
        now_ms: i64,
        profile: &Profile,
        oracle: &O,
        config: &EngineConfig,
    ) -> Result<RecalcReport> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start recalculation transaction")?;
        let report = recalculate_in(&tx, changed_ms, now_ms, profile, oracle, config)?;
        tx.commit().context("failed to commit recalculation")?;

        trace_report(&report, config);
        Ok(report)
    }

    /// Run `mutation` and the recalculation it triggers in one transaction.
    ///
    /// `mutation` returns its own result plus the instant the walk starts from. The stored
    /// profile is read inside the same transaction. When either step fails, neither the
    /// mutation nor any rewrite is persisted, so the caller can retry the whole call.
    ///
    /// # Errors
    /// Returns the mutation's error, or an error when the recalculation or commit fails.
    pub fn apply_and_recalculate<T, O, F>(
        &mut self,
        now_ms: i64,
        oracle: &O,
        config: &EngineConfig,
        mutation: F,
    ) -> Result<(T, RecalcReport)>
    where
        O: BonusOracle + ?Sized,
        F: FnOnce(&LedgerWriter<'_>) -> Result<(T, i64)>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start mutation transaction")?;

        let writer = LedgerWriter::new(&tx, config);
        let (value, changed_ms) = mutation(&writer)?;
        let profile = writer.profile()?;
        let report = recalculate_in(&tx, changed_ms, now_ms, &profile, oracle, config)?;
        tx.commit().context("failed to commit mutation")?;

        trace_report(&report, config);
        Ok((value, report))
    }

    /// Archive the finished period when the calendar has moved past it.
    ///
    /// # Errors
    /// Returns an error when settings cannot be read or archiving fails.
    pub fn check_rollover(&mut self, now_ms: i64, config: &EngineConfig) -> Result<RolloverOutcome> {
        let settings = self.period_settings()?;
        match decide_rollover(&settings, now_ms, config)? {
            RolloverDecision::Unchanged => Ok(RolloverOutcome::Unchanged),
            RolloverDecision::PeriodEnded { end_ms } => {
                tracing::info!(end_ms, "custom period has ended");
                Ok(RolloverOutcome::PeriodEnded { end_ms })
            }
            RolloverDecision::Archive { current_start_ms, next_start_ms, mode } => {
                let archive = self.archive_and_reset(current_start_ms, next_start_ms, mode)?;
                tracing::info!(
                    mode = mode.as_str(),
                    previous_start_ms = current_start_ms,
                    next_start_ms,
                    "rolled over period"
                );
                Ok(RolloverOutcome::RolledOver { previous_start_ms: current_start_ms, archive })
            }
        }
    }

    /// Seal `[current_start_ms, next_start_ms)` into an archive and advance the period start.
    ///
    /// Live logs are kept. Calling again with the same arguments changes nothing.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for an empty range, or an error when any write
    /// fails.
    pub fn archive_and_reset(
        &mut self,
        current_start_ms: i64,
        next_start_ms: i64,
        mode: PeriodMode,
    ) -> Result<ArchiveOutcome> {
        if next_start_ms <= current_start_ms {
            return Err(anyhow::Error::new(LedgerError::Validation(format!(
                "next period start {next_start_ms} MUST be after current start {current_start_ms}"
            ))));
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start archive transaction")?;

        let already_archived = archive_exists_with_start(&tx, current_start_ms)?;
        let mut archive_id = None;
        let mut archived_logs = 0;
        if !already_archived {
            let logs = load_logs(&tx, Some(current_start_ms), Some(next_start_ms - 1))?;
            let sealed =
                seal_archive(current_start_ms, next_start_ms, mode, &logs, OffsetDateTime::now_utc());
            if let Some(archive) = sealed {
                insert_archive_row(&tx, &archive)?;
                archived_logs = archive.logs.len();
                archive_id = Some(archive.id);
            }
        }

        let mut settings = load_period_settings(&tx)?;
        if settings.period_start_ms != next_start_ms {
            settings.period_start_ms = next_start_ms;
            save_setting(&tx, PERIOD_SETTINGS_KEY, &settings)?;
        }

        tx.commit().context("failed to commit archive transaction")?;

        if let Some(id) = archive_id {
            tracing::info!(
                archive_id = %id,
                archived_logs,
                current_start_ms,
                next_start_ms,
                "sealed period archive"
            );
        }
        Ok(ArchiveOutcome { archive_id, archived_logs, already_archived, period_start_ms: next_start_ms })
    }

    /// Return every archived log to the live ledger, drop all archives, and switch to
    /// permanent mode.
    ///
    /// # Errors
    /// Returns an error when any read or write fails; nothing is persisted then.
    pub fn switch_to_permanent(&mut self) -> Result<RestoreReport> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start restore transaction")?;

        let archives = load_archives(&tx, None)?;
        let live_ids = load_log_ids(&tx)?.into_iter().collect::<BTreeSet<_>>();
        let plan = restore_plan(&archives, &live_ids);

        for log in &plan.reinsert {
            insert_log_row(&tx, log)?;
        }
        tx.execute("DELETE FROM archives", []).context("failed to clear archives")?;
        save_setting(&tx, PERIOD_SETTINGS_KEY, &PeriodSettings::default())?;

        tx.commit().context("failed to commit restore transaction")?;

        let report = RestoreReport {
            restored_logs: plan.reinsert.len(),
            skipped_logs: plan.skipped,
            cleared_archives: plan.archive_ids.len(),
            earliest_restored_ms: plan.reinsert.iter().map(|log| log.timestamp_ms).min(),
        };
        tracing::info!(
            restored_logs = report.restored_logs,
            skipped_logs = report.skipped_logs,
            cleared_archives = report.cleared_archives,
            "restored archives into permanent ledger"
        );
        Ok(report)
    }

    /// Delete check-ins that lose duplicate resolution, for one day or the whole ledger.
    /// Returns the number of rows removed.
    ///
    /// # Errors
    /// Returns an error when any read or delete fails.
    pub fn collapse_duplicate_checks(
        &mut self,
        day: Option<DayKey>,
        config: &EngineConfig,
    ) -> Result<usize> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start duplicate cleanup transaction")?;
        let removed = LedgerWriter::new(&tx, config).collapse_duplicate_checks(day)?;
        tx.commit().context("failed to commit duplicate cleanup")?;

        if removed > 0 {
            tracing::info!(removed, "collapsed duplicate check-ins");
        }
        Ok(removed)
    }
}

fn recalculate_in<O: BonusOracle + ?Sized>(
    conn: &Connection,
    changed_ms: i64,
    now_ms: i64,
    profile: &Profile,
    oracle: &O,
    config: &EngineConfig,
) -> Result<RecalcReport> {
    let logs = load_logs(conn, None, None)?;
    let checks = load_checks(conn, None, None)?;
    let plan = plan_recalculation(&logs, &checks, changed_ms, now_ms, profile, oracle, config)?;

    let now = OffsetDateTime::now_utc();
    let mut live: BTreeMap<LogId, LogEntry> = logs.into_iter().map(|log| (log.id, log)).collect();
    for rewrite in &plan.rewrites {
        let Some(log) = live.get_mut(&rewrite.log_id) else {
            return Err(anyhow::Error::new(LedgerError::NotFound {
                kind: "log",
                id: rewrite.log_id.to_string(),
            }));
        };
        log.kcal = Some(rewrite.kcal);
        if let LogDetail::Exercise(exercise) = &mut log.detail {
            exercise.memo.clone_from(&rewrite.memo);
        }
        log.updated_at = now;
        update_log_row(conn, log)?;
    }

    // Every archive reaching the change is rewritten; only real changes move `updated_at`.
    let live = live.into_values().collect::<Vec<_>>();
    let mut refreshed_archives = 0;
    let mut changed_archives = 0;
    for archive in load_archives(conn, Some(changed_ms))? {
        let (refreshed, changed) = refresh_archive(&archive, &live, now);
        update_archive_snapshot(conn, &refreshed)?;
        refreshed_archives += 1;
        if changed {
            changed_archives += 1;
        }
    }

    Ok(RecalcReport {
        start_day: plan.start_day,
        end_day: plan.end_day,
        days_walked: plan.days_walked,
        capped: plan.capped,
        rewritten_logs: plan.rewrites.len(),
        refreshed_archives,
        changed_archives,
    })
}

fn trace_report(report: &RecalcReport, config: &EngineConfig) {
    if report.capped {
        tracing::warn!(
            start_day = %report.start_day,
            end_day = %report.end_day,
            max_walk_days = config.max_walk_days,
            "recalculation walk hit its day cap"
        );
    }
    tracing::debug!(
        start_day = %report.start_day,
        days_walked = report.days_walked,
        rewritten_logs = report.rewritten_logs,
        refreshed_archives = report.refreshed_archives,
        changed_archives = report.changed_archives,
        "recalculated ledger"
    );
}
