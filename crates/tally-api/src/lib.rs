use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tally_core::{
    day_anchor_ms, kcal_total, resolve_checks, settings_for_mode, virtual_date, BeerLog,
    BonusOracle, CheckEntry, CheckId, DayKey, EngineConfig, ExerciseLog, LedgerError,
    LedgerSnapshot, LogDetail, LogEntry, LogId, PeriodArchive, PeriodMode, PeriodSettings, Profile,
    StandardOracle, WellnessFlags,
};
use tally_store_sqlite::{
    ArchiveOutcome, IntegrityReport, LedgerWriter, RecalcReport, RestoreReport, RolloverOutcome,
    SchemaStatus, SqliteStore,
};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

const DEFAULT_CARB_FACTOR: f64 = 3.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

fn default_count() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AddBeerRequest {
    /// Defaults to now.
    #[serde(default)]
    pub timestamp_ms: Option<i64>,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub size_label: Option<String>,
    pub volume_ml: f64,
    pub abv_percent: f64,
    #[serde(default)]
    pub carb_factor: Option<f64>,
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default)]
    pub rating: Option<u8>,
    #[serde(default)]
    pub memo: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AddExerciseRequest {
    #[serde(default)]
    pub timestamp_ms: Option<i64>,
    pub exercise_key: String,
    pub minutes: f64,
    #[serde(default)]
    pub memo: String,
}

/// Partial update of a ledger entry; `None` leaves a field as it is.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpdateLogRequest {
    pub timestamp_ms: Option<i64>,
    pub memo: Option<String>,
    pub exercise_key: Option<String>,
    pub minutes: Option<f64>,
    pub volume_ml: Option<f64>,
    pub abv_percent: Option<f64>,
    pub carb_factor: Option<f64>,
    pub count: Option<u32>,
    pub rating: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SaveCheckRequest {
    pub day: DayKey,
    pub is_dry_day: bool,
    #[serde(default)]
    pub wellness: WellnessFlags,
    #[serde(default)]
    pub weight_kg: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveRequest {
    pub current_start_ms: i64,
    pub next_start_ms: i64,
    pub mode: PeriodMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetPeriodModeRequest {
    pub mode: PeriodMode,
    #[serde(default)]
    pub custom_start_ms: Option<i64>,
    #[serde(default)]
    pub custom_end_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogMutation {
    pub log: LogEntry,
    pub dry_checks_cleared: usize,
    pub recalc: RecalcReport,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeletedLog {
    pub log: LogEntry,
    pub recalc: RecalcReport,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckMutation {
    pub check: CheckEntry,
    pub collapsed_duplicates: usize,
    pub recalc: RecalcReport,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnsuredCheck {
    pub check: CheckEntry,
    pub created: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeletedCheck {
    pub check: CheckEntry,
    pub recalc: RecalcReport,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeriodModeResult {
    pub settings: PeriodSettings,
    pub restore: Option<RestoreReport>,
    pub recalc: Option<RecalcReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeriodSummary {
    pub settings: PeriodSettings,
    pub balance: f64,
    pub log_count: usize,
    /// A custom period whose end is already in the past.
    pub ended: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaySummary {
    pub day: DayKey,
    pub balance: f64,
    pub has_debit_event: bool,
    pub has_credit_event: bool,
    pub is_dry_day: Option<bool>,
    pub streak: u32,
}

fn system_now_ms() -> i64 {
    i64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

#[derive(Debug, Clone)]
pub struct TallyApi {
    db_path: PathBuf,
    config: EngineConfig,
    clock: fn() -> i64,
}

impl TallyApi {
    #[must_use]
    pub fn new(db_path: PathBuf, config: EngineConfig) -> Self {
        Self { db_path, config, clock: system_now_ms }
    }

    /// Replace the wall clock (epoch milliseconds) used for "now".
    #[must_use]
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn now_ms(&self) -> i64 {
        (self.clock)()
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    fn recalculate_in(&self, store: &mut SqliteStore, changed_ms: i64) -> Result<RecalcReport> {
        let profile = store.profile()?;
        store.recalculate(changed_ms, self.now_ms(), &profile, &StandardOracle, &self.config)
    }

    /// Apply `mutation` and its recalculation as one transaction.
    fn mutate<T>(
        &self,
        store: &mut SqliteStore,
        mutation: impl FnOnce(&LedgerWriter<'_>) -> Result<(T, i64)>,
    ) -> Result<(T, RecalcReport)> {
        store.apply_and_recalculate(self.now_ms(), &StandardOracle, &self.config, mutation)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when any integrity probe fails to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_migrated()?;
        store.integrity_check()
    }

    /// # Errors
    /// Returns an error when the backup cannot be written.
    pub fn backup(&self, out_file: &Path) -> Result<()> {
        let store = self.open_migrated()?;
        store.backup_database(out_file)
    }

    /// Replace the database with a backup and report the restored schema state.
    ///
    /// # Errors
    /// Returns an error when the backup cannot be read or applied.
    pub fn restore(&self, in_file: &Path) -> Result<SchemaStatus> {
        let mut store = self.open_store()?;
        store.restore_database(in_file)?;
        store.schema_status()
    }

    /// Record a beer, mark its virtual day as not dry, and recalculate from it.
    ///
    /// Every mutating call commits its write and the recalculation together, so a failed
    /// call leaves nothing behind and can be retried as is.
    ///
    /// # Errors
    /// Returns an error when validation, persistence, or recalculation fails.
    pub fn add_beer(&self, input: AddBeerRequest) -> Result<LogMutation> {
        let mut store = self.open_migrated()?;
        let now = OffsetDateTime::now_utc();
        let timestamp_ms = input.timestamp_ms.unwrap_or_else(|| self.now_ms());

        let beer = BeerLog {
            style: input.style,
            brand: input.brand,
            size_label: input.size_label,
            volume_ml: input.volume_ml,
            abv_percent: input.abv_percent,
            carb_factor: input.carb_factor.unwrap_or(DEFAULT_CARB_FACTOR),
            count: input.count,
            rating: input.rating,
            memo: input.memo.trim().to_string(),
        };
        let kcal =
            StandardOracle.beer_debit(beer.volume_ml, beer.abv_percent, beer.carb_factor, beer.count);
        let log = LogEntry {
            id: LogId::new(),
            timestamp_ms,
            kcal: Some(kcal),
            detail: LogDetail::Beer(beer),
            created_at: now,
            updated_at: now,
        };
        let (dry_checks_cleared, recalc) = self.mutate(&mut store, |writer| {
            writer.insert_log(&log)?;
            Ok((clear_dry_flag(writer, timestamp_ms)?, timestamp_ms))
        })?;
        Ok(LogMutation { log: reload_log(&store, log.id)?, dry_checks_cleared, recalc })
    }

    /// Record an exercise session and recalculate from it.
    ///
    /// # Errors
    /// Returns an error when validation, persistence, or recalculation fails.
    pub fn add_exercise(&self, input: AddExerciseRequest) -> Result<LogMutation> {
        let mut store = self.open_migrated()?;
        let now = OffsetDateTime::now_utc();
        let timestamp_ms = input.timestamp_ms.unwrap_or_else(|| self.now_ms());
        let exercise_key = input.exercise_key.trim().to_string();

        let (id, recalc) = self.mutate(&mut store, |writer| {
            let kcal = StandardOracle.exercise_burn(
                StandardOracle.metabolic_factor(&exercise_key),
                input.minutes,
                &writer.profile()?,
            );
            let log = LogEntry {
                id: LogId::new(),
                timestamp_ms,
                kcal: Some(kcal),
                detail: LogDetail::Exercise(ExerciseLog {
                    exercise_key,
                    minutes: input.minutes,
                    memo: input.memo.trim().to_string(),
                }),
                created_at: now,
                updated_at: now,
            };
            writer.insert_log(&log)?;
            Ok((log.id, timestamp_ms))
        })?;
        Ok(LogMutation { log: reload_log(&store, id)?, dry_checks_cleared: 0, recalc })
    }

    /// Patch an entry, recompute its base kcal, and recalculate from the earlier of its
    /// old and new timestamps.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] for an unknown id, [`LedgerError::Validation`] for
    /// fields that do not apply to the entry type, or an error when persistence fails.
    pub fn update_log(&self, id: LogId, patch: UpdateLogRequest) -> Result<LogMutation> {
        let mut store = self.open_migrated()?;
        let (dry_checks_cleared, recalc) = self.mutate(&mut store, |writer| {
            let existing = writer.get_log(id)?.ok_or_else(|| not_found("log", id))?;
            let log = patched_log(&existing, patch, &writer.profile()?)?;
            writer.update_log(&log)?;

            let dry_checks_cleared = match log.detail {
                LogDetail::Beer(_) => clear_dry_flag(writer, log.timestamp_ms)?,
                LogDetail::Exercise(_) => 0,
            };
            Ok((dry_checks_cleared, existing.timestamp_ms.min(log.timestamp_ms)))
        })?;
        Ok(LogMutation { log: reload_log(&store, id)?, dry_checks_cleared, recalc })
    }

    /// # Errors
    /// Returns [`LedgerError::NotFound`] for an unknown id, or an error when the delete or
    /// recalculation fails.
    pub fn delete_log(&self, id: LogId) -> Result<DeletedLog> {
        let mut store = self.open_migrated()?;
        let (log, recalc) = self.mutate(&mut store, |writer| {
            let log = writer.delete_log(id)?;
            let changed_ms = log.timestamp_ms;
            Ok((log, changed_ms))
        })?;
        Ok(DeletedLog { log, recalc })
    }

    /// Save the single check-in of `input.day`, collapsing duplicates, then recalculate.
    ///
    /// # Errors
    /// Returns an error when persistence or recalculation fails.
    pub fn save_check(&self, input: SaveCheckRequest) -> Result<CheckMutation> {
        let mut store = self.open_migrated()?;
        let now = OffsetDateTime::now_utc();
        let anchor_ms = day_anchor_ms(input.day, &self.config);

        let ((check, collapsed_duplicates), recalc) = self.mutate(&mut store, |writer| {
            let existing = resolve_checks(&writer.checks_for_day(input.day)?, writer.config())?;
            let check = match existing.into_iter().next() {
                Some(mut check) => {
                    check.is_dry_day = input.is_dry_day;
                    check.wellness = input.wellness;
                    check.weight_kg = input.weight_kg;
                    check.is_saved = true;
                    check.updated_at = now;
                    writer.update_check(&check)?;
                    check
                }
                None => {
                    let check = CheckEntry {
                        id: CheckId::new(),
                        timestamp_ms: anchor_ms,
                        is_dry_day: input.is_dry_day,
                        wellness: input.wellness,
                        weight_kg: input.weight_kg,
                        is_saved: true,
                        created_at: now,
                        updated_at: now,
                    };
                    writer.insert_check(&check)?;
                    check
                }
            };
            let collapsed_duplicates = writer.collapse_duplicate_checks(Some(input.day))?;
            if collapsed_duplicates > 0 {
                tracing::info!(day = %input.day, collapsed_duplicates, "collapsed duplicate check-ins");
            }
            Ok(((check, collapsed_duplicates), anchor_ms))
        })?;
        Ok(CheckMutation { check, collapsed_duplicates, recalc })
    }

    /// Make sure `day` has a check-in, creating an unsaved placeholder if needed.
    ///
    /// # Errors
    /// Returns an error when reads or the insert fail.
    pub fn ensure_check(&self, day: DayKey) -> Result<EnsuredCheck> {
        let mut store = self.open_migrated()?;
        let existing = resolve_checks(&store.checks_for_day(day, &self.config)?, &self.config)?;
        if let Some(check) = existing.into_iter().next() {
            return Ok(EnsuredCheck { check, created: false });
        }

        let now = OffsetDateTime::now_utc();
        let check = CheckEntry {
            id: CheckId::new(),
            timestamp_ms: day_anchor_ms(day, &self.config),
            is_dry_day: false,
            wellness: WellnessFlags::default(),
            weight_kg: None,
            is_saved: false,
            created_at: now,
            updated_at: now,
        };
        store.insert_check(&check)?;
        Ok(EnsuredCheck { check, created: true })
    }

    /// # Errors
    /// Returns [`LedgerError::NotFound`] for an unknown id, or an error when the delete or
    /// recalculation fails.
    pub fn delete_check(&self, id: CheckId) -> Result<DeletedCheck> {
        let mut store = self.open_migrated()?;
        let (check, recalc) = self.mutate(&mut store, |writer| {
            let check = writer.delete_check(id)?;
            let changed_ms = check.timestamp_ms;
            Ok((check, changed_ms))
        })?;
        Ok(DeletedCheck { check, recalc })
    }

    /// # Errors
    /// Returns an error when the recalculation fails.
    pub fn recalculate(&self, changed_ms: i64) -> Result<RecalcReport> {
        let mut store = self.open_migrated()?;
        self.recalculate_in(&mut store, changed_ms)
    }

    /// # Errors
    /// Returns an error when settings cannot be read or archiving fails.
    pub fn check_rollover(&self) -> Result<RolloverOutcome> {
        let mut store = self.open_migrated()?;
        store.check_rollover(self.now_ms(), &self.config)
    }

    /// # Errors
    /// Returns an error for an empty range or when archiving fails.
    pub fn archive_and_reset(&self, input: &ArchiveRequest) -> Result<ArchiveOutcome> {
        let mut store = self.open_migrated()?;
        store.archive_and_reset(input.current_start_ms, input.next_start_ms, input.mode)
    }

    /// Switch period accounting mode. Switching to permanent restores all archives and
    /// recalculates from the earliest restored entry.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for an incomplete custom range, or an error when
    /// persistence fails.
    pub fn set_period_mode(&self, input: &SetPeriodModeRequest) -> Result<PeriodModeResult> {
        let mut store = self.open_migrated()?;
        let custom_range = match (input.custom_start_ms, input.custom_end_ms) {
            (Some(start_ms), Some(end_ms)) => Some((start_ms, end_ms)),
            _ => None,
        };
        let settings = settings_for_mode(input.mode, self.now_ms(), custom_range, &self.config)?;

        if input.mode != PeriodMode::Permanent {
            store.set_period_settings(&settings)?;
            tracing::info!(mode = settings.mode.as_str(), start_ms = settings.period_start_ms, "set period mode");
            return Ok(PeriodModeResult { settings, restore: None, recalc: None });
        }

        let restore = store.switch_to_permanent()?;
        let recalc = match restore.earliest_restored_ms {
            Some(earliest_ms) => Some(self.recalculate_in(&mut store, earliest_ms)?),
            None => None,
        };
        Ok(PeriodModeResult { settings: store.period_settings()?, restore: Some(restore), recalc })
    }

    /// Collapse raw check-ins to one per virtual day without touching storage.
    ///
    /// # Errors
    /// Returns [`LedgerError::Time`] when a timestamp cannot be mapped to a day.
    pub fn resolve(&self, raw: &[CheckEntry]) -> Result<Vec<CheckEntry>> {
        Ok(resolve_checks(raw, &self.config)?)
    }

    /// Balance of the current accounting period.
    ///
    /// # Errors
    /// Returns an error when settings or logs cannot be read.
    pub fn current_balance(&self) -> Result<PeriodSummary> {
        let store = self.open_migrated()?;
        let settings = store.period_settings()?;
        let (from_ms, to_ms) = match settings.mode {
            PeriodMode::Permanent => (None, None),
            PeriodMode::Weekly | PeriodMode::Monthly => (Some(settings.period_start_ms), None),
            PeriodMode::Custom => (Some(settings.period_start_ms), settings.custom_end_ms),
        };
        let logs = store.list_logs(from_ms, to_ms)?;
        let ended = settings.mode == PeriodMode::Custom
            && settings.custom_end_ms.is_some_and(|end_ms| end_ms < self.now_ms());

        Ok(PeriodSummary { settings, balance: kcal_total(&logs), log_count: logs.len(), ended })
    }

    /// Per-day balance, dry flag, and streak for `from..=to`.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for an inverted or oversized range, or an error
    /// when the ledger cannot be read.
    pub fn day_summaries(&self, from: DayKey, to: DayKey) -> Result<Vec<DaySummary>> {
        let span = to.days_since(from);
        if span < 0 || span >= i64::from(self.config.max_walk_days) {
            return Err(anyhow::Error::new(LedgerError::Validation(format!(
                "day range {from}..={to} MUST be ordered and span at most {} days",
                self.config.max_walk_days
            ))));
        }

        let store = self.open_migrated()?;
        let profile = store.profile()?;
        let logs = store.list_logs(None, None)?;
        let checks = store.list_checks(None, None)?;
        let snapshot = LedgerSnapshot::build(&logs, &checks, &profile, &StandardOracle, &self.config)?;

        let mut summaries = Vec::new();
        let mut cursor = Some(from);
        while let Some(day) = cursor {
            if day > to {
                break;
            }
            let aggregate = snapshot.days.get(&day).copied().unwrap_or_default();
            summaries.push(DaySummary {
                day,
                balance: aggregate.balance,
                has_debit_event: aggregate.has_debit_event,
                has_credit_event: aggregate.has_credit_event,
                is_dry_day: snapshot.dry_days.get(&day).copied(),
                streak: StandardOracle.streak_length(
                    &snapshot.days,
                    &snapshot.dry_days,
                    snapshot.anchor,
                    day,
                ),
            });
            cursor = day.next();
        }
        Ok(summaries)
    }

    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_logs(&self, from_ms: Option<i64>, to_ms: Option<i64>) -> Result<Vec<LogEntry>> {
        self.open_migrated()?.list_logs(from_ms, to_ms)
    }

    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_checks(&self, from_ms: Option<i64>, to_ms: Option<i64>) -> Result<Vec<CheckEntry>> {
        self.open_migrated()?.list_checks(from_ms, to_ms)
    }

    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_archives(&self) -> Result<Vec<PeriodArchive>> {
        self.open_migrated()?.list_archives()
    }

    /// Remove losing duplicate check-ins for one day or the whole ledger.
    ///
    /// # Errors
    /// Returns an error when the cleanup fails.
    pub fn dedupe_checks(&self, day: Option<DayKey>) -> Result<usize> {
        self.open_migrated()?.collapse_duplicate_checks(day, &self.config)
    }

    /// # Errors
    /// Returns an error when the profile cannot be read.
    pub fn get_profile(&self) -> Result<Profile> {
        self.open_migrated()?.profile()
    }

    /// Persist a new profile. Stored kcal values are left as they are; the next
    /// recalculation picks the profile up.
    ///
    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn set_profile(&self, profile: &Profile) -> Result<Profile> {
        let mut store = self.open_migrated()?;
        store.set_profile(profile)?;
        store.profile()
    }

    /// # Errors
    /// Returns an error when settings cannot be read.
    pub fn period_settings(&self) -> Result<PeriodSettings> {
        self.open_migrated()?.period_settings()
    }
}

fn clear_dry_flag(writer: &LedgerWriter<'_>, timestamp_ms: i64) -> Result<usize> {
    let day = virtual_date(timestamp_ms, writer.config())?;
    let cleared = writer.mark_day_not_dry(day)?;
    if cleared > 0 {
        tracing::info!(%day, cleared, "beer entry cleared dry-day check-in");
    }
    Ok(cleared)
}

fn not_found(kind: &'static str, id: impl std::fmt::Display) -> anyhow::Error {
    anyhow::Error::new(LedgerError::NotFound { kind, id: id.to_string() })
}

/// `existing` with `patch` applied and its base kcal recomputed.
fn patched_log(existing: &LogEntry, patch: UpdateLogRequest, profile: &Profile) -> Result<LogEntry> {
    let mut log = existing.clone();
    if let Some(timestamp_ms) = patch.timestamp_ms {
        log.timestamp_ms = timestamp_ms;
    }
    match &mut log.detail {
        LogDetail::Beer(beer) => {
            reject_fields(
                "beer",
                &[("exercise_key", patch.exercise_key.is_some()), ("minutes", patch.minutes.is_some())],
            )?;
            if let Some(memo) = patch.memo {
                beer.memo = memo.trim().to_string();
            }
            if let Some(volume_ml) = patch.volume_ml {
                beer.volume_ml = volume_ml;
            }
            if let Some(abv_percent) = patch.abv_percent {
                beer.abv_percent = abv_percent;
            }
            if let Some(carb_factor) = patch.carb_factor {
                beer.carb_factor = carb_factor;
            }
            if let Some(count) = patch.count {
                beer.count = count;
            }
            if patch.rating.is_some() {
                beer.rating = patch.rating;
            }
            log.kcal = Some(StandardOracle.beer_debit(
                beer.volume_ml,
                beer.abv_percent,
                beer.carb_factor,
                beer.count,
            ));
        }
        LogDetail::Exercise(exercise) => {
            reject_fields(
                "exercise",
                &[
                    ("volume_ml", patch.volume_ml.is_some()),
                    ("abv_percent", patch.abv_percent.is_some()),
                    ("carb_factor", patch.carb_factor.is_some()),
                    ("count", patch.count.is_some()),
                    ("rating", patch.rating.is_some()),
                ],
            )?;
            if let Some(memo) = patch.memo {
                exercise.memo = memo.trim().to_string();
            }
            if let Some(exercise_key) = patch.exercise_key {
                exercise.exercise_key = exercise_key.trim().to_string();
            }
            if let Some(minutes) = patch.minutes {
                exercise.minutes = minutes;
            }
            log.kcal = Some(StandardOracle.exercise_burn(
                StandardOracle.metabolic_factor(&exercise.exercise_key),
                exercise.minutes,
                profile,
            ));
        }
    }
    log.updated_at = OffsetDateTime::now_utc();
    Ok(log)
}

fn reload_log(store: &SqliteStore, id: LogId) -> Result<LogEntry> {
    store.get_log(id)?.ok_or_else(|| anyhow!("log {id} vanished after write"))
}

fn reject_fields(log_type: &str, fields: &[(&str, bool)]) -> Result<()> {
    let offending = fields.iter().filter(|(_, present)| *present).map(|(name, _)| *name).collect::<Vec<_>>();
    if offending.is_empty() {
        return Ok(());
    }
    Err(anyhow::Error::new(LedgerError::Validation(format!(
        "{} do not apply to {log_type} entries",
        offending.join(", ")
    ))))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY_MS: i64 = 86_400_000;
    const HOUR_MS: i64 = 3_600_000;
    /// 2023-11-13 12:00:00 UTC, a Monday.
    const MONDAY_NOON_MS: i64 = 1_699_876_800_000;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("tally-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn api_at(db_path: &Path, clock: fn() -> i64) -> TallyApi {
        TallyApi::new(db_path.to_path_buf(), EngineConfig::default()).with_clock(clock)
    }

    fn cleanup(db_path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", db_path.display()));
        }
    }

    fn run(timestamp_ms: i64, memo: &str) -> AddExerciseRequest {
        AddExerciseRequest {
            timestamp_ms: Some(timestamp_ms),
            exercise_key: "running".to_string(),
            minutes: 30.0,
            memo: memo.to_string(),
        }
    }

    fn pint(timestamp_ms: i64) -> AddBeerRequest {
        AddBeerRequest {
            timestamp_ms: Some(timestamp_ms),
            style: Some("stout".to_string()),
            brand: None,
            size_label: Some("pint".to_string()),
            volume_ml: 473.0,
            abv_percent: 5.0,
            carb_factor: None,
            count: 1,
            rating: None,
            memo: String::new(),
        }
    }

    fn memo_of(log: &LogEntry) -> &str {
        match &log.detail {
            LogDetail::Exercise(exercise) => &exercise.memo,
            LogDetail::Beer(beer) => &beer.memo,
        }
    }

    fn is_not_found(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<LedgerError>(), Some(LedgerError::NotFound { .. }))
    }

    #[test]
    fn saving_a_dry_day_boosts_the_next_days_exercise() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = api_at(&db_path, || MONDAY_NOON_MS + DAY_MS + HOUR_MS);

        let first = api.add_exercise(run(MONDAY_NOON_MS, ""))?;
        let second = api.add_exercise(run(MONDAY_NOON_MS + DAY_MS, "tempo"))?;
        assert_eq!(memo_of(&second.log), "tempo");
        let base_kcal = second.log.kcal.unwrap_or_default();

        let saved = api.save_check(SaveCheckRequest {
            day: DayKey::parse("2023-11-13")?,
            is_dry_day: true,
            wellness: WellnessFlags::default(),
            weight_kg: Some(71.5),
        })?;
        assert_eq!(saved.recalc.rewritten_logs, 1);

        let logs = api.list_logs(None, None)?;
        assert_eq!(logs[0].kcal, first.log.kcal);
        assert_eq!(memo_of(&logs[1]), "tempo [streak bonus x1.2]");
        let boosted = logs[1].kcal.unwrap_or_default();
        assert!((boosted - StandardOracle.exercise_credit(base_kcal, 1).kcal).abs() < 1e-9);

        let summaries = api.day_summaries(DayKey::parse("2023-11-13")?, DayKey::parse("2023-11-14")?)?;
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].is_dry_day, Some(true));
        assert_eq!(summaries[1].streak, 1);

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn beer_clears_dry_flag_and_drops_the_bonus() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = api_at(&db_path, || MONDAY_NOON_MS + DAY_MS + HOUR_MS);
        let monday = DayKey::parse("2023-11-13")?;

        api.add_exercise(run(MONDAY_NOON_MS, ""))?;
        api.add_exercise(run(MONDAY_NOON_MS + DAY_MS, ""))?;
        api.save_check(SaveCheckRequest {
            day: monday,
            is_dry_day: true,
            wellness: WellnessFlags::default(),
            weight_kg: None,
        })?;
        assert!(memo_of(&api.list_logs(None, None)?[1]).contains("[streak bonus x1.2]"));

        // Late Monday night still belongs to Monday.
        let beer = api.add_beer(pint(MONDAY_NOON_MS + 13 * HOUR_MS))?;
        assert_eq!(beer.dry_checks_cleared, 1);
        assert!(beer.log.kcal.is_some_and(|kcal| kcal < 0.0));
        assert_eq!(beer.recalc.rewritten_logs, 1);

        let checks = api.list_checks(None, None)?;
        assert_eq!(checks.len(), 1);
        assert!(!checks[0].is_dry_day);
        assert_eq!(memo_of(&api.list_logs(None, None)?[1]), "");

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn timestamps_outside_the_calendar_are_rejected_before_storage() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = api_at(&db_path, || MONDAY_NOON_MS);

        let err = api
            .add_beer(pint(400_000_000_000_000))
            .err()
            .ok_or_else(|| anyhow!("far-future beer should be rejected"))?;
        assert!(
            matches!(err.downcast_ref::<LedgerError>(), Some(LedgerError::Validation(_))),
            "unexpected error: {err:#}"
        );
        assert!(api.list_logs(None, None)?.is_empty());

        // The ledger keeps working afterwards.
        let added = api.add_exercise(run(MONDAY_NOON_MS, ""))?;
        let moved = api.update_log(
            added.log.id,
            UpdateLogRequest { timestamp_ms: Some(i64::MAX), ..UpdateLogRequest::default() },
        );
        assert!(moved.is_err());
        assert_eq!(api.list_logs(None, None)?, vec![added.log]);
        api.recalculate(MONDAY_NOON_MS)?;

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn failed_recalculation_leaves_no_partial_mutation() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = api_at(&db_path, || MONDAY_NOON_MS + DAY_MS);
        // "Now" cannot be mapped to a day, so every recalculation fails.
        let broken = api_at(&db_path, || i64::MAX);

        api.save_check(SaveCheckRequest {
            day: DayKey::parse("2023-11-13")?,
            is_dry_day: true,
            wellness: WellnessFlags::default(),
            weight_kg: None,
        })?;

        assert!(broken.add_beer(pint(MONDAY_NOON_MS + HOUR_MS)).is_err());
        assert!(broken.add_exercise(run(MONDAY_NOON_MS, "")).is_err());
        assert!(api.list_logs(None, None)?.is_empty());
        assert!(api.list_checks(None, None)?[0].is_dry_day);

        // Retrying the same call stores exactly one entry.
        api.add_exercise(run(MONDAY_NOON_MS, ""))?;
        assert_eq!(api.list_logs(None, None)?.len(), 1);

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn update_and_delete_report_not_found_for_unknown_ids() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = api_at(&db_path, || MONDAY_NOON_MS);

        let Err(update_err) = api.update_log(LogId::new(), UpdateLogRequest::default()) else {
            return Err(anyhow!("update of unknown log should fail"));
        };
        assert!(is_not_found(&update_err));

        let Err(delete_err) = api.delete_log(LogId::new()) else {
            return Err(anyhow!("delete of unknown log should fail"));
        };
        assert!(is_not_found(&delete_err));

        let Err(check_err) = api.delete_check(CheckId::new()) else {
            return Err(anyhow!("delete of unknown check should fail"));
        };
        assert!(is_not_found(&check_err));

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn update_moves_entry_and_rejects_foreign_fields() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = api_at(&db_path, || MONDAY_NOON_MS + 2 * DAY_MS);

        let added = api.add_exercise(run(MONDAY_NOON_MS, "easy"))?;
        let updated = api.update_log(
            added.log.id,
            UpdateLogRequest {
                timestamp_ms: Some(MONDAY_NOON_MS + DAY_MS),
                minutes: Some(60.0),
                ..UpdateLogRequest::default()
            },
        )?;
        assert_eq!(updated.log.timestamp_ms, MONDAY_NOON_MS + DAY_MS);
        assert_eq!(updated.recalc.start_day, DayKey::parse("2023-11-13")?);
        let doubled = added.log.kcal.unwrap_or_default() * 2.0;
        assert!(updated.log.kcal.is_some_and(|kcal| (kcal - doubled).abs() < 0.11));

        let rejected = api.update_log(
            added.log.id,
            UpdateLogRequest { abv_percent: Some(4.0), ..UpdateLogRequest::default() },
        );
        let Err(err) = rejected else {
            return Err(anyhow!("abv on exercise should be rejected"));
        };
        assert!(err.to_string().contains("abv_percent"));

        let deleted = api.delete_log(added.log.id)?;
        assert_eq!(deleted.log.id, added.log.id);
        assert!(api.list_logs(None, None)?.is_empty());

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn ensure_check_creates_one_placeholder() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = api_at(&db_path, || MONDAY_NOON_MS);
        let monday = DayKey::parse("2023-11-13")?;

        let first = api.ensure_check(monday)?;
        assert!(first.created);
        assert!(!first.check.is_saved);
        let second = api.ensure_check(monday)?;
        assert!(!second.created);
        assert_eq!(second.check.id, first.check.id);

        let saved = api.save_check(SaveCheckRequest {
            day: monday,
            is_dry_day: true,
            wellness: WellnessFlags { slept_well: Some(true), ..WellnessFlags::default() },
            weight_kg: None,
        })?;
        assert_eq!(saved.check.id, first.check.id);
        assert!(saved.check.is_saved);
        assert_eq!(api.list_checks(None, None)?.len(), 1);

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn weekly_period_rolls_over_and_permanent_restores() -> Result<()> {
        let db_path = unique_temp_db_path();
        let last_week = api_at(&db_path, || MONDAY_NOON_MS - 6 * DAY_MS);

        let mode = last_week.set_period_mode(&SetPeriodModeRequest {
            mode: PeriodMode::Weekly,
            custom_start_ms: None,
            custom_end_ms: None,
        })?;
        assert_eq!(mode.settings.mode, PeriodMode::Weekly);
        let added = last_week.add_exercise(run(MONDAY_NOON_MS - 5 * DAY_MS, ""))?;
        assert_eq!(last_week.current_balance()?.log_count, 1);

        let this_week = api_at(&db_path, || MONDAY_NOON_MS);
        let outcome = this_week.check_rollover()?;
        assert!(matches!(outcome, RolloverOutcome::RolledOver { .. }), "unexpected {outcome:?}");
        assert_eq!(this_week.check_rollover()?, RolloverOutcome::Unchanged);
        assert_eq!(this_week.list_archives()?.len(), 1);
        let summary = this_week.current_balance()?;
        assert_eq!(summary.log_count, 0);
        assert!(summary.balance.abs() < f64::EPSILON);

        let restored = this_week.set_period_mode(&SetPeriodModeRequest {
            mode: PeriodMode::Permanent,
            custom_start_ms: None,
            custom_end_ms: None,
        })?;
        let Some(report) = restored.restore else {
            return Err(anyhow!("switching to permanent should report a restore"));
        };
        // Archived entries are still live, so nothing is duplicated.
        assert_eq!(report.restored_logs, 0);
        assert_eq!(report.skipped_logs, 1);
        assert_eq!(report.cleared_archives, 1);
        assert!(restored.recalc.is_none());
        assert_eq!(restored.settings, PeriodSettings::default());
        let logs = this_week.list_logs(None, None)?;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].id, added.log.id);
        assert!(this_week.list_archives()?.is_empty());

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn custom_period_requires_range_and_reports_end() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = api_at(&db_path, || MONDAY_NOON_MS);

        let incomplete = api.set_period_mode(&SetPeriodModeRequest {
            mode: PeriodMode::Custom,
            custom_start_ms: Some(MONDAY_NOON_MS - 10 * DAY_MS),
            custom_end_ms: None,
        });
        assert!(incomplete.is_err());

        api.set_period_mode(&SetPeriodModeRequest {
            mode: PeriodMode::Custom,
            custom_start_ms: Some(MONDAY_NOON_MS - 10 * DAY_MS),
            custom_end_ms: Some(MONDAY_NOON_MS - DAY_MS),
        })?;
        assert_eq!(
            api.check_rollover()?,
            RolloverOutcome::PeriodEnded { end_ms: MONDAY_NOON_MS - DAY_MS }
        );
        assert!(api.current_balance()?.ended);

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn migrate_dry_run_reports_pending_versions() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = api_at(&db_path, || MONDAY_NOON_MS);

        let planned = api.migrate(true)?;
        assert!(planned.dry_run);
        assert_eq!(planned.would_apply_versions, vec![1, 2]);
        assert_eq!(planned.after_version, None);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(2));
        assert_eq!(applied.up_to_date, Some(true));

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn day_summaries_reject_inverted_ranges() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = api_at(&db_path, || MONDAY_NOON_MS);
        let result = api.day_summaries(DayKey::parse("2023-11-14")?, DayKey::parse("2023-11-13")?);
        assert!(result.is_err());
        cleanup(&db_path);
        Ok(())
    }
}
