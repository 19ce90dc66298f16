use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tally_core::checks::partition_checks;
use tally_core::{
    day_start_ms, ArchiveId, CheckEntry, CheckId, DayKey, EngineConfig, LedgerError, LogDetail,
    LogEntry, LogId, PeriodArchive, PeriodMode, PeriodSettings, Profile, WellnessFlags,
};
use time::OffsetDateTime;

mod consistency;

pub use consistency::{ArchiveOutcome, RecalcReport, RestoreReport, RolloverOutcome};

const LATEST_SCHEMA_VERSION: i64 = 2;

pub const PERIOD_SETTINGS_KEY: &str = "period";
pub const PROFILE_SETTINGS_KEY: &str = "profile";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS logs (
  log_id TEXT PRIMARY KEY,
  timestamp_ms INTEGER NOT NULL,
  log_type TEXT NOT NULL CHECK (log_type IN ('beer','exercise')),
  kcal REAL,
  detail_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS checks (
  check_id TEXT PRIMARY KEY,
  timestamp_ms INTEGER NOT NULL,
  is_dry_day INTEGER NOT NULL CHECK (is_dry_day IN (0, 1)),
  is_saved INTEGER NOT NULL CHECK (is_saved IN (0, 1)),
  wellness_json TEXT NOT NULL,
  weight_kg REAL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS settings (
  key TEXT PRIMARY KEY,
  value_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp_ms);
CREATE INDEX IF NOT EXISTS idx_checks_timestamp ON checks(timestamp_ms);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS archives (
  archive_id TEXT PRIMARY KEY,
  start_date_ms INTEGER NOT NULL UNIQUE,
  end_date_ms INTEGER NOT NULL CHECK (end_date_ms >= start_date_ms),
  mode TEXT NOT NULL CHECK (mode IN ('weekly','monthly','custom','permanent')),
  total_balance REAL NOT NULL,
  logs_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_archives_end ON archives(end_date_ms);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed ledger store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            self.apply_migration(2, MIGRATION_002_SQL)?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&mut self) -> Result<i64> {
        if !table_exists(&self.conn, "logs")? {
            self.apply_migration(1, MIGRATION_001_SQL)?;
            return Ok(1);
        }

        // Tables exist without migration records; adopt whatever shape is present.
        record_schema_version(&self.conn, 1)?;
        if table_exists(&self.conn, "archives")? {
            record_schema_version(&self.conn, 2)?;
            return Ok(2);
        }
        Ok(1)
    }

    fn apply_migration(&mut self, version: i64, sql: &str) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .with_context(|| format!("failed to start migration v{version} transaction"))?;
        tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
        record_schema_version(&tx, version)?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        tracing::info!(version, "applied schema migration");
        Ok(())
    }

    /// Persist one validated ledger entry.
    ///
    /// # Errors
    /// Returns an error when validation fails or the insert fails.
    pub fn insert_log(&mut self, log: &LogEntry) -> Result<()> {
        log.validate()?;
        insert_log_row(&self.conn, log)
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_log(&self, id: LogId) -> Result<Option<LogEntry>> {
        get_log_row(&self.conn, id)
    }

    /// Overwrite a persisted entry by id.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] when no entry has this id, or an error when
    /// validation or the update fails.
    pub fn update_log(&mut self, log: &LogEntry) -> Result<()> {
        log.validate()?;
        update_log_row(&self.conn, log)
    }

    /// Delete one entry and return what was removed.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] when no entry has this id.
    pub fn delete_log(&mut self, id: LogId) -> Result<LogEntry> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let existing = delete_log_row(&tx, id)?;
        tx.commit().context("failed to commit log delete")?;
        Ok(existing)
    }

    /// Entries ordered by timestamp, optionally bounded (inclusive) on either side.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_logs(&self, from_ms: Option<i64>, to_ms: Option<i64>) -> Result<Vec<LogEntry>> {
        load_logs(&self.conn, from_ms, to_ms)
    }

    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_check(&mut self, check: &CheckEntry) -> Result<()> {
        insert_check_row(&self.conn, check)
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_check(&self, id: CheckId) -> Result<Option<CheckEntry>> {
        get_check_row(&self.conn, id)
    }

    /// # Errors
    /// Returns [`LedgerError::NotFound`] when no check-in has this id.
    pub fn update_check(&mut self, check: &CheckEntry) -> Result<()> {
        update_check_row(&self.conn, check)
    }

    /// # Errors
    /// Returns [`LedgerError::NotFound`] when no check-in has this id.
    pub fn delete_check(&mut self, id: CheckId) -> Result<CheckEntry> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let existing = delete_check_row(&tx, id)?;
        tx.commit().context("failed to commit check delete")?;
        Ok(existing)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_checks(&self, from_ms: Option<i64>, to_ms: Option<i64>) -> Result<Vec<CheckEntry>> {
        load_checks(&self.conn, from_ms, to_ms)
    }

    /// Raw (unresolved) check-ins whose timestamps fall on `day`.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn checks_for_day(&self, day: DayKey, config: &EngineConfig) -> Result<Vec<CheckEntry>> {
        LedgerWriter::new(&self.conn, config).checks_for_day(day)
    }

    /// Clear the dry-day flag on every check-in of `day`; returns the rows changed.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn mark_day_not_dry(&mut self, day: DayKey, config: &EngineConfig) -> Result<usize> {
        LedgerWriter::new(&self.conn, config).mark_day_not_dry(day)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_archives(&self) -> Result<Vec<PeriodArchive>> {
        load_archives(&self.conn, None)
    }

    /// Stored profile, or the default profile when none was saved.
    ///
    /// # Errors
    /// Returns an error when the stored value cannot be read or decoded.
    pub fn profile(&self) -> Result<Profile> {
        Ok(load_setting(&self.conn, PROFILE_SETTINGS_KEY)?.unwrap_or_default())
    }

    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn set_profile(&mut self, profile: &Profile) -> Result<()> {
        profile.validate()?;
        save_setting(&self.conn, PROFILE_SETTINGS_KEY, profile)
    }

    /// Stored period settings, or permanent mode when none were saved.
    ///
    /// # Errors
    /// Returns an error when the stored value cannot be read or decoded.
    pub fn period_settings(&self) -> Result<PeriodSettings> {
        load_period_settings(&self.conn)
    }

    /// # Errors
    /// Returns an error when persistence fails.
    pub fn set_period_settings(&mut self, settings: &PeriodSettings) -> Result<()> {
        save_setting(&self.conn, PERIOD_SETTINGS_KEY, settings)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run quick-check and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            schema_status,
        })
    }
}

/// Row-level writes applied inside a caller-owned transaction.
///
/// Handed to the mutation closure of [`SqliteStore::apply_and_recalculate`], so a ledger
/// edit and the recalculation it triggers commit or roll back together.
pub struct LedgerWriter<'c> {
    conn: &'c Connection,
    config: &'c EngineConfig,
}

impl<'c> LedgerWriter<'c> {
    fn new(conn: &'c Connection, config: &'c EngineConfig) -> Self {
        Self { conn, config }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        self.config
    }

    /// Stored profile, or the default profile when none was saved.
    ///
    /// # Errors
    /// Returns an error when the stored value cannot be read or decoded.
    pub fn profile(&self) -> Result<Profile> {
        Ok(load_setting(self.conn, PROFILE_SETTINGS_KEY)?.unwrap_or_default())
    }

    /// # Errors
    /// Returns an error when validation (including the timestamp range) or the insert fails.
    pub fn insert_log(&self, log: &LogEntry) -> Result<()> {
        log.validate_for(self.config)?;
        insert_log_row(self.conn, log)
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_log(&self, id: LogId) -> Result<Option<LogEntry>> {
        get_log_row(self.conn, id)
    }

    /// # Errors
    /// Returns [`LedgerError::NotFound`] when no entry has this id, or an error when
    /// validation or the update fails.
    pub fn update_log(&self, log: &LogEntry) -> Result<()> {
        log.validate_for(self.config)?;
        update_log_row(self.conn, log)
    }

    /// # Errors
    /// Returns [`LedgerError::NotFound`] when no entry has this id.
    pub fn delete_log(&self, id: LogId) -> Result<LogEntry> {
        delete_log_row(self.conn, id)
    }

    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_check(&self, check: &CheckEntry) -> Result<()> {
        insert_check_row(self.conn, check)
    }

    /// # Errors
    /// Returns [`LedgerError::NotFound`] when no check-in has this id.
    pub fn update_check(&self, check: &CheckEntry) -> Result<()> {
        update_check_row(self.conn, check)
    }

    /// # Errors
    /// Returns [`LedgerError::NotFound`] when no check-in has this id.
    pub fn delete_check(&self, id: CheckId) -> Result<CheckEntry> {
        delete_check_row(self.conn, id)
    }

    /// Raw (unresolved) check-ins whose timestamps fall on `day`.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn checks_for_day(&self, day: DayKey) -> Result<Vec<CheckEntry>> {
        let (from_ms, to_ms) = day_bounds(day, self.config);
        load_checks(self.conn, Some(from_ms), Some(to_ms))
    }

    /// Clear the dry-day flag on every check-in of `day`; returns the rows changed.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn mark_day_not_dry(&self, day: DayKey) -> Result<usize> {
        let (from_ms, to_ms) = day_bounds(day, self.config);
        self.conn
            .execute(
                "UPDATE checks SET is_dry_day = 0, updated_at = ?3
                 WHERE timestamp_ms >= ?1 AND timestamp_ms <= ?2 AND is_dry_day = 1",
                params![from_ms, to_ms, now_rfc3339()?],
            )
            .context("failed to clear dry-day flag")
    }

    /// Delete check-ins that lose duplicate resolution, for one day or the whole ledger.
    /// Returns the number of rows removed.
    ///
    /// # Errors
    /// Returns an error when any read or delete fails.
    pub fn collapse_duplicate_checks(&self, day: Option<DayKey>) -> Result<usize> {
        let (from_ms, to_ms) = match day {
            Some(day) => {
                let (from_ms, to_ms) = day_bounds(day, self.config);
                (Some(from_ms), Some(to_ms))
            }
            None => (None, None),
        };
        let raw = load_checks(self.conn, from_ms, to_ms)?;
        let resolution = partition_checks(&raw, self.config)?;
        for id in &resolution.discarded {
            self.conn
                .execute("DELETE FROM checks WHERE check_id = ?1", params![id.to_string()])
                .context("failed to delete duplicate check")?;
        }
        Ok(resolution.discarded.len())
    }
}

fn not_found(kind: &'static str, id: impl std::fmt::Display) -> anyhow::Error {
    anyhow::Error::new(LedgerError::NotFound { kind, id: id.to_string() })
}

/// Inclusive millisecond range covered by `day`.
fn day_bounds(day: DayKey, config: &EngineConfig) -> (i64, i64) {
    let from_ms = day_start_ms(day, config);
    let to_ms = day.next().map_or(i64::MAX, |next| day_start_ms(next, config) - 1);
    (from_ms, to_ms)
}

fn insert_log_row(conn: &Connection, log: &LogEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO logs(log_id, timestamp_ms, log_type, kcal, detail_json, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            log.id.to_string(),
            log.timestamp_ms,
            log.log_type().as_str(),
            log.kcal,
            serde_json::to_string(&log.detail).context("failed to serialize log detail")?,
            rfc3339(log.created_at)?,
            rfc3339(log.updated_at)?,
        ],
    )
    .context("failed to insert log")?;
    Ok(())
}

fn update_log_row(conn: &Connection, log: &LogEntry) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE logs
             SET timestamp_ms = ?2, log_type = ?3, kcal = ?4, detail_json = ?5, updated_at = ?6
             WHERE log_id = ?1",
            params![
                log.id.to_string(),
                log.timestamp_ms,
                log.log_type().as_str(),
                log.kcal,
                serde_json::to_string(&log.detail).context("failed to serialize log detail")?,
                rfc3339(log.updated_at)?,
            ],
        )
        .context("failed to update log")?;
    if changed == 0 {
        return Err(not_found("log", log.id));
    }
    Ok(())
}

const LOG_COLUMNS: &str = "log_id, timestamp_ms, log_type, kcal, detail_json, created_at, updated_at";

fn delete_log_row(conn: &Connection, id: LogId) -> Result<LogEntry> {
    let Some(existing) = get_log_row(conn, id)? else {
        return Err(not_found("log", id));
    };
    conn.execute("DELETE FROM logs WHERE log_id = ?1", params![id.to_string()])
        .context("failed to delete log")?;
    Ok(existing)
}

fn get_log_row(conn: &Connection, id: LogId) -> Result<Option<LogEntry>> {
    let row = conn
        .query_row(
            &format!("SELECT {LOG_COLUMNS} FROM logs WHERE log_id = ?1"),
            params![id.to_string()],
            LogRow::from_row,
        )
        .optional()
        .context("failed to read log")?;
    row.map(LogRow::decode).transpose()
}

fn load_logs(conn: &Connection, from_ms: Option<i64>, to_ms: Option<i64>) -> Result<Vec<LogEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {LOG_COLUMNS} FROM logs
         WHERE (?1 IS NULL OR timestamp_ms >= ?1) AND (?2 IS NULL OR timestamp_ms <= ?2)
         ORDER BY timestamp_ms ASC, log_id ASC"
    ))?;
    let rows = stmt.query_map(params![from_ms, to_ms], LogRow::from_row)?;

    let mut logs = Vec::new();
    for row in rows {
        logs.push(row?.decode()?);
    }
    Ok(logs)
}

fn load_log_ids(conn: &Connection) -> Result<Vec<LogId>> {
    let mut stmt = conn.prepare("SELECT log_id FROM logs")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut ids = Vec::new();
    for row in rows {
        ids.push(LogId::parse(&row?)?);
    }
    Ok(ids)
}

struct LogRow {
    log_id: String,
    timestamp_ms: i64,
    log_type: String,
    kcal: Option<f64>,
    detail_json: String,
    created_at: String,
    updated_at: String,
}

impl LogRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            log_id: row.get(0)?,
            timestamp_ms: row.get(1)?,
            log_type: row.get(2)?,
            kcal: row.get(3)?,
            detail_json: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn decode(self) -> Result<LogEntry> {
        let detail: LogDetail = serde_json::from_str(&self.detail_json)
            .with_context(|| format!("failed to deserialize detail for log {}", self.log_id))?;
        if detail.log_type().as_str() != self.log_type {
            return Err(anyhow!(
                "log {} has log_type {} but detail of type {}",
                self.log_id,
                self.log_type,
                detail.log_type().as_str()
            ));
        }
        Ok(LogEntry {
            id: LogId::parse(&self.log_id)?,
            timestamp_ms: self.timestamp_ms,
            kcal: self.kcal,
            detail,
            created_at: parse_rfc3339(&self.created_at)?,
            updated_at: parse_rfc3339(&self.updated_at)?,
        })
    }
}

fn insert_check_row(conn: &Connection, check: &CheckEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO checks(
            check_id, timestamp_ms, is_dry_day, is_saved, wellness_json, weight_kg,
            created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            check.id.to_string(),
            check.timestamp_ms,
            check.is_dry_day,
            check.is_saved,
            serde_json::to_string(&check.wellness).context("failed to serialize wellness")?,
            check.weight_kg,
            rfc3339(check.created_at)?,
            rfc3339(check.updated_at)?,
        ],
    )
    .context("failed to insert check")?;
    Ok(())
}

fn update_check_row(conn: &Connection, check: &CheckEntry) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE checks
             SET timestamp_ms = ?2, is_dry_day = ?3, is_saved = ?4, wellness_json = ?5,
                 weight_kg = ?6, updated_at = ?7
             WHERE check_id = ?1",
            params![
                check.id.to_string(),
                check.timestamp_ms,
                check.is_dry_day,
                check.is_saved,
                serde_json::to_string(&check.wellness).context("failed to serialize wellness")?,
                check.weight_kg,
                rfc3339(check.updated_at)?,
            ],
        )
        .context("failed to update check")?;
    if changed == 0 {
        return Err(not_found("check", check.id));
    }
    Ok(())
}

const CHECK_COLUMNS: &str =
    "check_id, timestamp_ms, is_dry_day, is_saved, wellness_json, weight_kg, created_at, updated_at";

fn delete_check_row(conn: &Connection, id: CheckId) -> Result<CheckEntry> {
    let Some(existing) = get_check_row(conn, id)? else {
        return Err(not_found("check", id));
    };
    conn.execute("DELETE FROM checks WHERE check_id = ?1", params![id.to_string()])
        .context("failed to delete check")?;
    Ok(existing)
}

fn get_check_row(conn: &Connection, id: CheckId) -> Result<Option<CheckEntry>> {
    let row = conn
        .query_row(
            &format!("SELECT {CHECK_COLUMNS} FROM checks WHERE check_id = ?1"),
            params![id.to_string()],
            CheckRow::from_row,
        )
        .optional()
        .context("failed to read check")?;
    row.map(CheckRow::decode).transpose()
}

/// Check-ins in insertion order so duplicate resolution sees the oldest first.
fn load_checks(
    conn: &Connection,
    from_ms: Option<i64>,
    to_ms: Option<i64>,
) -> Result<Vec<CheckEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CHECK_COLUMNS} FROM checks
         WHERE (?1 IS NULL OR timestamp_ms >= ?1) AND (?2 IS NULL OR timestamp_ms <= ?2)
         ORDER BY rowid ASC"
    ))?;
    let rows = stmt.query_map(params![from_ms, to_ms], CheckRow::from_row)?;

    let mut checks = Vec::new();
    for row in rows {
        checks.push(row?.decode()?);
    }
    Ok(checks)
}

struct CheckRow {
    check_id: String,
    timestamp_ms: i64,
    is_dry_day: bool,
    is_saved: bool,
    wellness_json: String,
    weight_kg: Option<f64>,
    created_at: String,
    updated_at: String,
}

impl CheckRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            check_id: row.get(0)?,
            timestamp_ms: row.get(1)?,
            is_dry_day: row.get(2)?,
            is_saved: row.get(3)?,
            wellness_json: row.get(4)?,
            weight_kg: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn decode(self) -> Result<CheckEntry> {
        let wellness: WellnessFlags = serde_json::from_str(&self.wellness_json)
            .with_context(|| format!("failed to deserialize wellness for check {}", self.check_id))?;
        Ok(CheckEntry {
            id: CheckId::parse(&self.check_id)?,
            timestamp_ms: self.timestamp_ms,
            is_dry_day: self.is_dry_day,
            wellness,
            weight_kg: self.weight_kg,
            is_saved: self.is_saved,
            created_at: parse_rfc3339(&self.created_at)?,
            updated_at: parse_rfc3339(&self.updated_at)?,
        })
    }
}

fn insert_archive_row(conn: &Connection, archive: &PeriodArchive) -> Result<()> {
    conn.execute(
        "INSERT INTO archives(
            archive_id, start_date_ms, end_date_ms, mode, total_balance, logs_json,
            created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            archive.id.to_string(),
            archive.start_date_ms,
            archive.end_date_ms,
            archive.mode.as_str(),
            archive.total_balance,
            serde_json::to_string(&archive.logs).context("failed to serialize archive logs")?,
            rfc3339(archive.created_at)?,
            rfc3339(archive.updated_at)?,
        ],
    )
    .context("failed to insert archive")?;
    Ok(())
}

fn update_archive_snapshot(conn: &Connection, archive: &PeriodArchive) -> Result<()> {
    conn.execute(
        "UPDATE archives SET total_balance = ?2, logs_json = ?3, updated_at = ?4
         WHERE archive_id = ?1",
        params![
            archive.id.to_string(),
            archive.total_balance,
            serde_json::to_string(&archive.logs).context("failed to serialize archive logs")?,
            rfc3339(archive.updated_at)?,
        ],
    )
    .context("failed to update archive snapshot")?;
    Ok(())
}

fn archive_exists_with_start(conn: &Connection, start_date_ms: i64) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM archives WHERE start_date_ms = ?1)",
            params![start_date_ms],
            |row| row.get::<_, i64>(0),
        )
        .context("failed to look up archive by start")?;
    Ok(exists == 1)
}

/// Archives ordered by start; `ending_at_or_after` keeps only those whose end is not earlier.
fn load_archives(conn: &Connection, ending_at_or_after: Option<i64>) -> Result<Vec<PeriodArchive>> {
    let mut stmt = conn.prepare(
        "SELECT archive_id, start_date_ms, end_date_ms, mode, total_balance, logs_json,
                created_at, updated_at
         FROM archives
         WHERE (?1 IS NULL OR end_date_ms >= ?1)
         ORDER BY start_date_ms ASC",
    )?;
    let mut rows = stmt.query(params![ending_at_or_after])?;

    let mut archives = Vec::new();
    while let Some(row) = rows.next()? {
        let archive_id: String = row.get(0)?;
        let mode_raw: String = row.get(3)?;
        let logs_json: String = row.get(5)?;
        archives.push(PeriodArchive {
            id: ArchiveId::parse(&archive_id)?,
            start_date_ms: row.get(1)?,
            end_date_ms: row.get(2)?,
            mode: PeriodMode::parse(&mode_raw)
                .ok_or_else(|| anyhow!("unknown period mode: {mode_raw}"))?,
            total_balance: row.get(4)?,
            logs: serde_json::from_str(&logs_json)
                .with_context(|| format!("failed to deserialize logs of archive {archive_id}"))?,
            created_at: parse_rfc3339(&row.get::<_, String>(6)?)?,
            updated_at: parse_rfc3339(&row.get::<_, String>(7)?)?,
        });
    }
    Ok(archives)
}

fn load_setting<T: DeserializeOwned>(conn: &Connection, key: &str) -> Result<Option<T>> {
    let raw = conn
        .query_row("SELECT value_json FROM settings WHERE key = ?1", params![key], |row| {
            row.get::<_, String>(0)
        })
        .optional()
        .with_context(|| format!("failed to read setting {key}"))?;

    match raw {
        Some(json) => {
            let value = serde_json::from_str(&json)
                .with_context(|| format!("failed to deserialize setting {key}"))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn save_setting<T: Serialize>(conn: &Connection, key: &str, value: &T) -> Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json,
                                        updated_at = excluded.updated_at",
        params![
            key,
            serde_json::to_string(value)
                .with_context(|| format!("failed to serialize setting {key}"))?,
            now_rfc3339()?,
        ],
    )
    .with_context(|| format!("failed to persist setting {key}"))?;
    Ok(())
}

fn load_period_settings(conn: &Connection) -> Result<PeriodSettings> {
    Ok(load_setting(conn, PERIOD_SETTINGS_KEY)?.unwrap_or_default())
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "logs")? {
        return Ok((0, false));
    }

    if table_exists(conn, "archives")? {
        return Ok((2, true));
    }

    Ok((1, true))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
