use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tally_api::{
    AddBeerRequest, AddExerciseRequest, ArchiveRequest, SaveCheckRequest, SetPeriodModeRequest,
    TallyApi, UpdateLogRequest,
};
use tally_core::{CheckId, DayKey, EngineConfig, LogId, PeriodMode, Profile, Sex, WellnessFlags};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "tally")]
#[command(about = "Beer and exercise calorie diary")]
struct Cli {
    #[arg(long, global = true, default_value = "./tally.sqlite3")]
    db: PathBuf,

    /// JSON engine config (day boundary, UTC offset, walk cap, epsilon).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Log {
        #[command(subcommand)]
        command: LogCommand,
    },
    Check {
        #[command(subcommand)]
        command: CheckCommand,
    },
    /// Re-run bonus reconciliation from an instant forward.
    Recalc(RecalcArgs),
    Period {
        #[command(subcommand)]
        command: PeriodCommand,
    },
    Profile {
        #[command(subcommand)]
        command: ProfileCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct DayArg {
    #[arg(long)]
    day: Option<String>,
}

#[derive(Debug, Subcommand)]
enum LogCommand {
    AddBeer(LogBeerArgs),
    AddExercise(LogExerciseArgs),
    Update(LogUpdateArgs),
    Delete(IdArg),
    List(RangeArgs),
}

#[derive(Debug, Args)]
struct LogBeerArgs {
    /// RFC3339 instant or epoch milliseconds; defaults to now.
    #[arg(long)]
    at: Option<String>,
    #[arg(long)]
    volume_ml: f64,
    #[arg(long)]
    abv: f64,
    #[arg(long)]
    carb_factor: Option<f64>,
    #[arg(long, default_value_t = 1)]
    count: u32,
    #[arg(long)]
    style: Option<String>,
    #[arg(long)]
    brand: Option<String>,
    #[arg(long)]
    size_label: Option<String>,
    #[arg(long)]
    rating: Option<u8>,
    #[arg(long, default_value = "")]
    memo: String,
}

#[derive(Debug, Args)]
struct LogExerciseArgs {
    #[arg(long)]
    at: Option<String>,
    #[arg(long = "kind")]
    exercise_key: String,
    #[arg(long)]
    minutes: f64,
    #[arg(long, default_value = "")]
    memo: String,
}

#[derive(Debug, Args)]
struct LogUpdateArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    at: Option<String>,
    #[arg(long)]
    memo: Option<String>,
    #[arg(long = "kind")]
    exercise_key: Option<String>,
    #[arg(long)]
    minutes: Option<f64>,
    #[arg(long)]
    volume_ml: Option<f64>,
    #[arg(long)]
    abv: Option<f64>,
    #[arg(long)]
    carb_factor: Option<f64>,
    #[arg(long)]
    count: Option<u32>,
    #[arg(long)]
    rating: Option<u8>,
}

#[derive(Debug, Args)]
struct IdArg {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct RangeArgs {
    #[arg(long)]
    from: Option<String>,
    #[arg(long)]
    to: Option<String>,
}

#[derive(Debug, Subcommand)]
enum CheckCommand {
    Save(CheckSaveArgs),
    /// Create an unsaved check-in for a day that has none.
    Placeholder(RequiredDayArg),
    Delete(IdArg),
    List(RangeArgs),
    /// Delete duplicate check-ins that lose resolution.
    Dedupe(DayArg),
    /// Per-day balance, dry flag, and streak.
    Days(DaysArgs),
}

#[derive(Debug, Args)]
struct CheckSaveArgs {
    #[arg(long)]
    day: String,
    #[arg(long, default_value_t = false)]
    dry: bool,
    #[arg(long)]
    weight_kg: Option<f64>,
    #[arg(long)]
    slept_well: Option<bool>,
    #[arg(long)]
    hydrated: Option<bool>,
    #[arg(long)]
    headache: Option<bool>,
    #[arg(long)]
    energetic: Option<bool>,
}

#[derive(Debug, Args)]
struct RequiredDayArg {
    #[arg(long)]
    day: String,
}

#[derive(Debug, Args)]
struct DaysArgs {
    #[arg(long)]
    from: String,
    #[arg(long)]
    to: String,
}

#[derive(Debug, Args)]
struct RecalcArgs {
    #[arg(long)]
    from: String,
}

#[derive(Debug, Subcommand)]
enum PeriodCommand {
    Show,
    Rollover,
    Mode(PeriodModeArgs),
    Archive(PeriodArchiveArgs),
    Archives,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Weekly,
    Monthly,
    Custom,
    Permanent,
}

impl From<ModeArg> for PeriodMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Weekly => Self::Weekly,
            ModeArg::Monthly => Self::Monthly,
            ModeArg::Custom => Self::Custom,
            ModeArg::Permanent => Self::Permanent,
        }
    }
}

#[derive(Debug, Args)]
struct PeriodModeArgs {
    #[arg(long, value_enum)]
    mode: ModeArg,
    #[arg(long)]
    start: Option<String>,
    #[arg(long)]
    end: Option<String>,
}

#[derive(Debug, Args)]
struct PeriodArchiveArgs {
    #[arg(long)]
    current_start: String,
    #[arg(long)]
    next_start: String,
    #[arg(long, value_enum)]
    mode: ModeArg,
}

#[derive(Debug, Subcommand)]
enum ProfileCommand {
    Show,
    Set(ProfileSetArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SexArg {
    Female,
    Male,
    Unspecified,
}

#[derive(Debug, Args)]
struct ProfileSetArgs {
    #[arg(long)]
    weight_kg: Option<f64>,
    #[arg(long)]
    height_cm: Option<f64>,
    #[arg(long)]
    age_years: Option<u32>,
    #[arg(long, value_enum)]
    sex: Option<SexArg>,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit<T: serde::Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value).context("failed to serialize command output")?)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let api = TallyApi::new(cli.db, config);

    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Log { command } => run_log(command, &api),
        Command::Check { command } => run_check(command, &api),
        Command::Recalc(args) => emit(&api.recalculate(parse_instant(&args.from)?)?),
        Command::Period { command } => run_period(command, &api),
        Command::Profile { command } => run_profile(command, &api),
    }
}

fn run_db(command: DbCommand, api: &TallyApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy
            }))
        }
        DbCommand::Migrate(args) => emit(&api.migrate(args.dry_run)?),
        DbCommand::Backup(args) => {
            api.backup(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::Restore(args) => {
            let status = api.restore(&args.input)?;
            emit_json(serde_json::json!({
                "restored_from": args.input,
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions
            }))
        }
        DbCommand::IntegrityCheck => emit(&api.integrity_check()?),
    }
}

fn run_log(command: LogCommand, api: &TallyApi) -> Result<()> {
    match command {
        LogCommand::AddBeer(args) => emit(&api.add_beer(AddBeerRequest {
            timestamp_ms: args.at.as_deref().map(parse_instant).transpose()?,
            style: args.style,
            brand: args.brand,
            size_label: args.size_label,
            volume_ml: args.volume_ml,
            abv_percent: args.abv,
            carb_factor: args.carb_factor,
            count: args.count,
            rating: args.rating,
            memo: args.memo,
        })?),
        LogCommand::AddExercise(args) => emit(&api.add_exercise(AddExerciseRequest {
            timestamp_ms: args.at.as_deref().map(parse_instant).transpose()?,
            exercise_key: args.exercise_key,
            minutes: args.minutes,
            memo: args.memo,
        })?),
        LogCommand::Update(args) => {
            let id = LogId::parse(&args.id)?;
            emit(&api.update_log(
                id,
                UpdateLogRequest {
                    timestamp_ms: args.at.as_deref().map(parse_instant).transpose()?,
                    memo: args.memo,
                    exercise_key: args.exercise_key,
                    minutes: args.minutes,
                    volume_ml: args.volume_ml,
                    abv_percent: args.abv,
                    carb_factor: args.carb_factor,
                    count: args.count,
                    rating: args.rating,
                },
            )?)
        }
        LogCommand::Delete(args) => emit(&api.delete_log(LogId::parse(&args.id)?)?),
        LogCommand::List(args) => {
            let (from_ms, to_ms) = parse_range(&args)?;
            let logs = api.list_logs(from_ms, to_ms)?;
            emit_json(serde_json::json!({ "logs": logs }))
        }
    }
}

fn run_check(command: CheckCommand, api: &TallyApi) -> Result<()> {
    match command {
        CheckCommand::Save(args) => emit(&api.save_check(SaveCheckRequest {
            day: DayKey::parse(&args.day)?,
            is_dry_day: args.dry,
            wellness: WellnessFlags {
                slept_well: args.slept_well,
                hydrated: args.hydrated,
                headache: args.headache,
                energetic: args.energetic,
            },
            weight_kg: args.weight_kg,
        })?),
        CheckCommand::Placeholder(args) => emit(&api.ensure_check(DayKey::parse(&args.day)?)?),
        CheckCommand::Delete(args) => emit(&api.delete_check(CheckId::parse(&args.id)?)?),
        CheckCommand::List(args) => {
            let (from_ms, to_ms) = parse_range(&args)?;
            let checks = api.list_checks(from_ms, to_ms)?;
            emit_json(serde_json::json!({ "checks": checks }))
        }
        CheckCommand::Dedupe(args) => {
            let day = args.day.as_deref().map(DayKey::parse).transpose()?;
            let removed = api.dedupe_checks(day)?;
            emit_json(serde_json::json!({ "removed_checks": removed }))
        }
        CheckCommand::Days(args) => {
            let days = api.day_summaries(DayKey::parse(&args.from)?, DayKey::parse(&args.to)?)?;
            emit_json(serde_json::json!({ "days": days }))
        }
    }
}

fn run_period(command: PeriodCommand, api: &TallyApi) -> Result<()> {
    match command {
        PeriodCommand::Show => emit(&api.current_balance()?),
        PeriodCommand::Rollover => emit(&api.check_rollover()?),
        PeriodCommand::Mode(args) => emit(&api.set_period_mode(&SetPeriodModeRequest {
            mode: args.mode.into(),
            custom_start_ms: args.start.as_deref().map(parse_instant).transpose()?,
            custom_end_ms: args.end.as_deref().map(parse_instant).transpose()?,
        })?),
        PeriodCommand::Archive(args) => emit(&api.archive_and_reset(&ArchiveRequest {
            current_start_ms: parse_instant(&args.current_start)?,
            next_start_ms: parse_instant(&args.next_start)?,
            mode: args.mode.into(),
        })?),
        PeriodCommand::Archives => {
            let archives = api.list_archives()?;
            emit_json(serde_json::json!({ "archives": archives }))
        }
    }
}

fn run_profile(command: ProfileCommand, api: &TallyApi) -> Result<()> {
    match command {
        ProfileCommand::Show => emit(&api.get_profile()?),
        ProfileCommand::Set(args) => {
            let current = api.get_profile()?;
            let profile = Profile {
                weight_kg: args.weight_kg.unwrap_or(current.weight_kg),
                height_cm: args.height_cm.unwrap_or(current.height_cm),
                age_years: args.age_years.unwrap_or(current.age_years),
                sex: match args.sex {
                    Some(SexArg::Female) => Sex::Female,
                    Some(SexArg::Male) => Sex::Male,
                    Some(SexArg::Unspecified) => Sex::Unspecified,
                    None => current.sex,
                },
            };
            emit(&api.set_profile(&profile)?)
        }
    }
}

fn parse_range(args: &RangeArgs) -> Result<(Option<i64>, Option<i64>)> {
    Ok((
        args.from.as_deref().map(parse_instant).transpose()?,
        args.to.as_deref().map(parse_instant).transpose()?,
    ))
}

/// Epoch milliseconds, or an RFC3339 instant.
fn parse_instant(raw: &str) -> Result<i64> {
    if let Ok(ms) = raw.parse::<i64>() {
        return Ok(ms);
    }
    let parsed = OffsetDateTime::parse(raw, &Rfc3339)
        .with_context(|| format!("invalid instant (want RFC3339 or epoch ms): {raw}"))?;
    i64::try_from(parsed.unix_timestamp_nanos() / 1_000_000)
        .with_context(|| format!("instant out of range: {raw}"))
}
