use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use gym_store_core::{next_run_after, BackupCategory, BackupConfig, BackupFrequency, BackupTime};
use gym_store_sqlite::{
    load_backup_config, open_store, run_scheduled_backup, save_backup_config, BackupManager,
    MigrationReport, SchemaManager, SnapshotStore, StorePaths,
};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::warn;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "gymctl.v1";
const DEFAULT_LOG_FILTER: &str = "gymctl=info,gym_store_sqlite=info";

#[derive(Debug, Parser)]
#[command(name = "gymctl")]
#[command(about = "Gym database store, migrations and backup archive")]
struct Cli {
    #[arg(long, env = "GYM_DB_PATH", default_value = "./gym.db")]
    db: PathBuf,

    /// Defaults to `<db dir>/backups`.
    #[arg(long, env = "GYM_BACKUPS_DIR")]
    backups_dir: Option<PathBuf>,

    #[arg(long, env = "GYM_BACKUP_PREFIX")]
    backup_prefix: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Backup {
        #[command(subcommand)]
        command: Box<BackupCommand>,
    },
    Config {
        #[command(subcommand)]
        command: Box<ConfigCommand>,
    },
    Schedule {
        #[command(subcommand)]
        command: Box<ScheduleCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    Migrate(DbMigrateArgs),
    Status,
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum BackupCommand {
    Create(BackupCreateArgs),
    List,
    Restore(BackupTargetArgs),
    Delete(BackupTargetArgs),
    Cleanup(BackupCleanupArgs),
    RunScheduled,
}

#[derive(Debug, Args)]
struct BackupCreateArgs {
    #[arg(long, value_enum, default_value_t = CategoryArg::Manual)]
    category: CategoryArg,
}

#[derive(Debug, Args)]
struct BackupTargetArgs {
    #[arg(long)]
    name: String,
    #[arg(long, value_enum, default_value_t = CategoryArg::Manual)]
    category: CategoryArg,
}

#[derive(Debug, Args)]
struct BackupCleanupArgs {
    /// Defaults to the stored `mantener_backups`.
    #[arg(long)]
    retention_days: Option<u32>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    Show,
    Set(ConfigSetArgs),
}

#[derive(Debug, Args)]
struct ConfigSetArgs {
    #[arg(long, value_enum)]
    frecuencia: Option<FrequencyArg>,
    #[arg(long)]
    hora: Option<String>,
    #[arg(long)]
    mantener_backups: Option<u32>,
    #[arg(long)]
    activo: Option<bool>,
}

#[derive(Debug, Subcommand)]
enum ScheduleCommand {
    Next,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CategoryArg {
    Manual,
    Automatic,
}

impl From<CategoryArg> for BackupCategory {
    fn from(value: CategoryArg) -> Self {
        match value {
            CategoryArg::Manual => Self::Manual,
            CategoryArg::Automatic => Self::Automatic,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FrequencyArg {
    Diario,
    Semanal,
    Mensual,
}

impl From<FrequencyArg> for BackupFrequency {
    fn from(value: FrequencyArg) -> Self {
        match value {
            FrequencyArg::Diario => Self::Diario,
            FrequencyArg::Semanal => Self::Semanal,
            FrequencyArg::Mensual => Self::Mensual,
        }
    }
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

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

fn store_paths(cli: &Cli) -> StorePaths {
    let mut paths = StorePaths::for_database(&cli.db);
    if let Some(dir) = cli.backups_dir.as_ref() {
        paths = paths.with_backups_dir(dir);
    }
    if let Some(prefix) = cli.backup_prefix.as_ref() {
        paths = paths.with_backup_prefix(prefix);
    }
    paths
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let paths = store_paths(&cli);
    match cli.command {
        Command::Db { command } => run_db(*command, &paths),
        Command::Backup { command } => run_backup(*command, &paths),
        Command::Config { command } => run_config(*command, &paths),
        Command::Schedule { command } => run_schedule(*command, &paths),
    }
}

/// Load the live file and apply pending migrations before any other work.
fn open_ready(paths: &StorePaths) -> Result<(SnapshotStore, MigrationReport)> {
    let (store, report) = open_store(paths)
        .with_context(|| format!("failed to open gym database at {}", paths.db_path.display()))?;
    if !report.is_clean() {
        warn!("{} migrations failed and will be retried on next start", report.failed.len());
    }
    Ok((store, report))
}

fn backup_manager(paths: &StorePaths) -> Result<BackupManager> {
    BackupManager::new(paths.clone()).context("invalid backup settings")
}

fn run_db(command: DbCommand, paths: &StorePaths) -> Result<()> {
    match command {
        DbCommand::Migrate(args) => run_db_migrate(&args, paths),
        DbCommand::Status => run_db_status(paths),
        DbCommand::IntegrityCheck => run_db_integrity_check(paths),
    }
}

fn run_db_status(paths: &StorePaths) -> Result<()> {
    let store = SnapshotStore::load(&paths.db_path)
        .with_context(|| format!("failed to load gym database at {}", paths.db_path.display()))?;
    let status = SchemaManager::new(&store).status()?;
    emit_json(serde_json::json!({
        "db_path": paths.db_path,
        "current_version": status.current_version,
        "target_version": status.target_version,
        "applied": status.applied,
        "pending": status.pending,
        "up_to_date": status.pending.is_empty(),
        "inferred_from_legacy": status.inferred_from_legacy
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, paths: &StorePaths) -> Result<()> {
    let store = SnapshotStore::load(&paths.db_path)
        .with_context(|| format!("failed to load gym database at {}", paths.db_path.display()))?;
    let mut manager = SchemaManager::new(&store);
    let before = manager.status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply": before.pending,
            "inferred_from_legacy": before.inferred_from_legacy
        }));
    }

    let report = manager.apply_pending().context("failed to apply migrations")?;
    let after = manager.status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "applied": report.applied,
        "already_applied": report.already_applied,
        "failed": report.failed,
        "up_to_date": after.pending.is_empty()
    }))
}

fn run_db_integrity_check(paths: &StorePaths) -> Result<()> {
    let (store, _) = open_ready(paths)?;
    let report = store.integrity_check()?;
    let status = SchemaManager::new(&store).status()?;
    emit_json(serde_json::json!({
        "quick_check_ok": report.quick_check_ok,
        "quick_check_message": report.quick_check_message,
        "foreign_key_violations": report.foreign_key_violations,
        "schema_up_to_date": status.pending.is_empty(),
        "current_version": status.current_version
    }))
}

fn run_backup(command: BackupCommand, paths: &StorePaths) -> Result<()> {
    let manager = backup_manager(paths)?;
    let (mut store, _) = open_ready(paths)?;
    match command {
        BackupCommand::Create(args) => {
            let record = manager.create(args.category.into())?;
            emit_json(serde_json::json!({ "backup": record }))
        }
        BackupCommand::List => {
            let backups = manager.list()?;
            emit_json(serde_json::json!({
                "backups_dir": manager.paths().backups_dir,
                "count": backups.len(),
                "backups": backups
            }))
        }
        BackupCommand::Restore(args) => {
            let outcome = manager.restore(&mut store, &args.name, args.category.into())?;
            let migrations = SchemaManager::new(&store)
                .apply_pending()
                .context("failed to migrate restored database")?;
            warn!("database restored from {}; restarting running services is advised", args.name);
            emit_json(serde_json::json!({
                "restored": outcome.restored,
                "safety_backup": outcome.safety_backup,
                "migrations": migrations,
                "restart_advised": true
            }))
        }
        BackupCommand::Delete(args) => {
            let category = BackupCategory::from(args.category);
            manager.delete(&args.name, category)?;
            emit_json(serde_json::json!({
                "deleted": args.name,
                "category": category
            }))
        }
        BackupCommand::Cleanup(args) => {
            let retention_days = match args.retention_days {
                Some(days) => days,
                None => load_backup_config(store.conn())?.mantener_backups,
            };
            if retention_days == 0 {
                return Err(anyhow!("--retention-days must be at least 1"));
            }
            let deleted = manager.cleanup(retention_days)?;
            emit_json(serde_json::json!({
                "retention_days": retention_days,
                "deleted": deleted
            }))
        }
        BackupCommand::RunScheduled => {
            let report = run_scheduled_backup(&store, &manager)?;
            emit_json(serde_json::json!({
                "ran": report.is_some(),
                "report": report
            }))
        }
    }
}

fn run_config(command: ConfigCommand, paths: &StorePaths) -> Result<()> {
    let (store, _) = open_ready(paths)?;
    match command {
        ConfigCommand::Show => {
            let config = load_backup_config(store.conn())?;
            emit_json(serde_json::json!({ "config": config }))
        }
        ConfigCommand::Set(args) => {
            let current = load_backup_config(store.conn())?;
            let updated = apply_config_changes(current, &args)?;
            save_backup_config(&store, &updated).context("failed to save backup config")?;
            emit_json(serde_json::json!({ "config": updated }))
        }
    }
}

fn apply_config_changes(mut config: BackupConfig, args: &ConfigSetArgs) -> Result<BackupConfig> {
    if let Some(frecuencia) = args.frecuencia {
        config.frecuencia = frecuencia.into();
    }
    if let Some(hora) = args.hora.as_deref() {
        config.hora = hora.parse::<BackupTime>().map_err(|err| anyhow!("invalid --hora: {err}"))?;
    }
    if let Some(days) = args.mantener_backups {
        config.mantener_backups = days;
    }
    if let Some(activo) = args.activo {
        config.activo = activo;
    }
    config.validate().map_err(|err| anyhow!("invalid backup config: {err}"))?;
    Ok(config)
}

fn run_schedule(command: ScheduleCommand, paths: &StorePaths) -> Result<()> {
    match command {
        ScheduleCommand::Next => {
            let (store, _) = open_ready(paths)?;
            let config = load_backup_config(store.conn())?;
            let now = OffsetDateTime::now_utc();
            let next = next_run_after(&config, now)
                .map(|at| at.format(&Rfc3339))
                .transpose()
                .context("failed to format next run time")?;
            emit_json(serde_json::json!({
                "activo": config.activo,
                "frecuencia": config.frecuencia,
                "hora": config.hora,
                "evaluated_at": now.format(&Rfc3339).context("failed to format current time")?,
                "next_run_at": next
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_args() -> ConfigSetArgs {
        ConfigSetArgs { frecuencia: None, hora: None, mantener_backups: None, activo: None }
    }

    #[test]
    fn config_changes_only_touch_given_fields() {
        let args = ConfigSetArgs {
            frecuencia: Some(FrequencyArg::Mensual),
            hora: Some("23:45".to_string()),
            ..set_args()
        };
        let updated = match apply_config_changes(BackupConfig::default(), &args) {
            Ok(config) => config,
            Err(err) => panic!("valid changes rejected: {err}"),
        };
        assert_eq!(updated.frecuencia, BackupFrequency::Mensual);
        assert_eq!(updated.hora.to_string(), "23:45");
        assert_eq!(updated.mantener_backups, 30);
        assert!(updated.activo);
    }

    #[test]
    fn config_changes_are_validated() {
        let bad_hour = ConfigSetArgs { hora: Some("25:00".to_string()), ..set_args() };
        assert!(apply_config_changes(BackupConfig::default(), &bad_hour).is_err());

        let zero_days = ConfigSetArgs { mantener_backups: Some(0), ..set_args() };
        assert!(apply_config_changes(BackupConfig::default(), &zero_days).is_err());
    }

    #[test]
    fn store_paths_follow_overrides() {
        let cli = Cli::parse_from([
            "gymctl",
            "--db",
            "/data/gym.db",
            "--backup-prefix",
            "club",
            "db",
            "status",
        ]);
        let paths = store_paths(&cli);
        assert_eq!(paths.backups_dir, PathBuf::from("/data/backups"));
        assert_eq!(paths.backup_prefix, "club");
    }
}
