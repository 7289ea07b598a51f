use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;

struct Workspace {
    _dir: tempfile::TempDir,
    db: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("failed to create temp dir: {err}"));
        let db = dir.path().join("gym.db");
        Self { _dir: dir, db }
    }

    fn backups_dir(&self) -> PathBuf {
        self.db.with_file_name("backups")
    }

    fn run<I, S>(&self, args: I) -> Output
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Command::new(env!("CARGO_BIN_EXE_gymctl"))
            .env_remove("GYM_DB_PATH")
            .env_remove("GYM_BACKUPS_DIR")
            .env_remove("GYM_BACKUP_PREFIX")
            .env("RUST_LOG", "off")
            .arg("--db")
            .arg(&self.db)
            .args(args)
            .output()
            .unwrap_or_else(|err| panic!("failed to execute gymctl binary: {err}"))
    }

    fn run_json<I, S>(&self, args: I) -> Value
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.run(args);
        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            panic!(
                "gymctl command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
                output.status, stdout, stderr
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let value: Value = serde_json::from_str(&stdout)
            .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"));
        assert_eq!(as_str(&value, "contract_version"), "gymctl.v1");
        value
    }

    fn run_failure<I, S>(&self, args: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.run(args);
        assert!(!output.status.success(), "command unexpectedly succeeded");
        String::from_utf8_lossy(&output.stderr).to_string()
    }
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_bool(value: &Value, key: &str) -> bool {
    value
        .get(key)
        .and_then(Value::as_bool)
        .unwrap_or_else(|| panic!("missing boolean field `{key}` in payload: {value}"))
}

fn as_array<'a>(value: &'a Value, key: &str) -> &'a Vec<Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing array field `{key}` in payload: {value}"))
}

fn file_count(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(Iterator::count).unwrap_or(0)
}

#[test]
fn status_and_dry_run_do_not_create_the_database() {
    let ws = Workspace::new();

    let status = ws.run_json(["db", "status"]);
    assert!(!as_bool(&status, "up_to_date"));
    assert_eq!(as_i64(&status, "current_version"), 0);
    assert_eq!(as_array(&status, "pending").len(), 11);

    let dry_run = ws.run_json(["db", "migrate", "--dry-run"]);
    assert!(as_bool(&dry_run, "dry_run"));
    assert_eq!(as_array(&dry_run, "would_apply").len(), 11);
    assert!(!ws.db.exists());
}

#[test]
fn migrate_applies_everything_once() {
    let ws = Workspace::new();

    let first = ws.run_json(["db", "migrate"]);
    assert_eq!(as_array(&first, "applied").len(), 11);
    assert!(as_array(&first, "failed").is_empty());
    assert!(as_bool(&first, "up_to_date"));
    assert!(ws.db.exists());
    let bytes_after_first = std::fs::read(&ws.db).unwrap_or_else(|err| panic!("read db: {err}"));

    let second = ws.run_json(["db", "migrate"]);
    assert!(as_array(&second, "applied").is_empty());
    assert_eq!(as_i64(&second, "before_version"), as_i64(&second, "after_version"));
    let bytes_after_second = std::fs::read(&ws.db).unwrap_or_else(|err| panic!("read db: {err}"));
    assert_eq!(bytes_after_first, bytes_after_second);

    let integrity = ws.run_json(["db", "integrity-check"]);
    assert!(as_bool(&integrity, "quick_check_ok"));
    assert!(as_array(&integrity, "foreign_key_violations").is_empty());
}

#[test]
fn backup_create_list_and_delete() {
    let ws = Workspace::new();

    let created = ws.run_json(["backup", "create", "--category", "automatic"]);
    let backup = created.get("backup").unwrap_or_else(|| panic!("missing backup: {created}"));
    let name = as_str(backup, "name").to_string();
    assert!(name.starts_with("gym_backup_"));
    assert_eq!(as_str(backup, "category"), "automatic");
    assert!(ws.backups_dir().join("automatic").join(&name).exists());

    let listed = ws.run_json(["backup", "list"]);
    assert_eq!(as_i64(&listed, "count"), 1);

    let deleted = ws.run_json(["backup", "delete", "--name", &name, "--category", "automatic"]);
    assert_eq!(as_str(&deleted, "deleted"), name);
    assert_eq!(file_count(&ws.backups_dir().join("automatic")), 0);

    let stderr = ws.run_failure(["backup", "delete", "--name", &name, "--category", "automatic"]);
    assert!(stderr.contains("backup not found"), "{stderr}");
}

#[test]
fn restore_brings_back_the_archived_state() {
    let ws = Workspace::new();

    let created = ws.run_json(["backup", "create"]);
    let backup = created.get("backup").unwrap_or_else(|| panic!("missing backup: {created}"));
    let name = as_str(backup, "name").to_string();

    let changed = ws.run_json(["config", "set", "--mantener-backups", "5", "--activo", "false"]);
    let config = changed.get("config").unwrap_or_else(|| panic!("missing config: {changed}"));
    assert_eq!(as_i64(config, "mantener_backups"), 5);

    let restored = ws.run_json(["backup", "restore", "--name", &name]);
    assert!(as_bool(&restored, "restart_advised"));
    let safety = restored.get("safety_backup").unwrap_or_else(|| panic!("missing safety: {restored}"));
    assert_eq!(as_str(safety, "category"), "manual");

    let shown = ws.run_json(["config", "show"]);
    let config = shown.get("config").unwrap_or_else(|| panic!("missing config: {shown}"));
    assert_eq!(as_i64(config, "mantener_backups"), 30);
    assert!(as_bool(config, "activo"));
}

#[test]
fn restore_rejects_malformed_names() {
    let ws = Workspace::new();
    let stderr = ws.run_failure(["backup", "restore", "--name", "../gym.db"]);
    assert!(stderr.contains("invalid backup file name"), "{stderr}");
}

#[test]
fn config_set_validates_input() {
    let ws = Workspace::new();
    let stderr = ws.run_failure(["config", "set", "--hora", "25:00"]);
    assert!(stderr.contains("invalid --hora"), "{stderr}");

    let shown = ws.run_json(["config", "show"]);
    let config = shown.get("config").unwrap_or_else(|| panic!("missing config: {shown}"));
    assert_eq!(as_str(config, "hora"), "03:00");
    assert_eq!(as_str(config, "frecuencia"), "diario");
}

#[test]
fn schedule_next_follows_the_stored_config() {
    let ws = Workspace::new();

    let next = ws.run_json(["schedule", "next"]);
    assert!(as_bool(&next, "activo"));
    assert!(as_str(&next, "next_run_at").contains("T03:00:00"));

    ws.run_json(["config", "set", "--activo", "false"]);
    let disabled = ws.run_json(["schedule", "next"]);
    assert!(disabled.get("next_run_at").is_some_and(Value::is_null));
}

#[test]
fn run_scheduled_respects_the_active_flag() {
    let ws = Workspace::new();

    let ran = ws.run_json(["backup", "run-scheduled"]);
    assert!(as_bool(&ran, "ran"));
    assert_eq!(file_count(&ws.backups_dir().join("automatic")), 1);

    let cleanup = ws.run_json(["backup", "cleanup", "--retention-days", "30"]);
    assert_eq!(as_i64(&cleanup, "deleted"), 0);

    ws.run_json(["config", "set", "--activo", "false"]);
    let skipped = ws.run_json(["backup", "run-scheduled"]);
    assert!(!as_bool(&skipped, "ran"));
}

#[test]
fn custom_backup_locations_are_honoured() {
    let ws = Workspace::new();
    let archive = ws.db.with_file_name("archive");
    let archive_arg = archive.to_str().unwrap_or_else(|| panic!("non UTF-8 temp path"));

    let created = ws.run_json(["--backups-dir", archive_arg, "--backup-prefix", "club", "backup", "create"]);
    let backup = created.get("backup").unwrap_or_else(|| panic!("missing backup: {created}"));
    assert!(as_str(backup, "name").starts_with("club_"));
    assert_eq!(file_count(&archive.join("manual")), 1);
    assert!(!ws.backups_dir().exists());
}
