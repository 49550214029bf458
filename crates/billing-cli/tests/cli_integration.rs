use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("{prefix}-{}", ulid::Ulid::new()));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_billing<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_billing"))
        .args(args)
        .env_remove("BILLING_DB")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute billing binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_billing(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "billing command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
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

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

#[test]
fn db_migrate_reports_versions_and_is_idempotent() {
    let sandbox = unique_temp_dir("billing-cli-db");
    let db = sandbox.join("billing.sqlite3");

    let before = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(as_i64(&before, "current_version"), 0);
    assert_eq!(as_str(&before, "contract_version"), "cli.v1");

    let dry_run = run_json(["--db", path_str(&db), "db", "migrate", "--dry-run"]);
    assert_eq!(
        dry_run.get("would_apply_versions").and_then(Value::as_array).map(Vec::len),
        Some(1)
    );
    let still_empty = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(as_i64(&still_empty, "current_version"), 0);

    let migrate = run_json(["--db", path_str(&db), "db", "migrate"]);
    assert_eq!(as_i64(&migrate, "after_version"), 1);
    assert_eq!(migrate.get("up_to_date").and_then(Value::as_bool), Some(true));

    let again = run_json(["--db", path_str(&db), "db", "migrate"]);
    assert_eq!(as_i64(&again, "before_version"), 1);
    assert_eq!(again.get("applied_versions").and_then(Value::as_array).map(Vec::len), Some(0));

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn hash_password_prints_argon2id_phc_string() {
    let output = run_json(["operator", "hash-password", "s3cret"]);
    assert!(as_str(&output, "password_hash").starts_with("$argon2id$"));
}

#[test]
fn operator_group_and_tariff_link_setup_flow() {
    let sandbox = unique_temp_dir("billing-cli-setup");
    let db = sandbox.join("billing.sqlite3");
    let db = path_str(&db);

    let operator = run_json([
        "--db",
        db,
        "operator",
        "create",
        "--login",
        "olga",
        "--password",
        "s3cret",
        "--display-name",
        "Olga",
    ]);
    assert_eq!(as_str(&operator, "login"), "olga");
    assert_eq!(as_str(&operator, "display_name"), "Olga");
    assert!(operator.get("password_hash").is_none());

    let group =
        run_json(["--db", db, "group", "create", "--name", "tariff-editors", "--description", ""]);
    assert_eq!(as_str(&group, "name"), "tariff-editors");

    let grant = run_json([
        "--db",
        db,
        "group",
        "grant",
        "--group",
        "tariff-editors",
        "--capability",
        "tariffs.update",
    ]);
    assert_eq!(as_i64(&grant, "fid"), 3);

    let member =
        run_json(["--db", db, "group", "add-member", "--group", "tariff-editors", "--login", "olga"]);
    assert_eq!(member.get("capabilities"), Some(&serde_json::json!(["tariffs.update"])));

    let link = run_json([
        "--db",
        db,
        "tariff-link",
        "provision",
        "--account-id",
        "70",
        "--tariff-id",
        "2",
    ]);
    assert_eq!(as_i64(&link, "version"), 1);
    assert!(link.get("updated_by").is_some_and(Value::is_null));

    let id = as_i64(&link, "id").to_string();
    let shown = run_json(["--db", db, "tariff-link", "show", "--id", id.as_str()]);
    assert_eq!(as_i64(&shown, "account_id"), 70);
    assert_eq!(as_i64(&shown, "tariff_id"), 2);

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn invalid_input_fails_without_json_output() {
    let sandbox = unique_temp_dir("billing-cli-invalid");
    let db = sandbox.join("billing.sqlite3");
    let db = path_str(&db);

    let unknown_capability = run_billing([
        "--db",
        db,
        "group",
        "grant",
        "--group",
        "nobody",
        "--capability",
        "tariffs.delete",
    ]);
    assert!(!unknown_capability.status.success());

    let bad_link = run_billing([
        "--db",
        db,
        "tariff-link",
        "provision",
        "--account-id",
        "0",
        "--tariff-id",
        "2",
    ]);
    assert!(!bad_link.status.success());
    assert!(String::from_utf8_lossy(&bad_link.stderr).contains("account_id"));

    let missing = run_billing(["--db", db, "tariff-link", "show", "--id", "404"]);
    assert!(!missing.status.success());
    assert!(missing.stdout.is_empty());

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn duplicate_operator_login_is_rejected() {
    let sandbox = unique_temp_dir("billing-cli-duplicate");
    let db = sandbox.join("billing.sqlite3");
    let db = path_str(&db);

    let create = ["--db", db, "operator", "create", "--login", "ivan", "--password", "pw"];
    let _first = run_json(create);
    let second = run_billing(create);
    assert!(!second.status.success());
    assert!(String::from_utf8_lossy(&second.stderr).contains("already exists"));

    let _ = fs::remove_dir_all(&sandbox);
}
