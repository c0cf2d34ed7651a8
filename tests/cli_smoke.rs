use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use assert_cmd::Command;
use serde_json::Value;
use tempfile::TempDir;

struct CliTest {
    _tmp: TempDir,
    config_path: PathBuf,
    data_dir: PathBuf,
}

impl CliTest {
    fn new(mode: &str, role: &str) -> Result<Self> {
        let tmp = tempfile::tempdir().context("failed to create temp dir")?;
        let data_dir = tmp.path().join("db");
        fs::create_dir_all(&data_dir).context("failed to create data dir")?;

        let config_path = tmp.path().join("docdbx.conf");
        fs::write(
            &config_path,
            format!(
                "# smoke-test configuration\ndatabase = {}\nencryptionKey = a-cli-smoke-test-passphrase-32-chars!\nmode = {mode}\nrole = {role}\n",
                data_dir.display()
            ),
        )
        .context("failed to write config")?;

        Ok(Self {
            _tmp: tmp,
            config_path,
            data_dir,
        })
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::cargo_bin("docdbx")?;
        cmd.arg(&self.config_path).args(args);
        let output = cmd.output()?;
        anyhow::ensure!(
            output.status.success(),
            "command {:?} failed\nstdout:\n{}\nstderr:\n{}",
            args,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        Ok(String::from_utf8(output.stdout)?)
    }

    fn run_failure(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::cargo_bin("docdbx")?;
        cmd.arg(&self.config_path).args(args);
        let output = cmd.output()?;
        anyhow::ensure!(
            !output.status.success(),
            "command {:?} unexpectedly succeeded",
            args
        );
        Ok(String::from_utf8_lossy(&output.stderr).into_owned())
    }
}

#[test]
fn insert_then_query_round_trips() -> Result<()> {
    let cli = CliTest::new("encrypted", "admin")?;

    cli.run(&["insert", "people", r#"{"id": 1, "name": "Alice"}"#])?;
    cli.run(&["insert", "people", r#"{"id": 2, "name": "Bob"}"#])?;

    let stdout = cli.run(&["query", "people", r#"{"id": 2}"#])?;
    let records: Value = serde_json::from_str(&stdout)?;
    assert_eq!(records, serde_json::json!([{"id": 2, "name": "Bob"}]));
    Ok(())
}

#[test]
fn query_supports_sort_limit_and_projection() -> Result<()> {
    let cli = CliTest::new("plain", "admin")?;
    for record in [r#"{"n": 2, "x": "b"}"#, r#"{"n": 1, "x": "a"}"#, r#"{"n": 3, "x": "c"}"#] {
        cli.run(&["insert", "nums", record])?;
    }

    let stdout = cli.run(&[
        "query", "nums", "{}", "--sort", r#"{"n": -1}"#, "--limit", "2", "--project", "n",
    ])?;
    let records: Value = serde_json::from_str(&stdout)?;
    assert_eq!(records, serde_json::json!([{"n": 3}, {"n": 2}]));
    Ok(())
}

#[test]
fn update_and_delete_report_counts() -> Result<()> {
    let cli = CliTest::new("plain", "admin")?;
    cli.run(&["insert", "stock", r#"{"sku": "a", "qty": 1}"#])?;
    cli.run(&["insert", "stock", r#"{"sku": "b", "qty": 7}"#])?;

    let stdout = cli.run(&["update", "stock", r#"{"sku": "a"}"#, r#"{"qty": 9}"#])?;
    assert!(stdout.contains("updated 1 record(s)"));

    let stdout = cli.run(&["delete", "stock", r#"{"qty": {"$lt": 8}}"#])?;
    assert!(stdout.contains("deleted 1 record(s)"));
    Ok(())
}

#[test]
fn index_command_creates_and_drops_the_sidecar() -> Result<()> {
    let cli = CliTest::new("plain", "admin")?;
    cli.run(&["insert", "users", r#"{"city": "berlin"}"#])?;

    cli.run(&["index", "users", "city"])?;
    let index_path = cli.data_dir.join("users.index.city.json");
    assert!(index_path.exists());

    cli.run(&["index", "users", "city", "--drop"])?;
    assert!(!index_path.exists());
    Ok(())
}

#[test]
fn aggregate_pipeline_runs_from_the_cli() -> Result<()> {
    let cli = CliTest::new("plain", "admin")?;
    cli.run(&["insert", "sales", r#"{"region": "eu", "amount": 10}"#])?;
    cli.run(&["insert", "sales", r#"{"region": "eu", "amount": 20}"#])?;

    let stdout = cli.run(&[
        "aggregate",
        "sales",
        r#"[{"$group": {"_id": {"region": "region"}, "total": {"$sum": "amount"}}}]"#,
    ])?;
    let results: Value = serde_json::from_str(&stdout)?;
    assert_eq!(results[0]["_id"], serde_json::json!("eu"));
    assert_eq!(results[0]["total"].as_f64(), Some(30.0));
    Ok(())
}

#[test]
fn collections_lists_what_exists() -> Result<()> {
    let cli = CliTest::new("plain", "admin")?;
    cli.run(&["insert", "alpha", "{}"])?;
    cli.run(&["insert", "beta", "{}"])?;

    let stdout = cli.run(&["collections"])?;
    let names: Vec<&str> = stdout.lines().collect();
    assert_eq!(names, vec!["alpha", "beta"]);
    Ok(())
}

#[test]
fn backup_then_restore_round_trips() -> Result<()> {
    let cli = CliTest::new("plain", "admin")?;
    cli.run(&["insert", "docs", r#"{"id": 1}"#])?;

    let stdout = cli.run(&["backup"])?;
    let backup_dir = stdout
        .trim()
        .strip_prefix("backup written to ")
        .context("backup output names the directory")?
        .to_string();

    cli.run(&["delete", "docs", "{}"])?;
    cli.run(&["restore", &backup_dir])?;

    let stdout = cli.run(&["query", "docs", "{}"])?;
    let records: Value = serde_json::from_str(&stdout)?;
    assert_eq!(records, serde_json::json!([{"id": 1}]));
    Ok(())
}

#[test]
fn reader_role_is_denied_inserts() -> Result<()> {
    let cli = CliTest::new("plain", "reader")?;
    let stderr = cli.run_failure(&["insert", "notes", r#"{"id": 1}"#])?;
    assert!(stderr.contains("permission"));
    assert!(stderr.contains("query"));
    Ok(())
}

#[test]
fn invalid_json_arguments_fail_with_context() -> Result<()> {
    let cli = CliTest::new("plain", "admin")?;
    let stderr = cli.run_failure(&["insert", "notes", "{not json"])?;
    assert!(stderr.contains("not valid JSON"));
    Ok(())
}

#[test]
fn unknown_filter_operator_is_reported() -> Result<()> {
    let cli = CliTest::new("plain", "admin")?;
    cli.run(&["insert", "notes", r#"{"id": 1}"#])?;
    let stderr = cli.run_failure(&["query", "notes", r#"{"id": {"$regex": "x"}}"#])?;
    assert!(stderr.contains("unknown filter operator"));
    Ok(())
}
