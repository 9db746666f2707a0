//! CLI integration tests.
//!
//! Uses `assert_cmd` to spawn the `leadrun` binary and verify exit codes,
//! stdout content, and stderr content. Every run uses the memory backend
//! with stages accepted locally, so nothing leaves the process.

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

/// Variables the binary reads; cleared so the host environment cannot leak in.
const CONFIG_VARS: &[&str] = &[
    "WEBHOOK_SECRET",
    "MASTER_CLIENTS_BASE_ID",
    "AIRTABLE_API_KEY",
    "AIRTABLE_API_URL",
    "BATCH_PROCESSING_STREAM",
    "SMART_RESUME_RUN_ID",
    "LEAD_SCORING_LIMIT",
    "POST_SCORING_LIMIT",
    "API_PUBLIC_BASE_URL",
    "STUCK_LOCK_MINUTES",
    "MIN_SERVICE_LEVEL",
    "MAX_STREAMS",
    "STORAGE_TIMEOUT_SECS",
    "LEADRUN_BACKEND",
    "PORT",
    "RUST_LOG",
];

fn leadrun() -> Command {
    let mut cmd = cargo_bin_cmd!("leadrun");
    for var in CONFIG_VARS {
        cmd.env_remove(var);
    }
    cmd
}

/// Write a seed file with the given clients and return its path.
fn seed(dir: &TempDir, clients: serde_json::Value) -> PathBuf {
    let path = dir.path().join("clients.json");
    fs::write(&path, serde_json::json!({ "clients": clients }).to_string()).unwrap();
    path
}

fn two_clients(dir: &TempDir) -> PathBuf {
    seed(
        dir,
        serde_json::json!([
            {"clientId": "acme", "clientName": "Acme", "status": "Active", "serviceLevel": 2, "stream": 1},
            {"clientId": "globex", "clientName": "Globex", "status": "Active", "serviceLevel": 1},
            {"clientId": "initech", "clientName": "Initech", "status": "Inactive", "stream": 1},
            {"clientId": "hooli", "clientName": "Hooli", "status": "Active", "stream": 2}
        ]),
    )
}

/// `leadrun --backend memory --seed <file> run --dry-run ...`
fn dry_run(seed: &PathBuf) -> Command {
    let mut cmd = leadrun();
    cmd.args(["--backend", "memory", "--seed"])
        .arg(seed)
        .args(["run", "--dry-run"]);
    cmd
}

// ──────────────────────────────────────────────
// 1. Help and version
// ──────────────────────────────────────────────

#[test]
fn help_exits_0_with_description() {
    leadrun()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Multi-tenant lead pipeline orchestrator",
        ));
}

#[test]
fn version_exits_0() {
    leadrun()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("leadrun"));
}

// ──────────────────────────────────────────────
// 2. run-id
// ──────────────────────────────────────────────

#[test]
fn run_id_mint_prints_canonical_base() {
    leadrun()
        .args(["run-id", "mint"])
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"^\d{6}-\d{6}\n$").unwrap());
}

#[test]
fn run_id_normalize_keeps_compound_form() {
    leadrun()
        .args(["run-id", "normalize", "250101-120000-acme-co"])
        .assert()
        .success()
        .stdout("250101-120000-acme-co\n");
}

#[test]
fn run_id_normalize_strips_client() {
    leadrun()
        .args(["run-id", "normalize", "--strip-client", "250101-120000-acme-co"])
        .assert()
        .success()
        .stdout("250101-120000\n");
}

#[test]
fn run_id_normalize_json_output() {
    let output = leadrun()
        .args(["--output", "json", "run-id", "normalize", "250101-120000"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["runId"], "250101-120000");
}

#[test]
fn run_id_normalize_rejects_garbage() {
    leadrun()
        .args(["run-id", "normalize", "SR-250101-001-T1-S1"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("unrecognised run id"));
}

#[test]
fn run_id_normalize_rejects_impossible_dates() {
    leadrun()
        .args(["run-id", "normalize", "251301-120000"])
        .assert()
        .code(1);
}

// ──────────────────────────────────────────────
// 3. run
// ──────────────────────────────────────────────

#[test]
fn dry_run_completes_every_client_on_stream() {
    let dir = TempDir::new().unwrap();
    let seed = two_clients(&dir);

    dry_run(&seed)
        .args(["--stream", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("on stream 1: Completed"))
        .stdout(predicate::str::contains("eligible 2, processed 2, succeeded 2"));
}

#[test]
fn dry_run_json_report() {
    let dir = TempDir::new().unwrap();
    let seed = two_clients(&dir);

    let output = leadrun()
        .args(["--output", "json", "--backend", "memory", "--seed"])
        .arg(&seed)
        .args(["run", "--dry-run", "--run-id", "250101-120000"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["runId"], "250101-120000");
    assert_eq!(json["jobId"], "smart_resume_250101-120000_stream1");
    assert_eq!(json["stream"], 1);
    assert_eq!(json["status"], "Completed");
    assert_eq!(json["summary"]["processed"], 2);
}

#[test]
fn stream_defaults_from_environment() {
    let dir = TempDir::new().unwrap();
    let seed = two_clients(&dir);

    dry_run(&seed)
        .env("BATCH_PROCESSING_STREAM", "2")
        .assert()
        .success()
        .stdout(predicate::str::contains("on stream 2: Completed"))
        .stdout(predicate::str::contains("eligible 1"));
}

#[test]
fn client_filter_limits_the_run() {
    let dir = TempDir::new().unwrap();
    let seed = two_clients(&dir);

    dry_run(&seed)
        .args(["--client", "acme"])
        .assert()
        .success()
        .stdout(predicate::str::contains("eligible 1, processed 1"));
}

#[test]
fn empty_stream_has_no_leads_to_score() {
    let dir = TempDir::new().unwrap();
    let seed = seed(&dir, serde_json::json!([]));

    dry_run(&seed)
        .assert()
        .success()
        .stdout(predicate::str::contains("No Leads To Score"));
}

#[test]
fn out_of_range_stream_is_a_configuration_error() {
    let dir = TempDir::new().unwrap();
    let seed = two_clients(&dir);

    dry_run(&seed)
        .args(["--stream", "9"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("stream"));
}

#[test]
fn invalid_run_id_is_a_configuration_error() {
    let dir = TempDir::new().unwrap();
    let seed = two_clients(&dir);

    dry_run(&seed)
        .args(["--run-id", "250101-120000-acme"])
        .assert()
        .code(3);
}

#[test]
fn invalid_environment_fails_before_running() {
    let dir = TempDir::new().unwrap();
    let seed = two_clients(&dir);

    dry_run(&seed)
        .env("SMART_RESUME_RUN_ID", "not-a-run-id")
        .assert()
        .code(3)
        .stderr(predicate::str::contains("SMART_RESUME_RUN_ID"));
}

#[test]
fn http_stages_need_a_public_base_url() {
    let dir = TempDir::new().unwrap();
    let seed = two_clients(&dir);

    leadrun()
        .args(["--backend", "memory", "--seed"])
        .arg(&seed)
        .arg("run")
        .assert()
        .code(3)
        .stderr(predicate::str::contains("API_PUBLIC_BASE_URL"));
}

#[test]
fn airtable_backend_needs_credentials() {
    leadrun()
        .args(["run", "--dry-run"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("MASTER_CLIENTS_BASE_ID"));
}

#[test]
fn missing_seed_file_fails() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("nope.json");

    leadrun()
        .args(["--backend", "memory", "--seed"])
        .arg(&missing)
        .args(["run", "--dry-run"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("cannot read seed file"));
}

#[test]
fn json_errors_are_reported_as_json() {
    let dir = TempDir::new().unwrap();
    let seed = two_clients(&dir);

    let output = leadrun()
        .args(["--output", "json", "--backend", "memory", "--seed"])
        .arg(&seed)
        .args(["run", "--dry-run", "--stream", "0"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(3));
    let stderr = String::from_utf8_lossy(&output.stderr);
    let line = stderr
        .lines()
        .find(|l| l.starts_with('{'))
        .expect("json error line");
    let json: serde_json::Value = serde_json::from_str(line).unwrap();
    assert!(json["error"].as_str().unwrap().contains("stream"));
}

// ──────────────────────────────────────────────
// 4. issues
// ──────────────────────────────────────────────

#[test]
fn issues_list_on_empty_store() {
    leadrun()
        .args(["--backend", "memory", "issues", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No production issues."));
}

#[test]
fn issues_list_json_is_an_array() {
    let output = leadrun()
        .args(["--output", "json", "--backend", "memory", "issues", "list", "--status", "open"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json, serde_json::json!([]));
}

#[test]
fn issues_fix_unknown_record_fails() {
    leadrun()
        .args([
            "--backend", "memory", "issues", "fix", "rec404", "--commit", "abc123",
        ])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("rec404"));
}
