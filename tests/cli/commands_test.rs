//! Exit codes and output of the CLI subcommands.

use std::path::Path;
use std::sync::Arc;

use assert_cmd::Command;
use serde_json::Value;
use warden::analysis::Severity;
use warden::ast::{Expr, Program, Span, Stmt};
use warden::audit::{AuditEventType, AuditPipeline, JsonlAuditStore, NewEvent};
use warden::config::AuditConfig;

fn warden(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("warden").expect("binary built");
    cmd.current_dir(dir)
        .env("WARDEN_CONFIG_PATH", dir.join("absent.toml"))
        .env_remove("WARDEN_BLOCK_THRESHOLD")
        .env("RUST_LOG", "error");
    cmd
}

fn write_program(dir: &Path, program: &Program) -> std::path::PathBuf {
    let path = dir.join(format!("{}.json", program.name));
    std::fs::write(&path, serde_json::to_string(program).expect("encode")).expect("write");
    path
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("json on stdout")
}

#[test]
fn scan_blocks_eval_with_exit_code_two() {
    let dir = tempfile::tempdir().expect("tempdir");
    let span = Span::new(1, 0);
    let program = Program::new(
        "evil",
        vec![Stmt::expr(
            Expr::call(
                Expr::name("eval", span),
                vec![Expr::string("1 + 1", span)],
                span,
            ),
            span,
        )],
    );
    let path = write_program(dir.path(), &program);

    let output = warden(dir.path())
        .arg("scan")
        .arg(&path)
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(2));
    let report = stdout_json(&output);
    assert_eq!(report["blocked"], Value::Bool(true));
    assert_eq!(report["blocking"][0]["classification_id"], "CWE-95");
}

#[test]
fn scan_accepts_clean_program() {
    let dir = tempfile::tempdir().expect("tempdir");
    let span = Span::new(1, 0);
    let program = Program::new("clean", vec![Stmt::assign("x", Expr::int(2, span), span)]);
    let path = write_program(dir.path(), &program);

    let output = warden(dir.path())
        .arg("scan")
        .arg(&path)
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(0));
    let report = stdout_json(&output);
    assert_eq!(report["blocked"], Value::Bool(false));
    assert_eq!(report["findings"], Value::Array(Vec::new()));
}

#[test]
fn scan_rejects_malformed_ast() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("broken.json");
    std::fs::write(&path, "{\"name\": 3}").expect("write");
    warden(dir.path()).arg("scan").arg(&path).assert().failure();
}

#[test]
fn match_reports_glob_decisions() {
    let dir = tempfile::tempdir().expect("tempdir");

    let output = warden(dir.path())
        .args(["match", "file.read:/data/*.json", "/data/a.json"])
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(stdout_json(&output)["matches"], Value::Bool(true));

    let output = warden(dir.path())
        .args(["match", "file.read:/data/*.json", "/data/sub/a.json"])
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(1));
    assert_eq!(stdout_json(&output)["matches"], Value::Bool(false));

    let output = warden(dir.path())
        .args(["match", "file.read:/data/**", "/data/../etc/passwd"])
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(1));
    assert_eq!(stdout_json(&output)["normalized"], "/etc/passwd");
}

#[tokio::test]
async fn verify_audit_detects_tampering() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("audit.jsonl");

    let store = JsonlAuditStore::open(&log).await.expect("open");
    let (audit, task) = AuditPipeline::new(Arc::new(store), &AuditConfig::default())
        .start()
        .await
        .expect("start");
    for resource in ["/data/first.csv", "/data/second.csv"] {
        audit
            .record(
                NewEvent::new(AuditEventType::CapabilityGranted, Severity::Info)
                    .identity("alice")
                    .resource(resource),
            )
            .await
            .expect("record");
    }
    audit.shutdown().await.expect("shutdown");
    task.await.expect("committer");

    let output = warden(dir.path())
        .arg("verify-audit")
        .arg(&log)
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&output.stdout).starts_with("ok: 2 events"));

    let original = std::fs::read_to_string(&log).expect("read");
    std::fs::write(&log, original.replace("/data/first.csv", "/data/forged.csv")).expect("write");

    let output = warden(dir.path())
        .arg("verify-audit")
        .arg(&log)
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stdout).starts_with("tampered:"));
}

#[test]
fn log_dir_flag_enables_file_logging() {
    let dir = tempfile::tempdir().expect("tempdir");
    let logs = dir.path().join("logs");
    let mut log_arg = std::ffi::OsString::from("--log-dir=");
    log_arg.push(&logs);

    warden(dir.path())
        .arg(log_arg)
        .args(["match", "http.get:https://api.example.com/**", "https://api.example.com/v1"])
        .assert()
        .success();
    assert!(logs.is_dir());
}
