//! CLI contract tests: subcommands and exit codes.

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use callsift::checkpoint::{CallState, CheckpointStore, StateMap};
use serde_json::json;

struct Workspace {
    dir: tempfile::TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let root = dir.path().display();
        let config = format!(
            r#"
[paths]
source = '{root}/calls.json'
checkpoint = '{root}/outputs/final_analysis.json'
audit_report = '{root}/outputs/audit_report.json'
logs_dir = '{root}/logs'
env_file = '{root}/.env'

[model]
api_key_env = "CALLSIFT_TEST_UNSET_KEY"
"#
        );
        fs::write(dir.path().join("callsift.toml"), config).expect("write config");
        Self { dir }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    fn store(&self) -> CheckpointStore {
        CheckpointStore::new(self.path("outputs/final_analysis.json"))
    }

    fn cmd(&self, subcommand: &str) -> Command {
        let mut cmd = Command::cargo_bin("callsift").expect("binary should build");
        cmd.arg("--config")
            .arg(self.path("callsift.toml"))
            .arg(subcommand)
            .env_remove("CALLSIFT_CONFIG")
            .env_remove("CALLSIFT_SOURCE")
            .env_remove("CALLSIFT_CHECKPOINT")
            .env_remove("CALLSIFT_TEST_UNSET_KEY")
            .current_dir(self.dir.path());
        cmd
    }
}

fn write_source(path: &Path, body: &str) {
    fs::write(path, body).expect("write source");
}

fn stdout_of(cmd: &mut Command, code: i32) -> String {
    let output = cmd.output().expect("command runs");
    assert_eq!(
        output.status.code(),
        Some(code),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).to_string()
}

#[test]
fn help_lists_subcommands() {
    let output = Command::cargo_bin("callsift")
        .expect("binary should build")
        .arg("--help")
        .output()
        .expect("command runs");
    assert!(output.status.success());
    let help = String::from_utf8_lossy(&output.stdout);
    for sub in ["run", "status", "audit", "verify"] {
        assert!(help.contains(sub), "help should list {sub}: {help}");
    }
}

#[test]
fn status_on_fresh_workspace_is_clean() {
    let ws = Workspace::new();
    let stdout = stdout_of(&mut ws.cmd("status"), 0);
    assert!(stdout.contains("done:"));
    assert!(stdout.contains("Fresh"));
}

#[test]
fn status_reports_counts() {
    let ws = Workspace::new();
    let mut states = StateMap::new();
    let mut done = CallState::pending("CALL-1", "d1");
    done.complete(json!({"call_id": "CALL-1"}));
    states.insert("CALL-1".to_owned(), done);
    states.insert("CALL-2".to_owned(), CallState::pending("CALL-2", "d2"));
    ws.store().commit(&states).expect("commit");

    let stdout = stdout_of(&mut ws.cmd("status"), 0);
    assert!(stdout.contains("done:       1"));
    assert!(stdout.contains("pending:    1"));
}

#[test]
fn corrupt_checkpoint_exits_with_corrupt_state_code() {
    let ws = Workspace::new();
    let store = ws.store();
    fs::create_dir_all(ws.path("outputs")).expect("mkdir");
    fs::write(store.primary_path(), "{\"version\": 1, \"calls\": {").expect("write primary");
    fs::write(store.backup_path(), "garbage").expect("write backup");

    let output = ws.cmd("status").output().expect("command runs");
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn audit_flags_fabricated_identifier() {
    let ws = Workspace::new();
    write_source(
        &ws.path("calls.json"),
        r#"[{"call_id": "CALL-1", "transcript": "Customer: my case is CASE-4471."}]"#,
    );
    let source = callsift::transcript::SourceSnapshot::load(&ws.path("calls.json"))
        .expect("source loads");
    let digest = source.digest("CALL-1").expect("digest").to_owned();

    let mut state = CallState::pending("CALL-1", digest);
    state.complete(json!({
        "call_id": "CALL-1",
        "entities": {"case_ids": ["CASE-4471", "CASE-9999"]}
    }));
    ws.store()
        .commit(&StateMap::from([("CALL-1".to_owned(), state)]))
        .expect("commit");

    let stdout = stdout_of(&mut ws.cmd("audit"), 3);
    assert!(stdout.contains("\"fabricated\": 1"));

    let report = fs::read_to_string(ws.path("outputs/audit_report.json")).expect("report");
    assert!(report.contains("CASE-9999"));
}

#[test]
fn audit_with_pending_work_is_incomplete() {
    let ws = Workspace::new();
    write_source(
        &ws.path("calls.json"),
        r#"[{"call_id": "CALL-1", "transcript": "hello"}]"#,
    );
    ws.store()
        .commit(&StateMap::from([(
            "CALL-1".to_owned(),
            CallState::pending("CALL-1", "d"),
        )]))
        .expect("commit");

    stdout_of(&mut ws.cmd("audit"), 1);
}

#[test]
fn verify_prunes_backup_of_complete_checkpoint() {
    let ws = Workspace::new();
    write_source(
        &ws.path("calls.json"),
        r#"[{"call_id": "CALL-1", "transcript": "hello"}]"#,
    );
    let mut state = CallState::pending("CALL-1", "d");
    state.complete(json!({"call_id": "CALL-1"}));
    let states = StateMap::from([("CALL-1".to_owned(), state)]);
    let store = ws.store();
    store.commit(&states).expect("first commit");
    store.commit(&states).expect("second commit");
    assert!(store.backup_path().exists());

    let stdout = stdout_of(&mut ws.cmd("verify"), 0);
    assert!(stdout.contains("backup deleted"));
    assert!(!store.backup_path().exists());
}

#[test]
fn run_without_api_key_is_fatal() {
    let ws = Workspace::new();
    write_source(
        &ws.path("calls.json"),
        r#"[{"call_id": "CALL-1", "transcript": "hello"}]"#,
    );

    let output = ws.cmd("run").output().expect("command runs");
    assert_eq!(output.status.code(), Some(4));
    assert!(String::from_utf8_lossy(&output.stderr).contains("CALLSIFT_TEST_UNSET_KEY"));
}
