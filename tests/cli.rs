use std::sync::Arc;

use assert_cmd::Command;
use medsync::config::{Config, Paths};
use medsync::storage::Database;
use medsync::sync::connection::{ChannelNetworkMonitor, NetworkReading};
use medsync::sync::transport::MemoryTransport;
use medsync::sync::{OperationKind, SyncOrchestrator};
use predicates::prelude::*;
use serde_json::{json, Value};
use tempfile::TempDir;

fn medsync(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("medsync").unwrap();
    cmd.arg("--data-dir").arg(dir.path()).env_remove("RUST_LOG");
    cmd
}

fn json_output(cmd: &mut Command) -> Value {
    let output = cmd.arg("-o").arg("json").output().unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_status_on_empty_store() {
    let dir = TempDir::new().unwrap();
    medsync(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Sync Status"))
        .stdout(predicate::str::contains("never"));
}

#[test]
fn test_history_empty_json() {
    let dir = TempDir::new().unwrap();
    let value = json_output(medsync(&dir).arg("history"));
    assert_eq!(value["count"], 0);
}

#[test]
fn test_config_init_then_show() {
    let dir = TempDir::new().unwrap();
    medsync(&dir)
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config.yaml"));

    medsync(&dir)
        .args(["config", "init"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));

    let value = json_output(medsync(&dir).args(["config", "show"]));
    assert_eq!(value["sync"]["history_limit"], 50);
    assert_eq!(value["sync"]["conflict_policy"], "intelligent_merge");
}

#[test]
fn test_default_output_comes_from_config() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.general.default_output = medsync::OutputFormat::Json;
    config.save_to_path(&dir.path().join("config.yaml")).unwrap();

    let output = medsync(&dir).arg("status").output().unwrap();
    assert!(output.status.success());
    let value: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["pending_operations"], 0);
}

#[test]
fn test_queue_clear_requires_force() {
    let dir = TempDir::new().unwrap();
    medsync(&dir)
        .args(["queue", "clear"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));
}

#[tokio::test]
async fn test_cli_reads_state_written_by_orchestrator() {
    let dir = TempDir::new().unwrap();
    let paths = Paths::with_root(dir.path().to_path_buf());
    paths.ensure_dirs().unwrap();

    let mut config = Config::default();
    config.sync.auto_sync = false;
    config.sync.background_interval_secs = 0;
    let transport = Arc::new(MemoryTransport::new());
    let orchestrator = SyncOrchestrator::builder(Database::open_at(&paths.database).unwrap(), transport)
        .config(config)
        .build();
    let monitor = ChannelNetworkMonitor::new(NetworkReading::wifi());
    orchestrator.initialize(&monitor).unwrap();
    orchestrator
        .queue_data_change("medication", OperationKind::Create, "m1", json!({"dose": 5}), 5)
        .unwrap();
    orchestrator.perform_sync(None).await.unwrap();
    orchestrator
        .queue_data_change("medication", OperationKind::Update, "m1", json!({"dose": 6}), 7)
        .unwrap();
    orchestrator.shutdown();

    let history = json_output(medsync(&dir).arg("history"));
    assert_eq!(history["count"], 1);
    assert_eq!(history["items"][0]["strategy"], "full");
    assert_eq!(history["items"][0]["operations_processed"], 1);

    let queue = json_output(medsync(&dir).args(["queue", "list"]));
    assert_eq!(queue["count"], 1);
    assert_eq!(queue["items"][0]["priority"], 7);

    let status = json_output(medsync(&dir).arg("status"));
    assert_eq!(status["total_syncs"], 1);
    assert_eq!(status["pending_operations"], 1);
}
