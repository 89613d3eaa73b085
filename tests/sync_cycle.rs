use std::sync::Arc;
use std::time::Duration;

use medsync::config::{Config, Paths};
use medsync::storage::Database;
use medsync::sync::connection::{ChannelNetworkMonitor, NetworkReading};
use medsync::sync::transport::MemoryTransport;
use medsync::sync::{OperationKind, SyncEntity, SyncOrchestrator};
use serde_json::json;
use tempfile::TempDir;
use tokio::time::sleep;

fn config(auto_sync: bool) -> Config {
    let mut config = Config::default();
    config.sync.auto_sync = auto_sync;
    config.sync.background_interval_secs = 0;
    config
}

fn open(dir: &TempDir) -> Database {
    let paths = Paths::with_root(dir.path().to_path_buf());
    paths.ensure_dirs().unwrap();
    Database::open_at(&paths.database).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_changes_made_offline_sync_after_reconnection() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(MemoryTransport::new());
    let orchestrator = SyncOrchestrator::builder(open(&dir), transport.clone())
        .config(config(true))
        .build();
    let monitor = ChannelNetworkMonitor::new(NetworkReading::offline());
    orchestrator.initialize(&monitor).unwrap();

    orchestrator
        .queue_data_change("medication", OperationKind::Create, "m1", json!({"name": "aspirin"}), 5)
        .unwrap();
    orchestrator
        .queue_data_change("dose_log", OperationKind::Create, "d1", json!({"taken": true}), 9)
        .unwrap();
    assert_eq!(orchestrator.get_sync_status().unwrap().pending_operations, 2);

    sleep(Duration::from_secs(2)).await;
    monitor.publish(NetworkReading::wifi());
    sleep(Duration::from_secs(7)).await;

    let history = orchestrator.get_sync_history(10).unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].success, "{:?}", history[0].errors);

    let sent = transport.sent_operations();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].entity_id, "d1");
    assert_eq!(orchestrator.get_sync_status().unwrap().pending_operations, 0);

    orchestrator.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_pending_conflict_survives_restart() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(MemoryTransport::new());
    let monitor = ChannelNetworkMonitor::new(NetworkReading::wifi());

    let first = SyncOrchestrator::builder(open(&dir), transport.clone())
        .config(config(false))
        .without_resolver()
        .build();
    first.initialize(&monitor).unwrap();
    transport.reject_entity("m1");
    first
        .queue_data_change("medication", OperationKind::Update, "m1", json!({"dose": 5}), 5)
        .unwrap();
    transport.put_server_entity(SyncEntity::new("m1", "medication", json!({"dose": 10})));

    let result = first.perform_sync(None).await.unwrap();
    assert_eq!(result.unresolved_conflicts(), 1);
    first.shutdown();
    drop(first);

    let second = SyncOrchestrator::builder(open(&dir), transport.clone())
        .config(config(false))
        .without_resolver()
        .build();
    second.initialize(&monitor).unwrap();
    let pending = second.get_pending_conflicts().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].server_version.data, json!({"dose": 10}));

    let chosen = second
        .resolve_conflict_with_user_choice(&pending[0].id, json!({"dose": 10}), None)
        .unwrap();
    assert_eq!(chosen.data, json!({"dose": 10}));
    assert!(second.get_pending_conflicts().unwrap().is_empty());
    assert_eq!(second.get_sync_status().unwrap().total_syncs, 1);

    second.shutdown();
}
