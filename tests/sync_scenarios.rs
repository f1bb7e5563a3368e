//! End-to-end scenarios driving a real SQLite database through
//! `DatabaseWatcher`/`TableDataModel` against a scripted `RemoteConnector`.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::mpsc;

use sync_engine::connector::{CancelToken, ConnectorCall};
use sync_engine::table_fsm::{TableCommand, TableDataModel, TableErrorEvent, TableHandle};
use sync_engine::types::TableState;
use sync_engine::{CloudData, ConnectorEvent, IdentityTransformer, ObjectKey, RemoteConnector, SyncMode, SyncState, TableConfig, TableRuntimeConfig, WatcherHandle};

/// Scripted connector: downloads are served from a per-table queue of
/// pre-baked batches, uploads are recorded and accepted immediately.
struct FakeConnector {
    downloads: Mutex<HashMap<String, VecDeque<Vec<CloudData>>>>,
    uploaded: Mutex<Vec<CloudData>>,
    live: Mutex<HashMap<String, mpsc::UnboundedSender<ConnectorEvent>>>,
}

impl FakeConnector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            downloads: Mutex::new(HashMap::new()),
            uploaded: Mutex::new(Vec::new()),
            live: Mutex::new(HashMap::new()),
        })
    }

    fn queue_download(&self, table: &str, batch: Vec<CloudData>) {
        self.downloads.lock().unwrap().entry(table.to_string()).or_default().push_back(batch);
    }

    fn uploaded_rows(&self) -> Vec<CloudData> {
        self.uploaded.lock().unwrap().clone()
    }

    fn push_live(&self, table: &str, event: ConnectorEvent) {
        if let Some(tx) = self.live.lock().unwrap().get(table) {
            let _ = tx.send(event);
        }
    }
}

fn call_with(events: Vec<ConnectorEvent>) -> ConnectorCall {
    let (tx, rx) = mpsc::unbounded_channel();
    for event in events {
        let _ = tx.send(event);
    }
    ConnectorCall { token: CancelToken::new(), events: rx }
}

#[async_trait]
impl RemoteConnector for FakeConnector {
    async fn get_changes(&self, table: &str, _since: Option<DateTime<Utc>>) -> ConnectorCall {
        let batch = self.downloads.lock().unwrap().get_mut(table).and_then(|q| q.pop_front());
        match batch {
            Some(rows) => call_with(vec![ConnectorEvent::Downloaded { table: table.to_string(), batch: rows, has_more: false }]),
            None => call_with(vec![ConnectorEvent::Downloaded { table: table.to_string(), batch: vec![], has_more: false }]),
        }
    }

    async fn upload_change(&self, data: CloudData) -> ConnectorCall {
        self.uploaded.lock().unwrap().push(data.clone());
        call_with(vec![ConnectorEvent::Uploaded { key: data.key.clone(), modified: data.modified }])
    }

    async fn subscribe_live(&self, table: &str, _since: Option<DateTime<Utc>>) -> ConnectorCall {
        let (tx, rx) = mpsc::unbounded_channel();
        self.live.lock().unwrap().insert(table.to_string(), tx);
        ConnectorCall { token: CancelToken::new(), events: rx }
    }

    async fn remove_table(&self, table: &str) -> ConnectorCall {
        call_with(vec![ConnectorEvent::TableRemoved { table: table.to_string() }])
    }

    async fn remove_user(&self) -> ConnectorCall {
        call_with(vec![ConnectorEvent::RemovedUser])
    }
}

fn create_table(path: &Path) {
    let conn = Connection::open(path).unwrap();
    conn.execute("CREATE TABLE T (Key INTEGER PRIMARY KEY, Value REAL)", []).unwrap();
}

fn seed_rows(path: &Path, rows: &[(i64, f64)]) {
    let conn = Connection::open(path).unwrap();
    for (key, value) in rows {
        conn.execute("INSERT INTO T(Key, Value) VALUES (?1, ?2)", params![key, value]).unwrap();
    }
}

fn row_value(path: &Path, key: i64) -> Option<f64> {
    let conn = Connection::open(path).unwrap();
    conn.query_row("SELECT Value FROM T WHERE Key = ?1", params![key], |r| r.get(0)).optional().unwrap()
}

fn shadow_changed(path: &Path, key: i64) -> Option<String> {
    let conn = Connection::open(path).unwrap();
    conn.query_row("SELECT changed FROM _se_shadow_T WHERE pkey = ?1", params![key], |r| r.get(0)).optional().unwrap()
}

fn spawn_table(
    path: &Path,
    connector: Arc<FakeConnector>,
    mode: SyncMode,
) -> (Arc<WatcherHandle>, TableHandle, mpsc::UnboundedReceiver<TableErrorEvent>) {
    let (watcher, _changed) = WatcherHandle::spawn(Some(path.to_path_buf()), Box::new(IdentityTransformer)).unwrap();
    let watcher = Arc::new(watcher);
    let (errors_tx, errors_rx) = mpsc::unbounded_channel();
    let (handle, _join) = TableDataModel::spawn(
        "T",
        watcher.clone(),
        connector,
        TableRuntimeConfig::default(),
        mode,
        errors_tx,
    );
    (watcher, handle, errors_rx)
}

async fn wait_for_state(handle: &TableHandle, target: SyncState, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if handle.sync_state() == target {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {target:?}, last seen {:?}", handle.sync_state());
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

const SHORT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn s1_clean_add_marks_table_active_with_no_pending_changes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.sqlite3");
    create_table(&path);

    let (watcher, _changed) = WatcherHandle::spawn(Some(path.clone()), Box::new(IdentityTransformer)).unwrap();
    watcher.add_table(TableConfig::new("T")).await.unwrap();

    assert_eq!(watcher.table_state("T").await.unwrap(), Some(TableState::Active));
    assert_eq!(watcher.last_sync("T").await.unwrap(), None);
    assert_eq!(watcher.load_next_pending("T").await.unwrap(), None);
}

#[tokio::test]
async fn s2_local_inserts_upload_and_reach_synchronized() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.sqlite3");
    create_table(&path);
    let rows: Vec<(i64, f64)> = (0..5).map(|i| (i, i as f64 * 0.1)).collect();
    seed_rows(&path, &rows);

    let connector = FakeConnector::new();
    let (watcher, handle, _errors) = spawn_table(&path, connector.clone(), SyncMode::Passive);
    watcher.add_table(TableConfig::new("T")).await.unwrap();

    handle.send(TableCommand::Start);
    wait_for_state(&handle, SyncState::Synchronized, SHORT).await;

    let uploaded = connector.uploaded_rows();
    assert_eq!(uploaded.len(), 5);
    let mut seen: Vec<i64> = uploaded.iter().map(|d| d.key.row_id.parse().unwrap()).collect();
    seen.sort();
    assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    for row in &uploaded {
        let key: i64 = row.key.row_id.parse().unwrap();
        let value = row.data.as_ref().unwrap().get("Value").unwrap().as_f64().unwrap();
        assert!((value - key as f64 * 0.1).abs() < 1e-9);
    }
}

#[tokio::test]
async fn s3_remote_delete_removes_local_row_and_advances_last_sync() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.sqlite3");
    create_table(&path);

    let connector = FakeConnector::new();
    let t1 = Utc::now();
    connector.queue_download("T", vec![CloudData {
        key: ObjectKey::new("T", "2"),
        data: Some([("Value".to_string(), serde_json::json!(0.2))].into_iter().collect()),
        modified: t1,
        version: None,
    }]);

    let (watcher, handle, _errors) = spawn_table(&path, connector.clone(), SyncMode::Passive);
    watcher.add_table(TableConfig::new("T")).await.unwrap();
    handle.send(TableCommand::Start);
    wait_for_state(&handle, SyncState::Synchronized, SHORT).await;
    assert_eq!(row_value(&path, 2), Some(0.2));

    let t2 = t1 + chrono::Duration::seconds(1);
    connector.queue_download("T", vec![CloudData::tombstone(ObjectKey::new("T", "2"), t2)]);
    handle.trigger_sync();

    let deadline = tokio::time::Instant::now() + SHORT;
    loop {
        if watcher.last_sync("T").await.unwrap() == Some(t2) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for last_sync to advance");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(row_value(&path, 2), None);
}

#[tokio::test]
async fn s4_stale_remote_write_is_rejected_and_shadow_stays_changed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.sqlite3");
    create_table(&path);
    seed_rows(&path, &[(3, 0.3)]);

    let before_add = Utc::now();
    let connector = FakeConnector::new();
    let (watcher, handle, _errors) = spawn_table(&path, connector.clone(), SyncMode::Passive);
    watcher.add_table(TableConfig::new("T")).await.unwrap();

    let stale_modified = before_add - chrono::Duration::seconds(5);
    connector.queue_download("T", vec![CloudData {
        key: ObjectKey::new("T", "3"),
        data: Some([("Value".to_string(), serde_json::json!(99.0))].into_iter().collect()),
        modified: stale_modified,
        version: None,
    }]);

    handle.send(TableCommand::Start);
    wait_for_state(&handle, SyncState::Synchronized, SHORT).await;

    assert_eq!(row_value(&path, 3), Some(0.3));
    assert_eq!(shadow_changed(&path, 3).as_deref(), Some("Changed"));
}

#[tokio::test]
async fn s5_live_mode_flip_reaches_live_sync_and_applies_pushes_without_trigger() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.sqlite3");
    create_table(&path);

    let connector = FakeConnector::new();
    let (watcher, handle, _errors) = spawn_table(&path, connector.clone(), SyncMode::Passive);
    watcher.add_table(TableConfig::new("T")).await.unwrap();

    handle.send(TableCommand::Start);
    wait_for_state(&handle, SyncState::Synchronized, SHORT).await;

    handle.set_live_sync_enabled(true);
    wait_for_state(&handle, SyncState::LiveSync, SHORT).await;
    assert!(handle.is_live_sync_enabled());

    connector.push_live("T", ConnectorEvent::Downloaded {
        table: "T".to_string(),
        batch: vec![CloudData {
            key: ObjectKey::new("T", "7"),
            data: Some([("Value".to_string(), serde_json::json!(0.7))].into_iter().collect()),
            modified: Utc::now(),
            version: None,
        }],
        has_more: false,
    });

    let deadline = tokio::time::Instant::now() + SHORT;
    loop {
        if row_value(&path, 7) == Some(0.7) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for live push to apply");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn s6_corrupted_row_is_skipped_until_clean_local_data_resync() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.sqlite3");
    create_table(&path);
    seed_rows(&path, &[(0, 0.0)]);

    let connector = FakeConnector::new();
    let (watcher, handle, _errors) = spawn_table(&path, connector.clone(), SyncMode::Passive);
    watcher.add_table(TableConfig::new("T")).await.unwrap();
    watcher.mark_corrupted(ObjectKey::new("T", "0"), Utc::now()).await.unwrap();

    handle.send(TableCommand::Start);
    wait_for_state(&handle, SyncState::Synchronized, SHORT).await;
    assert!(connector.uploaded_rows().is_empty());
    assert_eq!(shadow_changed(&path, 0).as_deref(), Some("Corrupted"));

    let mut flags = std::collections::HashSet::new();
    flags.insert(sync_engine::ResyncFlag::CleanLocalData);
    watcher.resync("T", flags).await.unwrap();
    handle.trigger_upload();

    let deadline = tokio::time::Instant::now() + SHORT;
    loop {
        if !connector.uploaded_rows().is_empty() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for restored row to upload");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(connector.uploaded_rows()[0].key.row_id, "0");
}
