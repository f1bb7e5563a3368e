//! `Engine`: the public façade wiring `DatabaseWatcher`, `EngineDataModel`
//! and one `TableDataModel` per synced table together.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::connector::{credential_channel, ActiveCredentials, SharedConnector};
use crate::credentials::CredentialSource;
use crate::error::{ErrorInfo, ErrorKind, SyncError};
use crate::engine_fsm::{EngineDataModel, EngineHandle, EngineState, TableRegistry};
use crate::kv_store::KeyValueStore;
use crate::table_fsm::{SyncMode, SyncState, TableCommand, TableDataModel, TableErrorEvent, TableHandle, TableRuntimeConfig};
use crate::transformer::CloudTransformer;
use crate::types::{ResyncFlag, TableConfig};
use crate::watcher::handle::WatcherHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseSyncFlag {
    SyncAllTables,
    ResyncTables,
}

/// Error surfaced by either the engine itself or one of its tables
/// (`table: None` for the former), mirroring `engine.error_occured`.
#[derive(Debug, Clone)]
pub struct EngineError {
    pub table: Option<String>,
    pub info: ErrorInfo,
}

/// Thin per-table proxy handed out by [`Engine::create_controller`].
#[derive(Clone)]
pub struct TableSyncController {
    handle: TableHandle,
}

impl TableSyncController {
    pub fn sync_state(&self) -> SyncState {
        self.handle.sync_state()
    }

    pub fn is_live_sync_enabled(&self) -> bool {
        self.handle.is_live_sync_enabled()
    }

    pub fn trigger_sync(&self) {
        self.handle.trigger_sync();
    }

    pub fn set_live_sync_enabled(&self, enabled: bool) {
        self.handle.set_live_sync_enabled(enabled);
    }
}

pub struct Engine {
    watcher: Arc<WatcherHandle>,
    connector: SharedConnector,
    tables: TableRegistry,
    engine: EngineHandle,
    table_errors_tx: mpsc::UnboundedSender<TableErrorEvent>,
    table_cfg: TableRuntimeConfig,
}

impl Engine {
    /// Wire one engine together. `credentials_tx` must be the sending half
    /// of the same [`watch`] pair whose receiving half `connector` reads
    /// from (see [`credential_channel`]).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        watcher: WatcherHandle,
        connector: SharedConnector,
        credential_source: Box<dyn CredentialSource>,
        kv: Arc<dyn KeyValueStore>,
        credentials_tx: watch::Sender<ActiveCredentials>,
        table_cfg: TableRuntimeConfig,
    ) -> (Self, mpsc::UnboundedReceiver<EngineError>) {
        let watcher = Arc::new(watcher);
        let tables: TableRegistry = Arc::new(Mutex::new(HashMap::new()));
        let (engine_errors_tx, mut engine_errors_rx) = mpsc::unbounded_channel();
        let (table_errors_tx, mut table_errors_rx) = mpsc::unbounded_channel();
        let (combined_tx, combined_rx) = mpsc::unbounded_channel::<EngineError>();

        let (engine_handle, _join) = EngineDataModel::spawn(
            credential_source,
            kv,
            watcher.clone(),
            tables.clone(),
            credentials_tx,
            engine_errors_tx,
        );

        {
            let tx = combined_tx.clone();
            tokio::spawn(async move {
                while let Some(info) = engine_errors_rx.recv().await {
                    if tx.send(EngineError { table: None, info }).is_err() {
                        break;
                    }
                }
            });
        }
        {
            let tx = combined_tx.clone();
            let engine_handle = engine_handle.clone();
            tokio::spawn(async move {
                while let Some(ev) = table_errors_rx.recv().await {
                    if ev.info.kind == ErrorKind::Authentication {
                        engine_handle.report_table_auth_failed();
                    }
                    if tx
                        .send(EngineError {
                            table: Some(ev.table),
                            info: ev.info,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }

        (
            Self {
                watcher,
                connector,
                tables,
                engine: engine_handle,
                table_errors_tx,
                table_cfg,
            },
            combined_rx,
        )
    }

    /// Convenience constructor that also builds the credential watch pair,
    /// so every reader observes a point-in-time consistent credential set.
    pub fn credential_pair() -> (watch::Sender<ActiveCredentials>, watch::Receiver<ActiveCredentials>) {
        credential_channel(ActiveCredentials::default())
    }

    fn spawn_table(&self, table: impl Into<String>, mode: SyncMode) -> TableHandle {
        let table = table.into();
        let (handle, _join) = TableDataModel::spawn(
            table.clone(),
            self.watcher.clone(),
            self.connector.clone(),
            self.table_cfg,
            mode,
            self.table_errors_tx.clone(),
        );
        self.tables.lock().insert(table, handle.clone());
        handle.send(TableCommand::Start);
        handle
    }

    /// Start syncing `name`, adding it to the watcher's tracked tables if
    /// it isn't already.
    pub async fn sync_table(&self, name: &str, live: bool) -> Result<(), SyncError> {
        self.watcher.add_table(TableConfig::new(name)).await?;
        let mode = if live { SyncMode::Live } else { SyncMode::Passive };
        self.spawn_table(name, mode);
        Ok(())
    }

    /// Sync every user table and/or resync every already-synced table,
    /// depending on which `flags` are set.
    pub async fn sync_database(&self, flags: HashSet<DatabaseSyncFlag>) -> Result<(), SyncError> {
        if flags.contains(&DatabaseSyncFlag::SyncAllTables) {
            for table in self.watcher.list_user_tables().await? {
                self.sync_table(&table, false).await?;
            }
        }
        if flags.contains(&DatabaseSyncFlag::ResyncTables) {
            for table in self.watcher.synced_tables().await? {
                let mut resync_flags = HashSet::new();
                resync_flags.insert(ResyncFlag::Download);
                resync_flags.insert(ResyncFlag::Upload);
                resync_flags.insert(ResyncFlag::CheckLocalData);
                self.watcher.resync(table, resync_flags).await?;
            }
        }
        Ok(())
    }

    /// Stop every table's background work and forget the engine's
    /// bookkeeping for it, leaving the user's data untouched.
    pub async fn unsync_database(&self) -> Result<(), SyncError> {
        let names: Vec<String> = self.tables.lock().keys().cloned().collect();
        for name in &names {
            self.remove_table(name, false).await?;
        }
        Ok(())
    }

    /// Stop syncing every table. `hard` also asks the backend to delete
    /// each table's remote data.
    pub async fn remove_database_sync(&self, hard: bool) -> Result<(), SyncError> {
        let names: Vec<String> = self.tables.lock().keys().cloned().collect();
        for name in &names {
            self.remove_table(name, hard).await?;
        }
        Ok(())
    }

    async fn remove_table(&self, name: &str, hard: bool) -> Result<(), SyncError> {
        let handle = self.tables.lock().get(name).cloned();
        if let Some(handle) = handle {
            if hard {
                handle.send(TableCommand::DelTable);
            }
            handle.send(TableCommand::Stop);
            let mut state = handle.sync_state();
            let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
            while !matches!(state, SyncState::Stopped | SyncState::Disabled) && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(50)).await;
                state = handle.sync_state();
            }
        }
        self.tables.lock().remove(name);
        if !hard {
            self.watcher.unsync_table(name.to_string()).await?;
        }
        Ok(())
    }

    pub fn start(&self) {
        self.engine.start();
    }

    pub fn stop(&self) {
        self.engine.stop();
    }

    pub async fn wait_for_stopped(&self, timeout: Duration) -> bool {
        self.engine.wait_for_stopped(timeout).await
    }

    pub fn engine_state(&self) -> EngineState {
        self.engine.engine_state()
    }

    pub fn trigger_sync(&self, table: Option<&str>) {
        self.dispatch(table, TableCommand::TriggerSync);
    }

    pub fn trigger_upload(&self, table: Option<&str>) {
        self.dispatch(table, TableCommand::TriggerUpload);
    }

    fn dispatch(&self, table: Option<&str>, cmd: TableCommand) {
        let tables = self.tables.lock();
        match table {
            Some(name) => {
                if let Some(handle) = tables.get(name) {
                    handle.send(cmd);
                }
            }
            None => {
                for handle in tables.values() {
                    handle.send(cmd.clone());
                }
            }
        }
    }

    pub async fn resync(&self, table: &str, flags: HashSet<ResyncFlag>) -> Result<(), SyncError> {
        self.watcher.resync(table.to_string(), flags).await
    }

    pub fn delete_account(&self) {
        self.engine.delete_account();
    }

    pub fn create_controller(&self, table: &str) -> Option<TableSyncController> {
        self.tables
            .lock()
            .get(table)
            .cloned()
            .map(|handle| TableSyncController { handle })
    }
}
