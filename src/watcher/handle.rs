//! Async front door onto a [`DatabaseWatcher`].
//!
//! All SQL for one database runs on a single dedicated OS thread; callers
//! talk to it over a command channel and a oneshot reply per call, the same
//! connection-manager shape used to front a non-`Send` database handle with
//! an async API.

use std::collections::HashSet;
use std::path::PathBuf;
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};

use super::DatabaseWatcher;
use crate::error::SyncError;
use crate::transformer::CloudTransformer;
use crate::types::{CloudData, LocalData, ObjectKey, ResyncFlag, StoreResult, TableConfig, TableState};

type Reply<T> = oneshot::Sender<Result<T, SyncError>>;

enum Command {
    AddTable(TableConfig, Reply<()>),
    RemoveTable(String, Reply<()>),
    UnsyncTable(String, Reply<()>),
    DropTable(String, Reply<()>),
    Reactivate(Reply<Vec<String>>),
    DropAll(Reply<()>),
    ListUserTables(Reply<Vec<String>>),
    SyncedTables(Reply<Vec<String>>),
    LoadNextPending(String, Reply<Option<LocalData>>),
    StoreRemote(String, CloudData, Reply<StoreResult>),
    MarkUploaded(ObjectKey, DateTime<Utc>, Reply<()>),
    MarkCorrupted(ObjectKey, DateTime<Utc>, Reply<()>),
    Resync(String, HashSet<ResyncFlag>, Reply<()>),
    LastSync(String, Reply<Option<DateTime<Utc>>>),
    TableState(String, Reply<Option<TableState>>),
    Shutdown,
}

/// Owns the worker thread's lifetime; dropping it asks the thread to exit
/// and joins it so the underlying connection always closes cleanly.
pub struct WatcherHandle {
    commands: mpsc::UnboundedSender<Command>,
    worker: Option<JoinHandle<()>>,
}

impl WatcherHandle {
    /// Open `path` on a dedicated thread and start serving commands.
    /// `path` is `None` for an in-memory database (primarily for tests).
    pub fn spawn(
        path: Option<PathBuf>,
        transformer: Box<dyn CloudTransformer>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<String>), SyncError> {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<mpsc::UnboundedReceiver<String>, SyncError>>();

        let worker = std::thread::Builder::new()
            .name("sync-engine-watcher".into())
            .spawn(move || {
                let conn = match &path {
                    Some(p) => Connection::open(p),
                    None => Connection::open_in_memory(),
                };
                let conn = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = ready_tx.send(Err(SyncError::Sqlite(e)));
                        return;
                    }
                };
                let watcher = match DatabaseWatcher::new(conn, transformer) {
                    Ok((w, rx)) => {
                        let _ = ready_tx.send(Ok(rx));
                        w
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                while let Some(cmd) = cmd_rx.blocking_recv() {
                    if !dispatch(&watcher, cmd) {
                        break;
                    }
                }
            })
            .map_err(|_| SyncError::State("failed to spawn watcher thread"))?;

        let changed_rx = ready_rx
            .recv()
            .map_err(|_| SyncError::State("watcher thread exited before reporting readiness"))??;

        Ok((
            Self {
                commands: cmd_tx,
                worker: Some(worker),
            },
            changed_rx,
        ))
    }

    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| SyncError::State("watcher thread is gone"))?;
        rx.await.map_err(|_| SyncError::State("watcher thread dropped reply"))?
    }

    pub async fn add_table(&self, cfg: TableConfig) -> Result<(), SyncError> {
        self.call(|r| Command::AddTable(cfg, r)).await
    }

    pub async fn remove_table(&self, table: impl Into<String>) -> Result<(), SyncError> {
        self.call(|r| Command::RemoveTable(table.into(), r)).await
    }

    pub async fn unsync_table(&self, table: impl Into<String>) -> Result<(), SyncError> {
        self.call(|r| Command::UnsyncTable(table.into(), r)).await
    }

    pub async fn drop_table(&self, table: impl Into<String>) -> Result<(), SyncError> {
        self.call(|r| Command::DropTable(table.into(), r)).await
    }

    pub async fn reactivate(&self) -> Result<Vec<String>, SyncError> {
        self.call(Command::Reactivate).await
    }

    pub async fn drop_all(&self) -> Result<(), SyncError> {
        self.call(Command::DropAll).await
    }

    pub async fn list_user_tables(&self) -> Result<Vec<String>, SyncError> {
        self.call(Command::ListUserTables).await
    }

    pub async fn synced_tables(&self) -> Result<Vec<String>, SyncError> {
        self.call(Command::SyncedTables).await
    }

    pub async fn load_next_pending(&self, table: impl Into<String>) -> Result<Option<LocalData>, SyncError> {
        let table = table.into();
        self.call(|r| Command::LoadNextPending(table, r)).await
    }

    pub async fn store_remote(&self, table: impl Into<String>, data: CloudData) -> Result<StoreResult, SyncError> {
        let table = table.into();
        self.call(|r| Command::StoreRemote(table, data, r)).await
    }

    pub async fn mark_uploaded(&self, key: ObjectKey, accepted_modified: DateTime<Utc>) -> Result<(), SyncError> {
        self.call(|r| Command::MarkUploaded(key, accepted_modified, r)).await
    }

    pub async fn mark_corrupted(&self, key: ObjectKey, tstamp: DateTime<Utc>) -> Result<(), SyncError> {
        self.call(|r| Command::MarkCorrupted(key, tstamp, r)).await
    }

    pub async fn resync(&self, table: impl Into<String>, flags: HashSet<ResyncFlag>) -> Result<(), SyncError> {
        let table = table.into();
        self.call(|r| Command::Resync(table, flags, r)).await
    }

    pub async fn last_sync(&self, table: impl Into<String>) -> Result<Option<DateTime<Utc>>, SyncError> {
        let table = table.into();
        self.call(|r| Command::LastSync(table, r)).await
    }

    pub async fn table_state(&self, table: impl Into<String>) -> Result<Option<TableState>, SyncError> {
        let table = table.into();
        self.call(|r| Command::TableState(table, r)).await
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Runs one command against `watcher`, returns `false` on `Shutdown`.
fn dispatch(watcher: &DatabaseWatcher, cmd: Command) -> bool {
    match cmd {
        Command::AddTable(cfg, reply) => {
            let _ = reply.send(watcher.add_table(&cfg));
        }
        Command::RemoveTable(table, reply) => {
            let _ = reply.send(watcher.remove_table(&table));
        }
        Command::UnsyncTable(table, reply) => {
            let _ = reply.send(watcher.unsync_table(&table));
        }
        Command::DropTable(table, reply) => {
            let _ = reply.send(watcher.drop_table(&table));
        }
        Command::Reactivate(reply) => {
            let _ = reply.send(watcher.reactivate());
        }
        Command::DropAll(reply) => {
            let _ = reply.send(watcher.drop_all());
        }
        Command::ListUserTables(reply) => {
            let _ = reply.send(watcher.list_user_tables());
        }
        Command::SyncedTables(reply) => {
            let _ = reply.send(watcher.synced_tables());
        }
        Command::LoadNextPending(table, reply) => {
            let _ = reply.send(watcher.load_next_pending(&table));
        }
        Command::StoreRemote(table, data, reply) => {
            let _ = reply.send(watcher.store_remote(&table, &data));
        }
        Command::MarkUploaded(key, modified, reply) => {
            let _ = reply.send(watcher.mark_uploaded(&key, modified));
        }
        Command::MarkCorrupted(key, tstamp, reply) => {
            let _ = reply.send(watcher.mark_corrupted(&key, tstamp));
        }
        Command::Resync(table, flags, reply) => {
            let _ = reply.send(watcher.resync(&table, &flags));
        }
        Command::LastSync(table, reply) => {
            let _ = reply.send(watcher.last_sync(&table));
        }
        Command::TableState(table, reply) => {
            let _ = reply.send(watcher.table_state(&table));
        }
        Command::Shutdown => return false,
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transformer::IdentityTransformer;

    #[tokio::test]
    async fn spawn_add_table_and_load_pending_round_trip() {
        let (handle, _changed) = WatcherHandle::spawn(None, Box::new(IdentityTransformer)).unwrap();

        // A fresh in-memory database has no user tables yet; expect a
        // schema error rather than a panic or hang.
        let err = handle.add_table(TableConfig::new("missing")).await.unwrap_err();
        assert!(matches!(err, SyncError::Schema { .. }));
    }
}
