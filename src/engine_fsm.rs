//! Top-level state chart: owns sign-in/refresh/sign-out and fans `start`/
//! `stop`/live-sync preference out to every registered table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::connector::ActiveCredentials;
use crate::credentials::{refresh_decision, CredentialSource, RefreshDecision, SignInOutcome, REFRESH_LEAD};
use crate::error::{ErrorInfo, ErrorKind};
use crate::kv_store::{keys, KeyValueStore, ENGINE_NAMESPACE};
use crate::table_fsm::{SyncMode, SyncState, TableCommand, TableHandle};
use crate::watcher::handle::WatcherHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Inactive,
    SigningIn,
    TableSync,
    Stopping,
    DeletingAcc,
    Error,
}

#[derive(Debug, Clone)]
pub enum EngineCommand {
    Start,
    Stop,
    DeleteAccount,
    SetLiveSyncEnabled(bool),
    /// A table's connector reported a 401/403; restart sign-in and resume
    /// every table once a fresh credential set is in hand.
    TableAuthFailed,
}

/// Shared table registry: `Engine` inserts handles as tables are added;
/// `EngineDataModel` only ever reads it to broadcast commands.
pub type TableRegistry = Arc<Mutex<HashMap<String, TableHandle>>>;

#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<EngineCommand>,
    state: watch::Receiver<EngineState>,
}

impl EngineHandle {
    pub fn engine_state(&self) -> EngineState {
        *self.state.borrow()
    }

    pub fn start(&self) {
        let _ = self.commands.send(EngineCommand::Start);
    }

    pub fn stop(&self) {
        let _ = self.commands.send(EngineCommand::Stop);
    }

    pub fn delete_account(&self) {
        let _ = self.commands.send(EngineCommand::DeleteAccount);
    }

    pub fn set_live_sync_enabled(&self, enabled: bool) {
        let _ = self.commands.send(EngineCommand::SetLiveSyncEnabled(enabled));
    }

    pub fn report_table_auth_failed(&self) {
        let _ = self.commands.send(EngineCommand::TableAuthFailed);
    }

    /// Suspension point: resolves once the engine reaches `Inactive` (or
    /// `Error`), or the timeout elapses.
    pub async fn wait_for_stopped(&self, timeout: Duration) -> bool {
        let mut state = self.state.clone();
        tokio::time::timeout(timeout, state.wait_for(|s| matches!(s, EngineState::Inactive | EngineState::Error)))
            .await
            .is_ok()
    }
}

enum ServeOutcome {
    Stopped,
    RestartSignIn,
}

pub struct EngineDataModel {
    credential_source: Box<dyn CredentialSource>,
    kv: Arc<dyn KeyValueStore>,
    watcher: Arc<WatcherHandle>,
    tables: TableRegistry,
    credentials_tx: watch::Sender<ActiveCredentials>,
    state_tx: watch::Sender<EngineState>,
    errors: mpsc::UnboundedSender<ErrorInfo>,
}

impl EngineDataModel {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        credential_source: Box<dyn CredentialSource>,
        kv: Arc<dyn KeyValueStore>,
        watcher: Arc<WatcherHandle>,
        tables: TableRegistry,
        credentials_tx: watch::Sender<ActiveCredentials>,
        errors: mpsc::UnboundedSender<ErrorInfo>,
    ) -> (EngineHandle, tokio::task::JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(EngineState::Inactive);
        let model = Self {
            credential_source,
            kv,
            watcher,
            tables,
            credentials_tx,
            state_tx,
            errors,
        };
        let join = tokio::spawn(model.run(commands_rx));
        (
            EngineHandle {
                commands: commands_tx,
                state: state_rx,
            },
            join,
        )
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
    }

    fn emit_error(&self, kind: ErrorKind, message: impl Into<String>) {
        let _ = self.errors.send(ErrorInfo::new(kind, message));
    }

    fn broadcast(&self, cmd: TableCommand) {
        for handle in self.tables.lock().values() {
            handle.send(cmd.clone());
        }
    }

    async fn stop_all_tables(&self) {
        let handles: Vec<TableHandle> = self.tables.lock().values().cloned().collect();
        self.broadcast(TableCommand::Stop);
        for handle in handles {
            if handle.sync_state() == SyncState::Disabled {
                continue;
            }
            let _ = tokio::time::timeout(Duration::from_secs(30), async {
                loop {
                    let state = handle.sync_state();
                    if matches!(state, SyncState::Stopped | SyncState::Disabled) {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            })
            .await;
        }
    }

    async fn persist_credentials(&self, refresh_token: &str, expires_at: DateTime<Utc>, email: Option<&str>) {
        self.kv.set(&keys::refresh_token(), refresh_token).await;
        self.kv.set(&keys::expires_at(), &expires_at.to_rfc3339()).await;
        if let Some(email) = email {
            self.kv.set(&keys::email(), email).await;
        }
        self.kv.sync().await;
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<EngineCommand>) {
        self.set_state(EngineState::Inactive);
        'outer: loop {
            match commands.recv().await {
                Some(EngineCommand::Start) => {}
                Some(_) => continue,
                None => return,
            }

            loop {
                self.set_state(EngineState::SigningIn);
                match self.credential_source.sign_in().await {
                    SignInOutcome::SignedIn {
                        user_id,
                        id_token,
                        refresh_token,
                        expires_at,
                        email,
                    } => {
                        self.persist_credentials(&refresh_token, expires_at, email.as_deref()).await;
                        let _ = self.credentials_tx.send(ActiveCredentials { user_id, id_token });
                        self.set_state(EngineState::TableSync);
                        self.broadcast(TableCommand::Start);

                        match self.serve_table_sync(&mut commands, refresh_token, expires_at).await {
                            ServeOutcome::Stopped => continue 'outer,
                            ServeOutcome::RestartSignIn => continue,
                        }
                    }
                    SignInOutcome::Failed(msg) => {
                        self.set_state(EngineState::Error);
                        self.emit_error(ErrorKind::Authentication, msg);
                        continue 'outer;
                    }
                    SignInOutcome::Aborted => {
                        self.set_state(EngineState::Inactive);
                        continue 'outer;
                    }
                }
            }
        }
    }

    async fn serve_table_sync(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<EngineCommand>,
        mut refresh_token: String,
        mut expires_at: DateTime<Utc>,
    ) -> ServeOutcome {
        loop {
            let decision = refresh_decision(Utc::now(), expires_at, &refresh_token);
            let wait = match decision {
                RefreshDecision::Wait => (expires_at - REFRESH_LEAD - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::from_millis(1)),
                _ => Duration::from_millis(1),
            };

            tokio::select! {
                biased;
                cmd = commands.recv() => {
                    match cmd {
                        Some(EngineCommand::Stop) => {
                            self.set_state(EngineState::Stopping);
                            self.stop_all_tables().await;
                            self.credential_source.log_out().await;
                            self.set_state(EngineState::Inactive);
                            return ServeOutcome::Stopped;
                        }
                        Some(EngineCommand::DeleteAccount) => {
                            self.set_state(EngineState::DeletingAcc);
                            self.stop_all_tables().await;
                            let id_token = self.credentials_tx.borrow().id_token.clone();
                            let outcome = self.credential_source.delete_user(&id_token).await;
                            if outcome.success {
                                if let Err(e) = self.watcher.drop_all().await {
                                    self.emit_error(e.classify(), e.to_string());
                                }
                                self.kv.remove(ENGINE_NAMESPACE).await;
                                self.kv.sync().await;
                            }
                            return ServeOutcome::RestartSignIn;
                        }
                        Some(EngineCommand::SetLiveSyncEnabled(enabled)) => {
                            let mode = if enabled { SyncMode::Live } else { SyncMode::Passive };
                            self.broadcast(TableCommand::SetMode(mode));
                        }
                        Some(EngineCommand::Start) => continue,
                        Some(EngineCommand::TableAuthFailed) => return ServeOutcome::RestartSignIn,
                        None => {
                            self.set_state(EngineState::Inactive);
                            return ServeOutcome::Stopped;
                        }
                    }
                }
                _ = tokio::time::sleep(wait) => {
                    match refresh_decision(Utc::now(), expires_at, &refresh_token) {
                        RefreshDecision::Wait => continue,
                        RefreshDecision::FullSignIn => return ServeOutcome::RestartSignIn,
                        RefreshDecision::Refresh => {
                            match self.credential_source.refresh(&refresh_token).await {
                                SignInOutcome::SignedIn {
                                    user_id,
                                    id_token,
                                    refresh_token: new_refresh,
                                    expires_at: new_expiry,
                                    email,
                                } => {
                                    refresh_token = new_refresh.clone();
                                    expires_at = new_expiry;
                                    self.persist_credentials(&new_refresh, new_expiry, email.as_deref()).await;
                                    let _ = self.credentials_tx.send(ActiveCredentials { user_id, id_token });
                                }
                                SignInOutcome::Failed(msg) => {
                                    self.set_state(EngineState::Error);
                                    self.emit_error(ErrorKind::Authentication, msg);
                                    return ServeOutcome::RestartSignIn;
                                }
                                SignInOutcome::Aborted => return ServeOutcome::RestartSignIn,
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentialSource;
    use crate::kv_store::MemoryKeyValueStore;
    use crate::transformer::IdentityTransformer;
    use crate::watcher::handle::WatcherHandle;

    #[tokio::test]
    async fn start_then_stop_reaches_inactive() {
        let (watcher, _changed) = WatcherHandle::spawn(None, Box::new(IdentityTransformer)).unwrap();
        let tables: TableRegistry = Arc::new(Mutex::new(HashMap::new()));
        let (creds_tx, _creds_rx) = watch::channel(ActiveCredentials::default());
        let (errors_tx, mut errors_rx) = mpsc::unbounded_channel();

        let source = StaticCredentialSource {
            user_id: "u1".into(),
            id_token: "tok".into(),
            refresh_token: "rtok".into(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        };

        let (handle, _join) = EngineDataModel::spawn(
            Box::new(source),
            Arc::new(MemoryKeyValueStore::new()),
            Arc::new(watcher),
            tables,
            creds_tx,
            errors_tx,
        );

        handle.start();
        // Give the state machine a moment to reach TableSync before stopping.
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.stop();
        assert!(handle.wait_for_stopped(Duration::from_secs(5)).await);
        assert!(errors_rx.try_recv().is_err());
    }
}
