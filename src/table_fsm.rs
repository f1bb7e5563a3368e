//! Per-table state chart: owns the download/process/upload fibers for one
//! synced table and exposes a coarse [`SyncState`] to the outside.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use crate::connector::{ConnectorEvent, SharedConnector};
use crate::error::{ErrorInfo, ErrorKind, SyncError};
use crate::types::StoreResult;
use crate::watcher::handle::WatcherHandle;

/// Coarse projection of the state chart visible to application code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Disabled,
    Stopped,
    Initializing,
    Downloading,
    Uploading,
    Synchronized,
    LiveSync,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Passive,
    Live,
}

/// Commands the outside world (mainly [`crate::engine::Engine`]) sends into
/// a running table.
#[derive(Debug, Clone)]
pub enum TableCommand {
    Start,
    Stop,
    TriggerSync,
    TriggerUpload,
    SetMode(SyncMode),
    ForceSync,
    DelTable,
    /// The watcher reported a local write on this table.
    WatcherChanged,
}

pub struct TableErrorEvent {
    pub table: String,
    pub info: ErrorInfo,
}

#[derive(Debug, Clone, Copy)]
pub struct TableRuntimeConfig {
    pub cancellation_grace: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub backpressure_rows: usize,
}

impl Default for TableRuntimeConfig {
    fn default() -> Self {
        Self {
            cancellation_grace: Duration::from_secs(5),
            backoff_min: Duration::from_secs(5),
            backoff_max: Duration::from_secs(600),
            backpressure_rows: 1000,
        }
    }
}

/// Exponential backoff clamped to `[min, max]`, reset after a clean cycle.
pub struct BackoffPolicy {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl BackoffPolicy {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max, current: min }
    }

    pub fn next(&mut self) -> Duration {
        let this = self.current;
        self.current = (self.current * 2).min(self.max);
        this
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

/// What caused a mode's run loop to exit.
enum Outcome {
    Stopped,
    DelTableRequested,
    Failed(SyncError),
}

enum DownloadOutcome {
    /// Both `dlReady` and `procReady` fired; ready to upload.
    Completed,
    /// A `TriggerSync` pre-empted the in-flight download; restart it.
    Preempted,
    /// A transient failure hit; wait this long, then restart the download.
    RetryAfter(Duration),
}

/// What a table-local error resolves to once classified.
enum ErrorAction {
    /// Retry the in-flight region after backing off; engine state unchanged.
    RetryAfter(Duration),
    /// The offending row was (or will be) marked Corrupted; move on.
    SkipRow,
    /// Not retriable in place; the caller should surface `Outcome::Failed`.
    Fatal(SyncError),
}

fn classify_action(e: SyncError, backoff: &mut BackoffPolicy) -> ErrorAction {
    match e.classify() {
        ErrorKind::TransientNetwork => ErrorAction::RetryAfter(backoff.next()),
        ErrorKind::TransformFailure => ErrorAction::SkipRow,
        _ => ErrorAction::Fatal(e),
    }
}

/// Waits out a backoff interval, but still honors `Stop`/`DelTable` arriving
/// during the wait instead of blocking past them.
async fn wait_backoff_or_abort(commands: &mut mpsc::UnboundedReceiver<TableCommand>, wait: Duration) -> Option<Outcome> {
    tokio::select! {
        biased;
        cmd = commands.recv() => match cmd {
            Some(TableCommand::Stop) => Some(Outcome::Stopped),
            Some(TableCommand::DelTable) => Some(Outcome::DelTableRequested),
            None => Some(Outcome::Stopped),
            Some(_) => None,
        },
        _ = tokio::time::sleep(wait) => None,
    }
}

enum SyncWait {
    ResumeDownload,
    ResumeUpload,
    SwitchToLive,
}

/// Thin handle used by [`crate::engine::Engine`] / `TableSyncController` to
/// drive and observe one running [`TableDataModel`].
#[derive(Clone)]
pub struct TableHandle {
    pub table: String,
    commands: mpsc::UnboundedSender<TableCommand>,
    state: watch::Receiver<SyncState>,
}

impl TableHandle {
    pub fn sync_state(&self) -> SyncState {
        *self.state.borrow()
    }

    pub fn send(&self, cmd: TableCommand) {
        let _ = self.commands.send(cmd);
    }

    pub fn trigger_sync(&self) {
        self.send(TableCommand::TriggerSync);
    }

    pub fn trigger_upload(&self) {
        self.send(TableCommand::TriggerUpload);
    }

    pub fn set_live_sync_enabled(&self, enabled: bool) {
        self.send(TableCommand::SetMode(if enabled { SyncMode::Live } else { SyncMode::Passive }));
    }

    pub fn is_live_sync_enabled(&self) -> bool {
        self.sync_state() == SyncState::LiveSync
    }
}

pub struct TableDataModel {
    table: String,
    watcher: Arc<WatcherHandle>,
    connector: SharedConnector,
    cfg: TableRuntimeConfig,
    state_tx: watch::Sender<SyncState>,
    errors: mpsc::UnboundedSender<TableErrorEvent>,
    mode: SyncMode,
}

impl TableDataModel {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        table: impl Into<String>,
        watcher: Arc<WatcherHandle>,
        connector: SharedConnector,
        cfg: TableRuntimeConfig,
        mode: SyncMode,
        errors: mpsc::UnboundedSender<TableErrorEvent>,
    ) -> (TableHandle, tokio::task::JoinHandle<()>) {
        let table = table.into();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SyncState::Disabled);
        let model = Self {
            table: table.clone(),
            watcher,
            connector,
            cfg,
            state_tx,
            errors,
            mode,
        };
        let join = tokio::spawn(model.run(commands_rx));
        (
            TableHandle {
                table,
                commands: commands_tx,
                state: state_rx,
            },
            join,
        )
    }

    fn set_state(&self, state: SyncState) {
        let _ = self.state_tx.send(state);
    }

    fn emit_error(&self, kind: ErrorKind, message: impl Into<String>) {
        let _ = self.errors.send(TableErrorEvent {
            table: self.table.clone(),
            info: ErrorInfo::new(kind, message),
        });
    }

    /// Top-level state chart loop: `Inactive -> Active -> {Stopped, Error}`.
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<TableCommand>) {
        self.set_state(SyncState::Disabled);
        loop {
            match commands.recv().await {
                Some(TableCommand::Start) => {}
                Some(_) => continue,
                None => return,
            }

            'active: loop {
                self.set_state(SyncState::Initializing);
                let outcome = match self.mode {
                    SyncMode::Passive => self.run_passive(&mut commands).await,
                    SyncMode::Live => self.run_live(&mut commands).await,
                };
                match outcome {
                    Outcome::Stopped => {
                        self.set_state(SyncState::Stopped);
                        break 'active;
                    }
                    Outcome::DelTableRequested => {
                        self.run_del_table().await;
                        continue 'active;
                    }
                    Outcome::Failed(e) => {
                        self.set_state(SyncState::Error);
                        self.emit_error(e.classify(), e.to_string());
                        match commands.recv().await {
                            Some(TableCommand::Start) => continue 'active,
                            Some(TableCommand::Stop) | None => {
                                self.set_state(SyncState::Stopped);
                                break 'active;
                            }
                            Some(_) => continue 'active,
                        }
                    }
                }
            }

            // Stopped: wait for the next Start (mirrors Inactive at the outer loop).
        }
    }

    async fn run_del_table(&self) {
        let call = self.connector.remove_table(&self.table).await;
        let mut events = call.events;
        let _ = timeout(self.cfg.cancellation_grace, async {
            while let Some(event) = events.recv().await {
                if matches!(event, ConnectorEvent::TableRemoved { .. } | ConnectorEvent::Error(_)) {
                    break;
                }
            }
        })
        .await;
        if let Err(e) = self.watcher.drop_table(self.table.clone()).await {
            self.emit_error(e.classify(), e.to_string());
        }
    }

    /// PassiveSync: Downloading -> Uploading -> Synchronized, looping on
    /// `TriggerSync` / `TriggerUpload`.
    async fn run_passive(&mut self, commands: &mut mpsc::UnboundedReceiver<TableCommand>) -> Outcome {
        let mut backoff = BackoffPolicy::new(self.cfg.backoff_min, self.cfg.backoff_max);
        loop {
            self.set_state(SyncState::Downloading);
            loop {
                match self.download_and_process(commands, &mut backoff).await {
                    Ok(DownloadOutcome::Completed) => break,
                    Ok(DownloadOutcome::Preempted) => continue,
                    Ok(DownloadOutcome::RetryAfter(wait)) => {
                        if let Some(outcome) = wait_backoff_or_abort(commands, wait).await {
                            return outcome;
                        }
                        continue;
                    }
                    Err(outcome) => return outcome,
                }
            }

            self.set_state(SyncState::Uploading);
            if let Err(outcome) = self.upload_pending(commands, &mut backoff).await {
                return outcome;
            }

            self.set_state(SyncState::Synchronized);
            match self.wait_in_synchronized(commands).await {
                Ok(SyncWait::ResumeDownload) => continue,
                Ok(SyncWait::ResumeUpload) => {
                    self.set_state(SyncState::Uploading);
                    if let Err(outcome) = self.upload_pending(commands, &mut backoff).await {
                        return outcome;
                    }
                    self.set_state(SyncState::Synchronized);
                }
                Ok(SyncWait::SwitchToLive) => return self.run_live(commands).await,
                Err(outcome) => return outcome,
            }
        }
    }

    async fn wait_in_synchronized(&mut self, commands: &mut mpsc::UnboundedReceiver<TableCommand>) -> Result<SyncWait, Outcome> {
        loop {
            match commands.recv().await {
                Some(TableCommand::TriggerSync) | Some(TableCommand::ForceSync) => return Ok(SyncWait::ResumeDownload),
                Some(TableCommand::TriggerUpload) | Some(TableCommand::WatcherChanged) => {
                    return Ok(SyncWait::ResumeUpload)
                }
                Some(TableCommand::SetMode(SyncMode::Live)) => {
                    self.mode = SyncMode::Live;
                    return Ok(SyncWait::SwitchToLive);
                }
                Some(TableCommand::SetMode(SyncMode::Passive)) => continue,
                Some(TableCommand::Stop) => return Err(Outcome::Stopped),
                Some(TableCommand::DelTable) => return Err(Outcome::DelTableRequested),
                Some(TableCommand::Start) => continue,
                None => return Err(Outcome::Stopped),
            }
        }
    }

    /// Downloading fiber + processing fiber, synchronized: moves on only
    /// once both the download stream is drained and every row has been
    /// handed to `store_remote`.
    async fn download_and_process(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<TableCommand>,
        backoff: &mut BackoffPolicy,
    ) -> Result<DownloadOutcome, Outcome> {
        let since = self
            .watcher
            .last_sync(self.table.clone())
            .await
            .map_err(Outcome::Failed)?;
        let call = self.connector.get_changes(&self.table, since).await;
        let mut events = call.events;
        let mut pending_rows = 0usize;

        loop {
            tokio::select! {
                biased;
                cmd = commands.recv() => {
                    match cmd {
                        Some(TableCommand::TriggerSync) | Some(TableCommand::ForceSync) => {
                            call.token.cancel();
                            return Ok(DownloadOutcome::Preempted);
                        }
                        Some(TableCommand::Stop) => {
                            call.token.cancel();
                            return Err(Outcome::Stopped);
                        }
                        Some(TableCommand::DelTable) => {
                            call.token.cancel();
                            return Err(Outcome::DelTableRequested);
                        }
                        Some(_) => continue,
                        None => {
                            call.token.cancel();
                            return Err(Outcome::Stopped);
                        }
                    }
                }
                event = events.recv() => {
                    match event {
                        Some(ConnectorEvent::Downloaded { batch, has_more, .. }) => {
                            pending_rows += batch.len();
                            for row in batch {
                                match self.watcher.store_remote(self.table.clone(), row).await {
                                    Ok(StoreResult::Applied) | Ok(StoreResult::RejectedStale) => {}
                                    Err(e) => match classify_action(e, backoff) {
                                        ErrorAction::SkipRow => {}
                                        ErrorAction::RetryAfter(wait) => {
                                            call.token.cancel();
                                            return Ok(DownloadOutcome::RetryAfter(wait));
                                        }
                                        ErrorAction::Fatal(e) => {
                                            call.token.cancel();
                                            return Err(Outcome::Failed(e));
                                        }
                                    },
                                }
                                pending_rows -= 1;
                                if pending_rows >= self.cfg.backpressure_rows {
                                    tokio::task::yield_now().await;
                                }
                            }
                            backoff.reset();
                            if !has_more {
                                return Ok(DownloadOutcome::Completed);
                            }
                        }
                        Some(ConnectorEvent::SyncDone { .. }) => {
                            backoff.reset();
                            return Ok(DownloadOutcome::Completed);
                        }
                        Some(ConnectorEvent::Error(e)) => {
                            let err = connector_error(e);
                            match classify_action(err, backoff) {
                                ErrorAction::SkipRow => continue,
                                ErrorAction::RetryAfter(wait) => return Ok(DownloadOutcome::RetryAfter(wait)),
                                ErrorAction::Fatal(e) => return Err(Outcome::Failed(e)),
                            }
                        }
                        Some(_) => continue,
                        None => return Ok(DownloadOutcome::Completed),
                    }
                }
            }
        }
    }

    /// Uploading fiber: repeatedly `load_next_pending` -> `upload_change` ->
    /// `mark_uploaded`, ascending `tstamp` order, until nothing is pending.
    async fn upload_pending(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<TableCommand>,
        backoff: &mut BackoffPolicy,
    ) -> Result<(), Outcome> {
        loop {
            let next = match self.watcher.load_next_pending(self.table.clone()).await {
                Ok(n) => n,
                Err(e) => match classify_action(e, backoff) {
                    ErrorAction::SkipRow => continue,
                    ErrorAction::RetryAfter(wait) => {
                        if let Some(outcome) = wait_backoff_or_abort(commands, wait).await {
                            return Err(outcome);
                        }
                        continue;
                    }
                    ErrorAction::Fatal(e) => return Err(Outcome::Failed(e)),
                },
            };
            let Some(local) = next else {
                return Ok(());
            };

            let call = self.connector.upload_change(local.cloud.clone()).await;
            let mut events = call.events;
            let result = tokio::select! {
                biased;
                cmd = commands.recv() => {
                    match cmd {
                        Some(TableCommand::Stop) => { call.token.cancel(); return Err(Outcome::Stopped); }
                        Some(TableCommand::DelTable) => { call.token.cancel(); return Err(Outcome::DelTableRequested); }
                        _ => {
                            // A Stop/DelTable mid-upload is deferred until this row
                            // finishes: uploads never interleave partial writes.
                            events.recv().await
                        }
                    }
                }
                event = events.recv() => event,
            };

            match result {
                Some(ConnectorEvent::Uploaded { key, modified }) => {
                    self.watcher
                        .mark_uploaded(key, modified)
                        .await
                        .map_err(Outcome::Failed)?;
                    backoff.reset();
                }
                Some(ConnectorEvent::Error(e)) => {
                    let err = connector_error(e);
                    match classify_action(err, backoff) {
                        ErrorAction::SkipRow => continue,
                        ErrorAction::RetryAfter(wait) => {
                            if let Some(outcome) = wait_backoff_or_abort(commands, wait).await {
                                return Err(outcome);
                            }
                            continue;
                        }
                        ErrorAction::Fatal(e) => return Err(Outcome::Failed(e)),
                    }
                }
                _ => return Err(Outcome::Failed(SyncError::State("upload_change produced no terminal event"))),
            }
        }
    }

    /// LiveSync: LsStarting -> LsProcessInit -> LsActive, with `LsError`
    /// restarting the subscription after an exponential backoff.
    async fn run_live(&mut self, commands: &mut mpsc::UnboundedReceiver<TableCommand>) -> Outcome {
        let mut backoff = BackoffPolicy::new(self.cfg.backoff_min, self.cfg.backoff_max);
        loop {
            self.set_state(SyncState::Initializing);
            let since = match self.watcher.last_sync(self.table.clone()).await {
                Ok(s) => s,
                Err(e) => return Outcome::Failed(e),
            };
            let call = self.connector.subscribe_live(&self.table, since).await;
            let mut events = call.events;

            self.set_state(SyncState::LiveSync);
            loop {
                tokio::select! {
                    biased;
                    cmd = commands.recv() => {
                        match cmd {
                            Some(TableCommand::Stop) => { call.token.cancel(); return Outcome::Stopped; }
                            Some(TableCommand::DelTable) => { call.token.cancel(); return Outcome::DelTableRequested; }
                            Some(TableCommand::SetMode(SyncMode::Passive)) => {
                                call.token.cancel();
                                self.mode = SyncMode::Passive;
                                return self.run_passive(commands).await;
                            }
                            Some(TableCommand::TriggerUpload) | Some(TableCommand::WatcherChanged) => {
                                if let Err(outcome) = self.upload_pending(commands, &mut backoff).await {
                                    call.token.cancel();
                                    return outcome;
                                }
                            }
                            Some(_) => continue,
                            None => { call.token.cancel(); return Outcome::Stopped; }
                        }
                    }
                    event = events.recv() => {
                        match event {
                            Some(ConnectorEvent::Downloaded { batch, .. }) => {
                                for row in batch {
                                    if let Err(e) = self.watcher.store_remote(self.table.clone(), row).await {
                                        return Outcome::Failed(e);
                                    }
                                }
                                backoff.reset();
                            }
                            Some(ConnectorEvent::LiveSyncError { error, .. }) => {
                                let wait = backoff.next();
                                self.emit_error(ErrorKind::from(&error), error.message.clone());
                                tokio::time::sleep(wait).await;
                                break;
                            }
                            Some(ConnectorEvent::Error(e)) => return Outcome::Failed(connector_error(e)),
                            Some(_) => continue,
                            None => {
                                let wait = backoff.next();
                                tokio::time::sleep(wait).await;
                                break;
                            }
                        }
                    }
                }
            }
        }
    }
}

fn connector_error(e: crate::connector::ConnectorError) -> SyncError {
    let status = match e.kind {
        crate::connector::ConnectorErrorKind::Auth => 401,
        crate::connector::ConnectorErrorKind::Permanent => 400,
        crate::connector::ConnectorErrorKind::Transient => 503,
    };
    SyncError::Remote { status, message: e.message }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_policy_doubles_until_clamped() {
        let mut b = BackoffPolicy::new(Duration::from_secs(5), Duration::from_secs(20));
        assert_eq!(b.next(), Duration::from_secs(5));
        assert_eq!(b.next(), Duration::from_secs(10));
        assert_eq!(b.next(), Duration::from_secs(20));
        assert_eq!(b.next(), Duration::from_secs(20));
    }

    #[test]
    fn backoff_policy_resets_to_min() {
        let mut b = BackoffPolicy::new(Duration::from_secs(5), Duration::from_secs(20));
        b.next();
        b.next();
        b.reset();
        assert_eq!(b.next(), Duration::from_secs(5));
    }
}
