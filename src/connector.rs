//! `RemoteConnector`: the request/response contract with the backend.
//!
//! [`HttpRemoteConnector`] exercises the `CloudData` JSON shape over a
//! plain REST+WebSocket transport, so the engine has a real transport to
//! compile and integration-test against. Every call is token-handle based:
//! it returns a [`CancelToken`] immediately and streams [`ConnectorEvent`]s
//! until the logical operation completes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, SyncError};
use crate::types::{CloudData, ObjectKey};

/// Opaque handle returned by every connector call; cancel with
/// [`RemoteConnector::cancel`] or by dropping the receiving end.
#[derive(Debug, Clone)]
pub struct CancelToken(pub(crate) CancellationToken);

impl CancelToken {
    /// A fresh, not-yet-cancelled token; mainly useful for test doubles of
    /// [`RemoteConnector`] that need to hand back a [`ConnectorCall`].
    pub fn new() -> Self {
        Self(CancellationToken::new())
    }

    pub fn cancel(&self) {
        self.0.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// Network/backend error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorErrorKind {
    Transient,
    Auth,
    Permanent,
}

#[derive(Debug, Clone)]
pub struct ConnectorError {
    pub kind: ConnectorErrorKind,
    pub message: String,
}

impl From<&ConnectorError> for ErrorKind {
    fn from(e: &ConnectorError) -> Self {
        match e.kind {
            ConnectorErrorKind::Transient => ErrorKind::TransientNetwork,
            ConnectorErrorKind::Auth => ErrorKind::Authentication,
            ConnectorErrorKind::Permanent => ErrorKind::PermanentRemote,
        }
    }
}

/// Events emitted on a call's event stream, ending in exactly one terminal
/// event (`SyncDone`, `Uploaded`, `TableRemoved`, `RemovedUser`, or an
/// error).
#[derive(Debug, Clone)]
pub enum ConnectorEvent {
    Downloaded {
        table: String,
        batch: Vec<CloudData>,
        has_more: bool,
    },
    SyncDone {
        table: String,
    },
    Uploaded {
        key: ObjectKey,
        modified: DateTime<Utc>,
    },
    TableRemoved {
        table: String,
    },
    RemovedUser,
    LiveSyncError {
        table: String,
        error: ConnectorError,
    },
    Error(ConnectorError),
}

/// The live, authorized credential pair the connector multiplexes calls
/// over. Updates are point-in-time consistent: readers see either the old
/// or the new pair, never a torn mix of the two.
#[derive(Debug, Clone, Default)]
pub struct ActiveCredentials {
    pub user_id: String,
    pub id_token: String,
}

pub type CredentialWatch = watch::Receiver<ActiveCredentials>;

/// Handle to an in-flight or completed call: the cancellation token plus
/// the event stream.
pub struct ConnectorCall {
    pub token: CancelToken,
    pub events: mpsc::UnboundedReceiver<ConnectorEvent>,
}

#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn get_changes(&self, table: &str, since: Option<DateTime<Utc>>) -> ConnectorCall;
    async fn upload_change(&self, data: CloudData) -> ConnectorCall;
    async fn subscribe_live(&self, table: &str, since: Option<DateTime<Utc>>) -> ConnectorCall;
    async fn remove_table(&self, table: &str) -> ConnectorCall;
    async fn remove_user(&self) -> ConnectorCall;
    fn cancel(&self, token: &CancelToken) {
        token.cancel();
    }
}

/// Wire-level row shape. Kept distinct from [`CloudData`] so the
/// JSON field names (`deleted` instead of an `Option`) are explicit and
/// stable independent of how we choose to model tombstones internally.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct WireCloudData {
    table: String,
    key: String,
    modified: DateTime<Utc>,
    deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<crate::types::Payload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
}

impl From<&CloudData> for WireCloudData {
    fn from(c: &CloudData) -> Self {
        Self {
            table: c.key.table.clone(),
            key: c.key.row_id.clone(),
            modified: c.modified,
            deleted: c.is_tombstone(),
            data: c.data.clone(),
            version: c.version.clone(),
        }
    }
}

impl From<WireCloudData> for CloudData {
    fn from(w: WireCloudData) -> Self {
        Self {
            key: ObjectKey::new(w.table, w.key),
            data: if w.deleted { None } else { w.data },
            modified: w.modified,
            version: w.version,
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct ChangesPage {
    changes: Vec<WireCloudData>,
    has_more: bool,
    #[allow(dead_code)]
    cursor: Option<String>,
}

/// HTTP(S)+WebSocket backed [`RemoteConnector`].
pub struct HttpRemoteConnector {
    base_url: String,
    http: reqwest::Client,
    credentials: CredentialWatch,
    read_limit: u32,
}

impl HttpRemoteConnector {
    pub fn new(base_url: impl Into<String>, credentials: CredentialWatch, read_limit: u32) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
            credentials,
            read_limit,
        }
    }

    fn current_credentials(&self) -> ActiveCredentials {
        self.credentials.borrow().clone()
    }

    fn classify_status(status: reqwest::StatusCode) -> ConnectorErrorKind {
        match status.as_u16() {
            401 | 403 => ConnectorErrorKind::Auth,
            500..=599 => ConnectorErrorKind::Transient,
            _ => ConnectorErrorKind::Permanent,
        }
    }

    fn transport_error(err: &reqwest::Error) -> ConnectorError {
        let kind = if err.is_timeout() || err.is_connect() {
            ConnectorErrorKind::Transient
        } else if let Some(status) = err.status() {
            Self::classify_status(status)
        } else {
            ConnectorErrorKind::Transient
        };
        ConnectorError {
            kind,
            message: err.to_string(),
        }
    }
}

fn new_call() -> (CancelToken, mpsc::UnboundedSender<ConnectorEvent>, ConnectorCall) {
    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let call = ConnectorCall {
        token: CancelToken(cancel.clone()),
        events: rx,
    };
    (CancelToken(cancel), tx, call)
}

#[async_trait]
impl RemoteConnector for HttpRemoteConnector {
    #[tracing::instrument(skip(self))]
    async fn get_changes(&self, table: &str, since: Option<DateTime<Utc>>) -> ConnectorCall {
        let (token, tx, call) = new_call();
        let http = self.http.clone();
        let base_url = self.base_url.clone();
        let creds = self.current_credentials();
        let read_limit = self.read_limit;
        let table = table.to_string();
        let cancel = token.0.clone();

        tokio::spawn(async move {
            let mut cursor: Option<String> = None;
            let mut first = true;
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                let mut req = http
                    .get(format!("{base_url}/tables/{table}/changes"))
                    .bearer_auth(&creds.id_token)
                    .query(&[("user_id", creds.user_id.as_str())])
                    .query(&[("limit", read_limit)]);
                if first {
                    if let Some(since) = since {
                        req = req.query(&[("since", since.to_rfc3339())]);
                    }
                } else if let Some(c) = &cursor {
                    req = req.query(&[("cursor", c.as_str())]);
                }
                first = false;

                let resp = tokio::select! {
                    _ = cancel.cancelled() => return,
                    r = req.send() => r,
                };
                let page: ChangesPage = match resp.and_then(|r| r.error_for_status()) {
                    Ok(r) => match r.json::<ChangesPage>().await {
                        Ok(p) => p,
                        Err(e) => {
                            let _ = tx.send(ConnectorEvent::Error(HttpRemoteConnector::transport_error(&e)));
                            return;
                        }
                    },
                    Err(e) => {
                        let _ = tx.send(ConnectorEvent::Error(HttpRemoteConnector::transport_error(&e)));
                        return;
                    }
                };

                let has_more = page.has_more;
                cursor = page.cursor.clone();
                let batch: Vec<CloudData> = page.changes.into_iter().map(CloudData::from).collect();
                if tx
                    .send(ConnectorEvent::Downloaded {
                        table: table.clone(),
                        batch,
                        has_more,
                    })
                    .is_err()
                {
                    return;
                }
                if !has_more {
                    let _ = tx.send(ConnectorEvent::SyncDone { table: table.clone() });
                    return;
                }
            }
        });

        call
    }

    #[tracing::instrument(skip(self, data))]
    async fn upload_change(&self, data: CloudData) -> ConnectorCall {
        let (token, tx, call) = new_call();
        let http = self.http.clone();
        let base_url = self.base_url.clone();
        let creds = self.current_credentials();
        let cancel = token.0.clone();

        tokio::spawn(async move {
            let wire = WireCloudData::from(&data);
            let table = data.key.table.clone();
            let resp = tokio::select! {
                _ = cancel.cancelled() => return,
                r = http
                    .put(format!("{base_url}/tables/{table}/changes/{}", data.key.row_id))
                    .bearer_auth(&creds.id_token)
                    .query(&[("user_id", creds.user_id.as_str())])
                    .json(&wire)
                    .send() => r,
            };
            match resp.and_then(|r| r.error_for_status()) {
                Ok(_) => {
                    let _ = tx.send(ConnectorEvent::Uploaded {
                        key: data.key,
                        modified: data.modified,
                    });
                }
                Err(e) => {
                    let _ = tx.send(ConnectorEvent::Error(HttpRemoteConnector::transport_error(&e)));
                }
            }
        });

        call
    }

    #[tracing::instrument(skip(self))]
    async fn subscribe_live(&self, table: &str, since: Option<DateTime<Utc>>) -> ConnectorCall {
        let (token, tx, call) = new_call();
        let base_url = self.base_url.clone();
        let creds = self.current_credentials();
        let table = table.to_string();
        let cancel = token.0.clone();

        tokio::spawn(async move {
            let scheme = if base_url.starts_with("https") { "wss" } else { "ws" };
            let host = base_url.splitn(2, "://").nth(1).unwrap_or(&base_url);
            let mut url = format!(
                "{scheme}://{host}/tables/{table}/live?user_id={}&token={}",
                creds.user_id, creds.id_token
            );
            if let Some(since) = since {
                url.push_str(&format!("&since={}", since.to_rfc3339()));
            }

            let (ws, _) = match tokio::select! {
                _ = cancel.cancelled() => return,
                r = tokio_tungstenite::connect_async(&url) => r,
            } {
                Ok(pair) => pair,
                Err(e) => {
                    let _ = tx.send(ConnectorEvent::LiveSyncError {
                        table: table.clone(),
                        error: ConnectorError {
                            kind: ConnectorErrorKind::Transient,
                            message: e.to_string(),
                        },
                    });
                    return;
                }
            };

            let (mut write, mut read) = ws.split();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = write.send(tokio_tungstenite::tungstenite::Message::Close(None)).await;
                        return;
                    }
                    msg = read.next() => {
                        match msg {
                            Some(Ok(tokio_tungstenite::tungstenite::Message::Text(txt))) => {
                                match serde_json::from_str::<ChangesPage>(&txt) {
                                    Ok(page) => {
                                        let batch: Vec<CloudData> =
                                            page.changes.into_iter().map(CloudData::from).collect();
                                        if tx
                                            .send(ConnectorEvent::Downloaded {
                                                table: table.clone(),
                                                batch,
                                                has_more: page.has_more,
                                            })
                                            .is_err()
                                        {
                                            return;
                                        }
                                    }
                                    Err(e) => {
                                        let _ = tx.send(ConnectorEvent::LiveSyncError {
                                            table: table.clone(),
                                            error: ConnectorError {
                                                kind: ConnectorErrorKind::Permanent,
                                                message: e.to_string(),
                                            },
                                        });
                                    }
                                }
                            }
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                let _ = tx.send(ConnectorEvent::LiveSyncError {
                                    table: table.clone(),
                                    error: ConnectorError {
                                        kind: ConnectorErrorKind::Transient,
                                        message: e.to_string(),
                                    },
                                });
                                return;
                            }
                            None => {
                                let _ = tx.send(ConnectorEvent::LiveSyncError {
                                    table: table.clone(),
                                    error: ConnectorError {
                                        kind: ConnectorErrorKind::Transient,
                                        message: "stream closed".into(),
                                    },
                                });
                                return;
                            }
                        }
                    }
                }
            }
        });

        call
    }

    #[tracing::instrument(skip(self))]
    async fn remove_table(&self, table: &str) -> ConnectorCall {
        let (token, tx, call) = new_call();
        let http = self.http.clone();
        let base_url = self.base_url.clone();
        let creds = self.current_credentials();
        let table = table.to_string();
        let cancel = token.0.clone();

        tokio::spawn(async move {
            let resp = tokio::select! {
                _ = cancel.cancelled() => return,
                r = http
                    .delete(format!("{base_url}/tables/{table}"))
                    .bearer_auth(&creds.id_token)
                    .query(&[("user_id", creds.user_id.as_str())])
                    .send() => r,
            };
            match resp.and_then(|r| r.error_for_status()) {
                Ok(_) => {
                    let _ = tx.send(ConnectorEvent::TableRemoved { table });
                }
                Err(e) => {
                    let _ = tx.send(ConnectorEvent::Error(HttpRemoteConnector::transport_error(&e)));
                }
            }
        });

        call
    }

    #[tracing::instrument(skip(self))]
    async fn remove_user(&self) -> ConnectorCall {
        let (token, tx, call) = new_call();
        let http = self.http.clone();
        let base_url = self.base_url.clone();
        let creds = self.current_credentials();
        let cancel = token.0.clone();

        tokio::spawn(async move {
            let resp = tokio::select! {
                _ = cancel.cancelled() => return,
                r = http
                    .delete(format!("{base_url}/user"))
                    .bearer_auth(&creds.id_token)
                    .query(&[("user_id", creds.user_id.as_str())])
                    .send() => r,
            };
            match resp.and_then(|r| r.error_for_status()) {
                Ok(_) => {
                    let _ = tx.send(ConnectorEvent::RemovedUser);
                }
                Err(e) => {
                    let _ = tx.send(ConnectorEvent::Error(HttpRemoteConnector::transport_error(&e)));
                }
            }
        });

        call
    }
}

/// Shared, watchable credential cell written by `EngineDataModel`, read by
/// the connector; updates are point-in-time consistent.
pub fn credential_channel(initial: ActiveCredentials) -> (watch::Sender<ActiveCredentials>, CredentialWatch) {
    watch::channel(initial)
}

pub type SharedConnector = Arc<dyn RemoteConnector>;

#[allow(dead_code)]
fn assert_send_sync<T: Send + Sync>() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connector_error_kind_maps_to_error_kind() {
        let e = ConnectorError {
            kind: ConnectorErrorKind::Auth,
            message: "nope".into(),
        };
        assert_eq!(ErrorKind::from(&e), ErrorKind::Authentication);
    }

    #[test]
    fn duration_constants_are_sane() {
        assert!(Duration::from_secs(5) < Duration::from_secs(600));
    }
}
