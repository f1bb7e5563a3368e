use thiserror::Error;

/// Errors surfaced by any engine component.
///
/// Every fallible operation in this crate returns `Result<T, SyncError>`;
/// the state charts (`table_fsm`, `engine_fsm`) classify these into
/// [`ErrorKind`] before deciding retry vs. abort vs. escalate.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid state: {0}")]
    State(&'static str),

    #[error("schema error for table {table}: {reason}")]
    Schema { table: String, reason: String },

    #[error("transform failed for {table}/{row_id}: {reason}")]
    TransformFailed {
        table: String,
        row_id: String,
        reason: String,
    },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("remote error ({status}): {message}")]
    Remote { status: u16, message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Coarse error classification consumed by the state charts.
///
/// This is deliberately smaller than [`SyncError`]: several distinct
/// `SyncError` variants can map to the same `ErrorKind`, and a kind never
/// carries enough detail to reconstruct the original error. The full
/// `SyncError` is always logged and carried alongside for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retry inside the affected region with backoff; engine state unchanged.
    TransientNetwork,
    /// 401/403 or token parse failure; escalates to `EngineDataModel`.
    Authentication,
    /// 4xx other than auth, or schema rejection; table moves to Error.
    PermanentRemote,
    /// Encrypt/decrypt failed; row marked Corrupted, sync continues.
    TransformFailure,
    /// SQL error; table moves to Error, engine continues.
    Database,
    /// Reported synchronously from `add_table` / `sync_database`.
    SchemaError,
    /// Never surfaced; swallowed at region boundaries.
    Cancelled,
}

impl SyncError {
    pub fn classify(&self) -> ErrorKind {
        match self {
            SyncError::Sqlite(_) => ErrorKind::Database,
            SyncError::Serde(_) => ErrorKind::Database,
            SyncError::Transport(e) => {
                if e.is_timeout() || e.is_connect() {
                    ErrorKind::TransientNetwork
                } else if let Some(status) = e.status() {
                    classify_http_status(status.as_u16())
                } else {
                    ErrorKind::TransientNetwork
                }
            }
            SyncError::State(_) => ErrorKind::Database,
            SyncError::Schema { .. } => ErrorKind::SchemaError,
            SyncError::TransformFailed { .. } => ErrorKind::TransformFailure,
            SyncError::Authentication(_) => ErrorKind::Authentication,
            SyncError::Remote { status, .. } => classify_http_status(*status),
            SyncError::Cancelled => ErrorKind::Cancelled,
            SyncError::Timeout(_) => ErrorKind::TransientNetwork,
        }
    }
}

fn classify_http_status(status: u16) -> ErrorKind {
    match status {
        401 | 403 => ErrorKind::Authentication,
        500..=599 => ErrorKind::TransientNetwork,
        400..=499 => ErrorKind::PermanentRemote,
        _ => ErrorKind::TransientNetwork,
    }
}

/// The typed information carried by `engine.error_occured`.
#[derive(Debug, Clone)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    /// Opaque blob identifying the offending table/row, surfaced verbatim to
    /// the application.
    pub data: Option<serde_json::Value>,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_remote_status_codes() {
        let auth = SyncError::Remote {
            status: 401,
            message: "nope".into(),
        };
        assert_eq!(auth.classify(), ErrorKind::Authentication);

        let perm = SyncError::Remote {
            status: 422,
            message: "bad schema".into(),
        };
        assert_eq!(perm.classify(), ErrorKind::PermanentRemote);

        let transient = SyncError::Remote {
            status: 503,
            message: "retry later".into(),
        };
        assert_eq!(transient.classify(), ErrorKind::TransientNetwork);
    }

    #[test]
    fn schema_and_transform_errors_classify_correctly() {
        let schema = SyncError::Schema {
            table: "trips".into(),
            reason: "composite pk".into(),
        };
        assert_eq!(schema.classify(), ErrorKind::SchemaError);

        let transform = SyncError::TransformFailed {
            table: "trips".into(),
            row_id: "1".into(),
            reason: "bad key".into(),
        };
        assert_eq!(transform.classify(), ErrorKind::TransformFailure);
    }
}
