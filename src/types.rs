//! Wire-level and shadow-table data model.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `(table_name, row_id)`. `row_id` is the canonical textual form of the
/// primary key; binary primary keys are Base64-encoded so the pair round
/// trips exactly across the cloud boundary.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub table: String,
    pub row_id: String,
}

impl ObjectKey {
    pub fn new(table: impl Into<String>, row_id: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            row_id: row_id.into(),
        }
    }

    /// Encode a raw primary-key byte string as the canonical `row_id`.
    pub fn encode_binary_pkey(bytes: &[u8]) -> String {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    /// Inverse of [`encode_binary_pkey`]; used when re-deriving the raw
    /// primary key bytes from a wire `row_id`.
    pub fn decode_binary_pkey(row_id: &str) -> Result<Vec<u8>, base64::DecodeError> {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD.decode(row_id)
    }
}

/// A row's payload as it travels over the wire: field name -> scalar value.
/// Absence of a payload (`None` on [`CloudData::data`]) means a tombstone.
pub type Payload = BTreeMap<String, serde_json::Value>;

/// Wire-level row. Equality compares all fields; `modified` is the
/// ordering key used for last-writer-wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudData {
    pub key: ObjectKey,
    /// `None` = tombstone (the row was deleted).
    pub data: Option<Payload>,
    pub modified: DateTime<Utc>,
    /// Opaque, used only for backend concurrency if the backend supplies one.
    pub version: Option<String>,
}

impl CloudData {
    pub fn tombstone(key: ObjectKey, modified: DateTime<Utc>) -> Self {
        Self {
            key,
            data: None,
            modified,
            version: None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.data.is_none()
    }
}

/// [`CloudData`] plus the local `uploaded` timestamp, set when the engine
/// persists a row that came from the cloud; used to advance `last_sync`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalData {
    pub cloud: CloudData,
    pub uploaded: Option<DateTime<Utc>>,
}

/// Per-table activation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableState {
    Active,
    Inactive,
}

/// One row per synced table, held in the engine-owned `meta` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMeta {
    pub table_name: String,
    pub pkey_name: String,
    pub pkey_type: String,
    pub state: TableState,
    /// `None` means "full resync required".
    pub last_sync: Option<DateTime<Utc>>,
}

/// The set of columns considered part of the synced payload for a table.
/// `None` means every column is synced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SyncField(pub Option<Vec<String>>);

impl SyncField {
    pub fn all() -> Self {
        Self(None)
    }

    pub fn only(fields: Vec<String>) -> Self {
        Self(Some(fields))
    }

    pub fn is_projected(&self, field: &str) -> bool {
        match &self.0 {
            None => true,
            Some(fields) => fields.iter().any(|f| f == field),
        }
    }

    /// Drop remote fields that are not part of the projection; unknown
    /// remote fields are silently dropped on write.
    pub fn project(&self, payload: &Payload) -> Payload {
        match &self.0 {
            None => payload.clone(),
            Some(fields) => payload
                .iter()
                .filter(|(k, _)| fields.iter().any(|f| f == *k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

/// Dirty/corrupted marker for one tracked row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangedState {
    Unchanged,
    Changed,
    Corrupted,
}

/// One shadow-table row, mirrored in memory for the state-chart fibers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowRow {
    pub pkey: String,
    pub tstamp: DateTime<Utc>,
    pub changed: ChangedState,
}

/// Result of [`crate::watcher::DatabaseWatcher::store_remote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreResult {
    Applied,
    RejectedStale,
}

/// Declarative modifiers to `resync()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResyncFlag {
    Download,
    Upload,
    CheckLocalData,
    CleanLocalData,
    ClearLocalData,
}

/// Configuration passed to [`crate::watcher::DatabaseWatcher::add_table`].
#[derive(Debug, Clone)]
pub struct TableConfig {
    pub table: String,
    pub fields: SyncField,
    pub force_recreate: bool,
}

impl TableConfig {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            fields: SyncField::all(),
            force_recreate: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_pkey_round_trips_through_base64() {
        let raw = vec![0u8, 1, 2, 255, 254, 253];
        let encoded = ObjectKey::encode_binary_pkey(&raw);
        let decoded = ObjectKey::decode_binary_pkey(&encoded).unwrap();
        assert_eq!(raw, decoded);
    }

    #[test]
    fn sync_field_projects_unknown_columns_away() {
        let fields = SyncField::only(vec!["name".into(), "value".into()]);
        let mut payload = Payload::new();
        payload.insert("name".into(), serde_json::json!("a"));
        payload.insert("value".into(), serde_json::json!(1));
        payload.insert("secret".into(), serde_json::json!("drop me"));

        let projected = fields.project(&payload);
        assert_eq!(projected.len(), 2);
        assert!(!projected.contains_key("secret"));
    }
}
