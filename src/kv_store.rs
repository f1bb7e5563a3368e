//! `KeyValueStore`: external collaborator for persisted engine state.
//!
//! The engine never implements its own settings storage; this module
//! defines only the trait contract it relies on, plus an in-memory
//! reference implementation used by the CLI and the test suite. A real
//! deployment plugs in a platform keystore/settings backend.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;

/// The fixed namespace every key the engine reads/writes lives under; the
/// engine never scans outside it.
pub const ENGINE_NAMESPACE: &str = "sync_engine/";

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str);
    /// Remove every key under `prefix`.
    async fn remove(&self, prefix: &str);
    /// Flush to durable storage, if the backend buffers writes.
    async fn sync(&self);
}

/// Namespaced key helpers for the engine's persisted-state table.
pub mod keys {
    use super::ENGINE_NAMESPACE;

    pub fn device_id() -> String {
        format!("{ENGINE_NAMESPACE}device_id")
    }
    pub fn refresh_token() -> String {
        format!("{ENGINE_NAMESPACE}auth/refresh_token")
    }
    pub fn expires_at() -> String {
        format!("{ENGINE_NAMESPACE}auth/expires_at")
    }
    pub fn email() -> String {
        format!("{ENGINE_NAMESPACE}auth/email")
    }
    pub fn table_last_sync(table: &str) -> String {
        format!("{ENGINE_NAMESPACE}tables/{table}/last_sync")
    }
}

/// Read the persisted device id, generating and persisting a fresh one the
/// first time the engine runs against a given `KeyValueStore`.
pub async fn ensure_device_id(kv: &dyn KeyValueStore) -> String {
    if let Some(existing) = kv.get(&keys::device_id()).await {
        return existing;
    }
    let fresh = uuid::Uuid::new_v4().to_string();
    kv.set(&keys::device_id(), &fresh).await;
    fresh
}

/// In-memory `KeyValueStore`, for tests and the CLI's standalone mode.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    inner: Mutex<BTreeMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().get(key).cloned()
    }

    async fn set(&self, key: &str, value: &str) {
        self.inner.lock().insert(key.to_string(), value.to_string());
    }

    async fn remove(&self, prefix: &str) {
        self.inner.lock().retain(|k, _| !k.starts_with(prefix));
    }

    async fn sync(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_device_id_is_stable_across_calls() {
        let store = MemoryKeyValueStore::new();
        let first = ensure_device_id(&store).await;
        let second = ensure_device_id(&store).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn remove_only_clears_matching_prefix() {
        let store = MemoryKeyValueStore::new();
        store.set(&keys::table_last_sync("trips"), "2024-01-01").await;
        store.set(&keys::device_id(), "abc").await;

        store.remove(&format!("{ENGINE_NAMESPACE}tables/")).await;

        assert_eq!(store.get(&keys::table_last_sync("trips")).await, None);
        assert_eq!(store.get(&keys::device_id()).await, Some("abc".to_string()));
    }
}
