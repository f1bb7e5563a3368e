pub mod connector;
pub mod credentials;
pub mod engine;
pub mod engine_fsm;
pub mod error;
pub mod kv_store;
pub mod merge;
pub mod table_fsm;
pub mod transformer;
pub mod types;
pub mod watcher;

pub use connector::{ActiveCredentials, ConnectorEvent, HttpRemoteConnector, RemoteConnector, SharedConnector};
pub use credentials::{CredentialSource, SignInOutcome};
pub use engine::{DatabaseSyncFlag, Engine, EngineError, TableSyncController};
pub use engine_fsm::EngineState;
pub use error::{ErrorInfo, ErrorKind, SyncError};
pub use kv_store::{ensure_device_id, KeyValueStore, MemoryKeyValueStore};
pub use table_fsm::{SyncMode, SyncState, TableRuntimeConfig};
pub use transformer::{CloudTransformer, IdentityTransformer};
pub use types::{CloudData, LocalData, ObjectKey, ResyncFlag, TableConfig};
pub use watcher::handle::WatcherHandle;
pub use watcher::DatabaseWatcher;
