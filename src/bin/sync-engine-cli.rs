//! Manual smoke-test binary: wires a real `sqlite` file to a live backend
//! and runs one table through the engine until Ctrl-C. Not part of the
//! public API; useful for exercising the state charts against a real server
//! during development.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use sync_engine::{Engine, HttpRemoteConnector, IdentityTransformer, MemoryKeyValueStore, TableRuntimeConfig, WatcherHandle};
use sync_engine::connector::SharedConnector;
use sync_engine::credentials::StaticCredentialSource;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut args = env::args().skip(1);
    let db_path = args.next().ok_or("usage: sync-engine-cli <db-path> <table>")?;
    let table = args.next().ok_or("usage: sync-engine-cli <db-path> <table>")?;

    let backend_url = env::var("SYNC_ENGINE_BACKEND_URL").unwrap_or_else(|_| "http://localhost:8080".into());
    let user_id = env::var("SYNC_ENGINE_USER_ID").unwrap_or_else(|_| "dev-user".into());
    let id_token = env::var("SYNC_ENGINE_TOKEN").unwrap_or_else(|_| "dev-token".into());

    let (watcher, _changed) = WatcherHandle::spawn(Some(db_path.into()), Box::new(IdentityTransformer))?;

    let (credentials_tx, credentials_rx) = Engine::credential_pair();
    let connector: SharedConnector = Arc::new(HttpRemoteConnector::new(backend_url, credentials_rx, 200));

    let source = StaticCredentialSource {
        user_id,
        id_token,
        refresh_token: String::new(),
        expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
    };

    let (engine, mut errors) = Engine::new(
        watcher,
        connector,
        Box::new(source),
        Arc::new(MemoryKeyValueStore::new()),
        credentials_tx,
        TableRuntimeConfig::default(),
    );

    tokio::spawn(async move {
        while let Some(err) = errors.recv().await {
            let table = err.table.as_deref().unwrap_or("<engine>");
            tracing::warn!(table, kind = ?err.info.kind, message = %err.info.message, "engine error");
        }
    });

    engine.start();
    engine.sync_table(&table, false).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
        _ = tokio::time::sleep(Duration::from_secs(3600)) => {}
    }

    engine.stop();
    engine.wait_for_stopped(Duration::from_secs(30)).await;
    Ok(())
}
