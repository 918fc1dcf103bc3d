use anyhow::{Context, Result};
use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use config::{AppConfig, Backend};
use handlers::AppState;
use services::{
    disk_store::DiskStore,
    locker::MemoryLocker,
    memory_store::MemoryStore,
    notifier::{self, CompletionNotifier},
    store::DataStore,
    upload_service::UploadService,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting tus-store with config: {:?}", cfg);

    // --- Initialize storage backend ---
    let store: Arc<dyn DataStore> = match cfg.backend {
        Backend::Disk => {
            let disk = open_disk_store(&cfg).await?;
            if migrate {
                disk.migrate().await.context("running migrations")?;
                tracing::info!("Database migration complete.");
                return Ok(()); // exit after migration
            }
            // Schema statements are idempotent.
            disk.migrate().await.context("applying schema")?;
            Arc::new(disk)
        }
        Backend::Memory => {
            if migrate {
                tracing::warn!("--migrate has no effect with the memory backend");
                return Ok(());
            }
            Arc::new(MemoryStore::new())
        }
    };

    // --- Completion notifications ---
    let (completions, receiver) = CompletionNotifier::channel(cfg.completion_buffer);
    tokio::spawn(notifier::drain(receiver));

    // --- Initialize core service ---
    let uploads = UploadService::new(store, MemoryLocker::new(), completions, cfg.max_size);
    let state = AppState {
        uploads,
        base_path: cfg.base_path.clone(),
    };

    // --- Build router ---
    let app: Router = routes::routes::routes(&cfg.base_path).with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!(
        "Server listening on http://{}{}",
        listener.local_addr()?,
        cfg.base_path
    );
    axum::serve(listener, app).await?;

    Ok(())
}

/// Prepare directories and connect the SQLite-backed disk store.
async fn open_disk_store(cfg: &AppConfig) -> Result<DiskStore> {
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    let db_url = &cfg.database_url;
    tracing::debug!("Connecting using raw URL => {}", db_url);

    let options = SqliteConnectOptions::from_str(db_url)
        .with_context(|| format!("parsing database URL `{}`", db_url))?
        .create_if_missing(true);

    // Create parent directory if needed
    if let Some(parent) = options.get_filename().parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let db = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("connecting to {}", db_url))?;

    Ok(DiskStore::new(Arc::new(db), cfg.storage_dir.clone()))
}
