use anyhow::Result;
use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod backend;
mod config;
mod errors;
mod executor;
mod handlers;
mod models;
mod protocol;
mod routes;
mod services;

use backend::{Backend, local::LocalBackend, remote::RemoteBackend};
use config::{AppConfig, BackendKind, Mode};
use executor::TcpConnector;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + mode ---
    let (cfg, mode) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting asset-store ({:?}) with config: {:?}", mode, cfg);

    match mode {
        Mode::Serve => serve(&cfg).await,
        Mode::Node => run_node(&cfg).await,
        Mode::Provision => {
            remote_backend(&cfg).provision().await?;
            tracing::info!("Store node at {} is provisioned.", cfg.node_addr);
            Ok(())
        }
    }
}

fn remote_backend(cfg: &AppConfig) -> RemoteBackend {
    RemoteBackend::new(
        TcpConnector::new(cfg.node_addr.clone()),
        cfg.connect_options(),
        cfg.retry_policy(),
    )
}

/// Serve the HTTP API over the configured backend.
async fn serve(cfg: &AppConfig) -> Result<()> {
    // --- Initialize backend ---
    let backend: Arc<dyn Backend> = match cfg.backend {
        BackendKind::Local => {
            let local = LocalBackend::open(&cfg.storage_dir).await?;
            tracing::info!("Using local storage at {}", local.root().display());
            Arc::new(local)
        }
        BackendKind::Remote => {
            let remote = remote_backend(cfg);
            remote.provision().await?;
            tracing::info!("Using store node at {}", cfg.node_addr);
            Arc::new(remote)
        }
    };

    // --- Initialize core service ---
    let store = services::asset_store::AssetStore::new(backend);

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(store);

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

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Run a store node backed by SQLite.
async fn run_node(cfg: &AppConfig) -> Result<()> {
    let db_url = &cfg.node_database_url;
    tracing::debug!("Connecting using raw URL => {}", db_url);

    // Create parent directory of a file database if needed
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if !db_path.starts_with(":memory:") {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }
    }

    let options = SqliteConnectOptions::from_str(db_url)?.create_if_missing(true);
    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?,
    );

    let node = services::store_node::StoreNode::new(db, cfg.auth_token.clone(), cfg.max_frame_len);
    let listener = TcpListener::bind(&cfg.node_addr).await?;
    node.serve(listener).await?;

    Ok(())
}
