use anyhow::Result;
use axum::Router;
use sqlx::sqlite::SqlitePoolOptions;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use services::file_service::{FileService, ServiceSettings};

const MIGRATION_PATH: &str = "migrations/0001_init.sql";

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting file-pipeline with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    let db_path_obj = Path::new(db_path);
    if let Some(parent) = db_path_obj.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    // SQLite will not create the database file on its own
    if !db_path.starts_with(":memory:") {
        if let Err(e) = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(db_path)
        {
            tracing::warn!("Failed to open database file {}: {}", db_path, e);
        }
    }

    let db: Arc<sqlx::Pool<sqlx::Sqlite>> = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await?,
    );

    // --- Handle migration mode ---
    if migrate {
        run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Initialize core service ---
    let settings = ServiceSettings {
        domain: cfg.public_url.clone(),
        file_prefix: cfg.file_prefix.clone(),
        preset_path: cfg.presets_path.clone().into(),
        folder_types: cfg.folder_types.clone(),
        limits: cfg.intake_limits(),
        stream_idle: cfg.stream_idle,
    };
    let service = FileService::new(db.clone(), cfg.storage_dir.clone(), settings);

    // Fail fast on a broken preset table instead of on the first upload
    let presets = service.preset_table().await?;
    tracing::info!(
        resize = presets.resize.len(),
        scale = presets.scale.len(),
        "Loaded preset table from {}",
        cfg.presets_path
    );

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.request_body_limit()).with_state(service);

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

/// Apply the schema script from `migrations/`.
async fn run_migrations(db: &sqlx::Pool<sqlx::Sqlite>) -> Result<()> {
    if !Path::new(MIGRATION_PATH).exists() {
        anyhow::bail!("Migration file not found: {}", MIGRATION_PATH);
    }

    let sql = fs::read_to_string(MIGRATION_PATH)?;
    let applied = services::metadata_store::apply_schema(db, &sql).await?;
    tracing::info!("Ran {} migration statements", applied);
    Ok(())
}
