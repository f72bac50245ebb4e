use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

use crate::services::intake::IntakeLimits;

/// Where the static file server exposes the storage root by default.
const DEFAULT_PUBLIC_URL: &str = "http://localhost:3000/files";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments; CLI wins.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub presets_path: String,
    /// Public base URL returned as `domain` next to relative file URLs.
    pub public_url: String,
    pub file_prefix: String,
    pub max_file_size: u64,
    pub max_file_count: usize,
    /// Lowercase extensions without dots; empty allows all.
    pub allowed_extensions: Vec<String>,
    pub folder_types: Vec<String>,
    pub stream_idle: Duration,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "File ingestion and derivative pipeline")]
pub struct Args {
    /// Host to bind to (overrides FILE_PIPELINE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides FILE_PIPELINE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Root directory for stored files (overrides FILE_PIPELINE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides FILE_PIPELINE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Preset table JSON file (overrides FILE_PIPELINE_PRESETS)
    #[arg(long)]
    pub presets: Option<String>,

    /// Public base URL (overrides FILE_PIPELINE_PUBLIC_URL)
    #[arg(long)]
    pub public_url: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();

        let port = env_parse("FILE_PIPELINE_PORT", 3000u16)?;
        let cfg = Self {
            host: args
                .host
                .unwrap_or_else(|| env_or("FILE_PIPELINE_HOST", "0.0.0.0")),
            port: args.port.unwrap_or(port),
            storage_dir: args
                .storage_dir
                .unwrap_or_else(|| env_or("FILE_PIPELINE_STORAGE_DIR", "./data/files")),
            database_url: args.database_url.unwrap_or_else(|| {
                env_or(
                    "FILE_PIPELINE_DATABASE_URL",
                    "sqlite://./data/meta/file_pipeline.db",
                )
            }),
            presets_path: args.presets.unwrap_or_else(|| {
                env_or("FILE_PIPELINE_PRESETS", "./config/file_upload_option.json")
            }),
            public_url: args
                .public_url
                .unwrap_or_else(|| env_or("FILE_PIPELINE_PUBLIC_URL", DEFAULT_PUBLIC_URL)),
            file_prefix: env_or("FILE_PIPELINE_FILE_PREFIX", "file"),
            max_file_size: env_parse("FILE_PIPELINE_MAX_FILE_SIZE", 10 * 1024 * 1024)?,
            max_file_count: env_parse("FILE_PIPELINE_MAX_FILE_COUNT", 20)?,
            allowed_extensions: parse_list(&env_or("FILE_PIPELINE_ALLOWED_EXT", ""))
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            folder_types: parse_list(&env_or("FILE_PIPELINE_FOLDER_TYPES", "")),
            stream_idle: Duration::from_secs(env_parse("FILE_PIPELINE_STREAM_IDLE_SECS", 30)?),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn intake_limits(&self) -> IntakeLimits {
        IntakeLimits {
            max_file_size: self.max_file_size,
            max_file_count: self.max_file_count,
            allowed_extensions: self.allowed_extensions.clone(),
        }
    }

    /// Upper bound for a whole multipart request: every file at the limit
    /// plus room for the text fields.
    pub fn request_body_limit(&self) -> usize {
        let files = self.max_file_size.saturating_mul(self.max_file_count as u64);
        usize::try_from(files.saturating_add(1024 * 1024)).unwrap_or(usize::MAX)
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.into())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
