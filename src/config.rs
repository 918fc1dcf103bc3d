use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use std::env;

/// Which storage backend holds upload metadata and payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// SQLite metadata plus payload files under `storage_dir`.
    Disk,
    /// Everything in process memory; lost on exit.
    Memory,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub base_path: String,
    pub max_size: Option<u64>,
    pub completion_buffer: usize,
    pub backend: Backend,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable upload server speaking tus 1.0.0")]
pub struct Args {
    /// Host to bind to (overrides TUS_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides TUS_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where upload payloads are stored (overrides TUS_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides TUS_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// URL path uploads are served under (overrides TUS_STORE_BASE_PATH)
    #[arg(long)]
    pub base_path: Option<String>,

    /// Largest accepted upload in bytes (overrides TUS_STORE_MAX_SIZE)
    #[arg(long)]
    pub max_size: Option<u64>,

    /// Completion events buffered before new ones are dropped
    /// (overrides TUS_STORE_COMPLETION_BUFFER)
    #[arg(long)]
    pub completion_buffer: Option<usize>,

    /// Storage backend (overrides TUS_STORE_BACKEND)
    #[arg(long, value_enum)]
    pub backend: Option<Backend>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Read and parse an optional environment variable.
fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

/// Force a leading and trailing `/`.
fn normalize_base_path(raw: &str) -> Result<String> {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.contains(['{', '}', '*']) {
        bail!("base path `{}` must not contain route wildcards", raw);
    }
    if trimmed.is_empty() {
        Ok("/".into())
    } else {
        Ok(format!("/{}/", trimmed))
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args)?, migrate))
    }

    /// Apply environment fallbacks to parsed CLI arguments.
    pub fn merge(args: Args) -> Result<Self> {
        let env_host = env::var("TUS_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse::<u16>("TUS_STORE_PORT")?.unwrap_or(8080);
        let env_storage =
            env::var("TUS_STORE_STORAGE_DIR").unwrap_or_else(|_| "./data/uploads".into());
        let env_db = env::var("TUS_STORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/uploads.db".into());
        let env_base = env::var("TUS_STORE_BASE_PATH").unwrap_or_else(|_| "/files/".into());
        let env_max = env_parse::<u64>("TUS_STORE_MAX_SIZE")?;
        let env_buffer = env_parse::<usize>("TUS_STORE_COMPLETION_BUFFER")?.unwrap_or(64);
        let env_backend = match env::var("TUS_STORE_BACKEND") {
            Ok(value) => Backend::from_str(&value, true)
                .map_err(|e| anyhow::anyhow!("parsing TUS_STORE_BACKEND: {}", e))?,
            Err(_) => Backend::Disk,
        };

        let base_path = normalize_base_path(&args.base_path.unwrap_or(env_base))?;

        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            base_path,
            max_size: args.max_size.or(env_max),
            completion_buffer: args.completion_buffer.unwrap_or(env_buffer),
            backend: args.backend.unwrap_or(env_backend),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
