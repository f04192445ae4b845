use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub upload: UploadConfig,
    pub swagger: SwaggerConfig,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub cors_allowed_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub busy_timeout_secs: u64,
}

/// Settings for the resumable chunked upload subsystem
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Root directory for finished files, one subdirectory per category
    pub upload_dir: PathBuf,
    /// Root directory for per-upload temp chunk directories
    pub temp_dir: PathBuf,
    /// Maximum size of a whole file in bytes
    pub max_file_size: i64,
    /// Maximum size of a single chunk in bytes
    pub max_chunk_size: i64,
    /// Hard cap on declared chunk count
    pub max_total_chunks: i32,
    /// Session TTL; `expires_at` is fixed at creation, no sliding expiry
    pub session_ttl_secs: i64,
    /// Age after which a chunk lock file is considered stale and reclaimed
    pub lock_stale_secs: u64,
    /// Per-chunk write operation timeout
    pub chunk_write_timeout_secs: u64,
    /// Internal retry attempts for transient chunk-accept failures
    pub max_write_attempts: u32,
    /// Base delay for exponential backoff between attempts
    pub retry_base_delay_ms: u64,
    /// Interval of the background expiry reaper; 0 disables the task
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct SwaggerConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    pub title: String,
    pub version: String,
    pub description: String,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        // Load .env file if exists, ignore if not found (optional for production)
        if let Err(e) = dotenvy::dotenv() {
            if !e.to_string().contains("not found") {
                eprintln!("Warning: Error loading .env file: {}", e);
            }
        }

        Ok(Config {
            app: AppConfig::from_env()?,
            database: DatabaseConfig::from_env()?,
            upload: UploadConfig::from_env()?,
            swagger: SwaggerConfig::from_env()?,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, String> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| format!("{} must be a valid number", key)),
        Err(_) => Ok(default),
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, String> {
        let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env_parse("PORT", 3000u16)?;

        let cors_allowed_origins = env::var("CORS_ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            host,
            port,
            cors_allowed_origins,
        })
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl DatabaseConfig {
    const DEFAULT_MAX_CONNECTIONS: u32 = 10;
    const DEFAULT_MIN_CONNECTIONS: u32 = 1;
    const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 5;
    const DEFAULT_BUSY_TIMEOUT_SECS: u64 = 5;

    pub fn from_env() -> Result<Self, String> {
        let url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://worksite.db".to_string());

        Ok(Self {
            url,
            max_connections: env_parse("DB_MAX_CONNECTIONS", Self::DEFAULT_MAX_CONNECTIONS)?,
            min_connections: env_parse("DB_MIN_CONNECTIONS", Self::DEFAULT_MIN_CONNECTIONS)?,
            acquire_timeout_secs: env_parse(
                "DB_ACQUIRE_TIMEOUT_SECS",
                Self::DEFAULT_ACQUIRE_TIMEOUT_SECS,
            )?,
            busy_timeout_secs: env_parse("DB_BUSY_TIMEOUT_SECS", Self::DEFAULT_BUSY_TIMEOUT_SECS)?,
        })
    }
}

impl UploadConfig {
    const DEFAULT_MAX_FILE_SIZE: i64 = 10 * 1024 * 1024; // 10MB
    const DEFAULT_MAX_CHUNK_SIZE: i64 = 5 * 1024 * 1024; // 5MB
    const DEFAULT_SESSION_TTL_SECS: i64 = 24 * 60 * 60; // 24 hours
    const DEFAULT_LOCK_STALE_SECS: u64 = 30;
    const DEFAULT_CHUNK_WRITE_TIMEOUT_SECS: u64 = 30;
    const DEFAULT_MAX_WRITE_ATTEMPTS: u32 = 3;
    const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 50;
    const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 3600;

    pub fn from_env() -> Result<Self, String> {
        let upload_dir = PathBuf::from(
            env::var("UPLOAD_DIR").unwrap_or_else(|_| "storage/uploads".to_string()),
        );
        let temp_dir = PathBuf::from(
            env::var("UPLOAD_TEMP_DIR").unwrap_or_else(|_| "storage/tmp_chunks".to_string()),
        );

        Ok(Self {
            upload_dir,
            temp_dir,
            max_file_size: env_parse("MAX_FILE_SIZE", Self::DEFAULT_MAX_FILE_SIZE)?,
            max_chunk_size: env_parse("MAX_CHUNK_SIZE", Self::DEFAULT_MAX_CHUNK_SIZE)?,
            max_total_chunks: env_parse(
                "MAX_TOTAL_CHUNKS",
                crate::shared::constants::MAX_TOTAL_CHUNKS,
            )?,
            session_ttl_secs: env_parse("UPLOAD_SESSION_TTL_SECS", Self::DEFAULT_SESSION_TTL_SECS)?,
            lock_stale_secs: env_parse("CHUNK_LOCK_STALE_SECS", Self::DEFAULT_LOCK_STALE_SECS)?,
            chunk_write_timeout_secs: env_parse(
                "CHUNK_WRITE_TIMEOUT_SECS",
                Self::DEFAULT_CHUNK_WRITE_TIMEOUT_SECS,
            )?,
            max_write_attempts: env_parse(
                "CHUNK_WRITE_MAX_ATTEMPTS",
                Self::DEFAULT_MAX_WRITE_ATTEMPTS,
            )?,
            retry_base_delay_ms: env_parse(
                "CHUNK_RETRY_BASE_DELAY_MS",
                Self::DEFAULT_RETRY_BASE_DELAY_MS,
            )?,
            cleanup_interval_secs: env_parse(
                "UPLOAD_CLEANUP_INTERVAL_SECS",
                Self::DEFAULT_CLEANUP_INTERVAL_SECS,
            )?,
        })
    }
}

impl SwaggerConfig {
    pub fn from_env() -> Result<Self, String> {
        // Only use credentials if they are non-empty
        let username = env::var("SWAGGER_USERNAME").ok().filter(|s| !s.is_empty());
        let password = env::var("SWAGGER_PASSWORD").ok().filter(|s| !s.is_empty());
        let title = env::var("SWAGGER_TITLE").unwrap_or_else(|_| "Worksite API".to_string());
        let version = env::var("SWAGGER_VERSION").unwrap_or_else(|_| "0.1.0".to_string());
        let description = env::var("SWAGGER_DESCRIPTION")
            .unwrap_or_else(|_| "Resumable chunked upload API for Worksite".to_string());

        Ok(Self {
            username,
            password,
            title,
            version,
            description,
        })
    }

    /// Returns credentials in "username:password" format if auth is enabled
    pub fn credentials(&self) -> Option<String> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some(format!("{}:{}", user, pass)),
            _ => None,
        }
    }
}
