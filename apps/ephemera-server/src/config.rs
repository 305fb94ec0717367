//! Configuration management for the Ephemera server

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub upload: UploadConfig,
    pub rate_limit: RateLimitConfig,
    pub csrf: CsrfConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Public origin used for share links and CORS, e.g. `https://files.example.com`
    pub base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Object store segment directory
    pub data_path: PathBuf,
    /// Root for chunk staging directories
    pub staging_path: PathBuf,
    pub cleanup_interval: Duration,
    pub sync_writes: bool,
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub max_upload_size: u64,
    pub allowed_types: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests per window for the general tier
    pub requests: u32,
    pub window: Duration,
    pub cleanup_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct CsrfConfig {
    pub expiration: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

const DEFAULT_MAX_UPLOAD_SIZE: u64 = 1024 * 1024 * 1024;

fn default_staging_path() -> PathBuf {
    env::temp_dir().join("ephemera").join("staging")
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8085,
                base_url: None,
            },
            storage: StorageConfig {
                data_path: PathBuf::from("data"),
                staging_path: default_staging_path(),
                cleanup_interval: Duration::from_secs(60),
                sync_writes: true,
            },
            upload: UploadConfig {
                max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
                allowed_types: vec!["*".to_string()],
            },
            rate_limit: RateLimitConfig {
                requests: 60,
                window: Duration::from_secs(60),
                cleanup_interval: Duration::from_secs(5 * 60),
            },
            csrf: CsrfConfig {
                expiration: Duration::from_secs(60 * 60),
            },
            logging: LoggingConfig {
                format: LogFormat::Pretty,
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let base_url = env::var("BASE_URL")
            .ok()
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty());

        let allowed_types = env::var("ALLOWED_TYPES")
            .map(|value| parse_list(&value))
            .ok()
            .filter(|types| !types.is_empty())
            .unwrap_or(defaults.upload.allowed_types);

        let format = match env::var("LOG_FORMAT") {
            Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "" | "pretty" | "text" => LogFormat::Pretty,
                _ => return Err(ConfigError::Invalid { key: "LOG_FORMAT", value }),
            },
            Err(_) => defaults.logging.format,
        };

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: env_parse("PORT", defaults.server.port)?,
                base_url,
            },
            storage: StorageConfig {
                data_path: env::var("DATA_PATH")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.data_path),
                staging_path: env::var("STAGING_PATH")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.staging_path),
                cleanup_interval: env_secs("CLEANUP_INTERVAL_SECS", defaults.storage.cleanup_interval)?,
                sync_writes: env_bool("SYNC_WRITES", defaults.storage.sync_writes)?,
            },
            upload: UploadConfig {
                max_upload_size: env_parse("MAX_UPLOAD_SIZE", defaults.upload.max_upload_size)?,
                allowed_types,
            },
            rate_limit: RateLimitConfig {
                requests: env_parse("RATE_LIMIT", defaults.rate_limit.requests)?,
                window: env_secs("RATE_LIMIT_WINDOW_SECS", defaults.rate_limit.window)?,
                cleanup_interval: env_secs(
                    "RATE_LIMIT_CLEANUP_SECS",
                    defaults.rate_limit.cleanup_interval,
                )?,
            },
            csrf: CsrfConfig {
                expiration: env_secs("CSRF_EXPIRATION_SECS", defaults.csrf.expiration)?,
            },
            logging: LoggingConfig { format },
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_parse<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) if value.trim().is_empty() => Ok(default),
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let secs = env_parse(key, default.as_secs())?;
    if secs == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: secs.to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

fn env_bool(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env::var(key) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "" => Ok(default),
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid { key, value }),
        },
        Err(_) => Ok(default),
    }
}
