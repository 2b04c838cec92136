use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub generator: GeneratorConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub request: RequestConfig,
    pub scheduler: SchedulerConfig,
    pub permadeath: PermadeathConfig,
}

/// Narrative generator API configuration
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub api_key: String,
    pub base_url: String,
    pub pipe: String,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// HTTP request configuration
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

/// Consequence sweep configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub sweep_interval_secs: u64,
}

/// Permadeath evaluation configuration
#[derive(Debug, Clone)]
pub struct PermadeathConfig {
    /// Danger level at or above which a turn asks for a lethal judgement.
    pub lethal_check_min_danger: u8,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let generator = GeneratorConfig {
            api_key: env::var("GENERATOR_API_KEY").map_err(|_| AppError::Config {
                message: "GENERATOR_API_KEY is required".to_string(),
            })?,
            base_url: env::var("GENERATOR_BASE_URL")
                .unwrap_or_else(|_| "https://api.langbase.com".to_string()),
            pipe: env::var("GENERATOR_PIPE")
                .unwrap_or_else(|_| "narrative-generator-v1".to_string()),
        };

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/narrative.db".to_string()),
            ),
            max_connections: parse_var("DATABASE_MAX_CONNECTIONS").unwrap_or(5),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let request = RequestConfig {
            timeout_ms: parse_var("REQUEST_TIMEOUT_MS").unwrap_or(30000),
            max_retries: parse_var("MAX_RETRIES").unwrap_or(3),
            retry_delay_ms: parse_var("RETRY_DELAY_MS").unwrap_or(1000),
        };

        let scheduler = SchedulerConfig {
            sweep_interval_secs: parse_var("SWEEP_INTERVAL_SECS").unwrap_or(3600),
        };

        let permadeath = PermadeathConfig {
            lethal_check_min_danger: parse_var("LETHAL_CHECK_MIN_DANGER").unwrap_or(6),
        };

        Ok(Config {
            generator,
            database,
            logging,
            request,
            scheduler,
            permadeath,
        })
    }
}

fn parse_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.parse().ok())
}

impl SchedulerConfig {
    /// Sweep period as a [`Duration`]; a zero interval is clamped to one second.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30000,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 3600,
        }
    }
}

impl Default for PermadeathConfig {
    fn default() -> Self {
        Self {
            lethal_check_min_danger: 6,
        }
    }
}
