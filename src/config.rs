//! Worker configuration.
//!
//! All options are environment-driven with sensible defaults, validated
//! once at startup. Builder methods exist for the handful of settings
//! tests need to pin.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for a worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    // Queue service
    /// Redis connection URL.
    pub redis_url: String,

    // Data store
    /// PostgreSQL connection URL.
    pub database_url: String,

    // Worker settings
    /// Simultaneous jobs per campaign-type queue.
    pub concurrency_per_queue: usize,
    /// Process memory ceiling in MB; jobs are refused above it.
    pub max_memory_mb: u64,
    /// Port the health/status endpoint binds to.
    pub health_port: u16,
    /// How long draining waits for in-flight jobs.
    pub shutdown_timeout: Duration,
    /// Maximum processing duration for a single job.
    pub job_timeout: Duration,
    /// Interval between stalled-job sweeps.
    pub stalled_check_interval: Duration,
    /// Redeliveries allowed for a stalled job before terminal failure.
    pub max_stalled_deliveries: u32,

    // Telephony
    /// Base URL of the voice provider API.
    pub voice_api_url: String,
    /// API token for the voice provider.
    pub voice_api_token: String,
    /// Status-callback target handed to the provider.
    pub callback_url: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379/0".to_string(),
            database_url: "postgres://localhost/callforge".to_string(),
            concurrency_per_queue: 3,
            max_memory_mb: 512,
            health_port: 8080,
            shutdown_timeout: Duration::from_millis(30_000),
            job_timeout: Duration::from_millis(300_000),
            stalled_check_interval: Duration::from_millis(30_000),
            max_stalled_deliveries: 2,
            voice_api_url: "http://localhost:9090".to_string(),
            voice_api_token: "dev-token".to_string(),
            callback_url: "http://localhost:8080/callbacks/voice".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Loads configuration from the environment.
    ///
    /// # Environment Variables
    ///
    /// - `CALLFORGE_REDIS_URL`: full Redis URL; overrides the host parts
    /// - `CALLFORGE_REDIS_HOST` / `CALLFORGE_REDIS_PORT` /
    ///   `CALLFORGE_REDIS_PASSWORD` / `CALLFORGE_REDIS_DB`: assembled
    ///   into a URL when no full URL is given
    /// - `DATABASE_URL`: PostgreSQL connection URL (required)
    /// - `CALLFORGE_CONCURRENCY`: jobs per queue (default: 3)
    /// - `CALLFORGE_MAX_MEMORY_MB`: memory ceiling (default: 512)
    /// - `CALLFORGE_HEALTH_PORT`: status endpoint port (default: 8080)
    /// - `CALLFORGE_SHUTDOWN_TIMEOUT_MS`: drain deadline (default: 30000)
    /// - `CALLFORGE_JOB_TIMEOUT_MS`: per-job deadline (default: 300000)
    /// - `CALLFORGE_STALLED_CHECK_INTERVAL_MS`: sweep interval
    ///   (default: 30000)
    /// - `CALLFORGE_MAX_STALLED_DELIVERIES`: stalled redelivery ceiling
    ///   (default: 2)
    /// - `CALLFORGE_VOICE_API_URL`: voice provider base URL (required)
    /// - `CALLFORGE_VOICE_API_TOKEN`: voice provider token (required)
    /// - `CALLFORGE_CALLBACK_URL`: status-callback target (required)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or any
    /// value fails to parse or validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.redis_url = match std::env::var("CALLFORGE_REDIS_URL") {
            Ok(url) => url,
            Err(_) => {
                let host = std::env::var("CALLFORGE_REDIS_HOST")
                    .unwrap_or_else(|_| "localhost".to_string());
                let port = std::env::var("CALLFORGE_REDIS_PORT")
                    .unwrap_or_else(|_| "6379".to_string());
                let db =
                    std::env::var("CALLFORGE_REDIS_DB").unwrap_or_else(|_| "0".to_string());
                match std::env::var("CALLFORGE_REDIS_PASSWORD") {
                    Ok(password) => format!("redis://:{}@{}:{}/{}", password, host, port, db),
                    Err(_) => format!("redis://{}:{}/{}", host, port, db),
                }
            }
        };

        config.database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?;

        if let Ok(val) = std::env::var("CALLFORGE_CONCURRENCY") {
            config.concurrency_per_queue = parse_env_value(&val, "CALLFORGE_CONCURRENCY")?;
        }

        if let Ok(val) = std::env::var("CALLFORGE_MAX_MEMORY_MB") {
            config.max_memory_mb = parse_env_value(&val, "CALLFORGE_MAX_MEMORY_MB")?;
        }

        if let Ok(val) = std::env::var("CALLFORGE_HEALTH_PORT") {
            config.health_port = parse_env_value(&val, "CALLFORGE_HEALTH_PORT")?;
        }

        if let Ok(val) = std::env::var("CALLFORGE_SHUTDOWN_TIMEOUT_MS") {
            let ms: u64 = parse_env_value(&val, "CALLFORGE_SHUTDOWN_TIMEOUT_MS")?;
            config.shutdown_timeout = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("CALLFORGE_JOB_TIMEOUT_MS") {
            let ms: u64 = parse_env_value(&val, "CALLFORGE_JOB_TIMEOUT_MS")?;
            config.job_timeout = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("CALLFORGE_STALLED_CHECK_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "CALLFORGE_STALLED_CHECK_INTERVAL_MS")?;
            config.stalled_check_interval = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("CALLFORGE_MAX_STALLED_DELIVERIES") {
            config.max_stalled_deliveries =
                parse_env_value(&val, "CALLFORGE_MAX_STALLED_DELIVERIES")?;
        }

        config.voice_api_url = std::env::var("CALLFORGE_VOICE_API_URL")
            .map_err(|_| ConfigError::MissingEnvVar("CALLFORGE_VOICE_API_URL".to_string()))?;
        config.voice_api_token = std::env::var("CALLFORGE_VOICE_API_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("CALLFORGE_VOICE_API_TOKEN".to_string()))?;
        config.callback_url = std::env::var("CALLFORGE_CALLBACK_URL")
            .map_err(|_| ConfigError::MissingEnvVar("CALLFORGE_CALLBACK_URL".to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency_per_queue == 0 {
            return Err(ConfigError::ValidationFailed(
                "concurrency_per_queue must be greater than 0".to_string(),
            ));
        }

        if self.max_memory_mb < 128 {
            return Err(ConfigError::ValidationFailed(
                "max_memory_mb must be at least 128 MB".to_string(),
            ));
        }

        if self.shutdown_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "shutdown_timeout must be greater than 0".to_string(),
            ));
        }

        if self.job_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "job_timeout must be greater than 0".to_string(),
            ));
        }

        if self.stalled_check_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "stalled_check_interval must be greater than 0".to_string(),
            ));
        }

        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }

        if self.voice_api_url.is_empty() || self.callback_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "voice_api_url and callback_url cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the per-queue concurrency.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency_per_queue = concurrency;
        self
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Builder method to set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Builder method to set the job timeout.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Builder method to set the health port.
    pub fn with_health_port(mut self, port: u16) -> Self {
        self.health_port = port;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
