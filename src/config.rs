//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf, time::Duration};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub polling: PollingConfig,
    pub propagation: PropagationConfig,
    pub http: HttpConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "bridge.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://bridge.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Poll cadence configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    /// Fast poll interval in seconds (default: 600)
    pub fast_interval_seconds: u64,
    /// Slow poll interval in seconds (default: 86400)
    pub slow_interval_seconds: u64,
    /// Grace period after signup with fast polling, in seconds (default: 7 days)
    pub grace_period_seconds: u64,
    /// How often the author's h-feed may be re-crawled, in seconds (default: 2h)
    pub refetch_period_seconds: u64,
    /// Random jitter applied to each poll delay, in percent (default: 20)
    pub jitter_percent: u8,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            fast_interval_seconds: 600,
            slow_interval_seconds: 86_400,
            grace_period_seconds: 7 * 86_400,
            refetch_period_seconds: 2 * 3_600,
            jitter_percent: 20,
        }
    }
}

/// Propagation worker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PropagationConfig {
    /// Lease TTL in seconds (default: 720 = request deadline plus padding)
    pub lease_seconds: u64,
    /// Attempts per target while the outcome stays transient (default: 3)
    pub max_send_attempts: u32,
    /// Linear backoff step between attempts, in milliseconds (default: 500)
    pub retry_backoff_ms: u64,
    /// Maximum concurrently running tasks (default: 8)
    pub task_concurrency: usize,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            lease_seconds: 720,
            max_send_attempts: 3,
            retry_backoff_ms: 500,
            task_concurrency: 8,
        }
    }
}

impl PropagationConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_seconds)
    }
}

/// Outbound HTTP configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Request timeout in seconds (default: 15)
    pub timeout_seconds: u64,
    /// User-Agent header sent on all requests
    pub user_agent: String,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (MENTIONBRIDGE__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.domain", "localhost")?
            .set_default("server.protocol", "http")?
            .set_default("database.path", "data/mentionbridge.db")?
            .set_default("polling.fast_interval_seconds", 600)?
            .set_default("polling.slow_interval_seconds", 86_400)?
            .set_default("polling.grace_period_seconds", 7 * 86_400)?
            .set_default("polling.refetch_period_seconds", 2 * 3_600)?
            .set_default("polling.jitter_percent", 20)?
            .set_default("propagation.lease_seconds", 720)?
            .set_default("propagation.max_send_attempts", 3)?
            .set_default("propagation.retry_backoff_ms", 500)?
            .set_default("propagation.task_concurrency", 8)?
            .set_default("http.timeout_seconds", 15)?
            .set_default("http.user_agent", "MentionBridge/0.1.0")?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("MENTIONBRIDGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        if self.propagation.lease_seconds == 0 {
            return Err(crate::error::AppError::Config(
                "propagation.lease_seconds must be greater than 0".to_string(),
            ));
        }

        if self.propagation.task_concurrency == 0 {
            return Err(crate::error::AppError::Config(
                "propagation.task_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.polling.jitter_percent > 100 {
            return Err(crate::error::AppError::Config(
                "polling.jitter_percent must be between 0 and 100".to_string(),
            ));
        }

        if !is_local_server_domain(&self.server.domain)
            && !self.server.protocol.eq_ignore_ascii_case("https")
        {
            return Err(crate::error::AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}
