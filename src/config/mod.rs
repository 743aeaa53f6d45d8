use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::AppError;

/// Lowest heartbeat cadence a stream may be configured with.
pub const MIN_HEARTBEAT_MS: u64 = 3000;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub generation: GenerationConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub request: RequestConfig,
    pub retry: RetryConfig,
    pub streaming: StreamingConfig,
    pub server: ServerConfig,
}

/// Generative text API configuration
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
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

/// Outbound HTTP request configuration
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub timeout_ms: u64,
}

/// Staged retry budget for generative calls
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub min_output_tokens: u32,
    pub max_output_tokens_cap: u32,
    pub backoff_ms: u64,
}

/// Streaming transport configuration
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    pub heartbeat_ms: u64,
    pub meta_flush_queue: usize,
    /// Bus events buffered per session before new ones are dropped.
    pub event_buffer: usize,
    /// Idle time after which a run's stream meta leaves memory.
    pub meta_idle_ttl_secs: u64,
}

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Applied to the request/response routes only; streams are long-lived.
    pub request_timeout: Option<Duration>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let generation = GenerationConfig {
            api_key: env::var("GENERATION_API_KEY").map_err(|_| AppError::Config {
                message: "GENERATION_API_KEY is required".to_string(),
            })?,
            base_url: env::var("GENERATION_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com".to_string()),
            model: env::var("GENERATION_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
        };

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/relay.db".to_string()),
            ),
            max_connections: parse_env("DATABASE_MAX_CONNECTIONS").unwrap_or(5),
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
            timeout_ms: parse_env("REQUEST_TIMEOUT_MS").unwrap_or(30000),
        };

        let defaults = RetryConfig::default();
        let retry = RetryConfig {
            max_attempts: parse_env("RETRY_MAX_ATTEMPTS").unwrap_or(defaults.max_attempts),
            min_output_tokens: parse_env("RETRY_MIN_OUTPUT_TOKENS")
                .unwrap_or(defaults.min_output_tokens),
            max_output_tokens_cap: parse_env("RETRY_MAX_OUTPUT_TOKENS_CAP")
                .unwrap_or(defaults.max_output_tokens_cap),
            backoff_ms: parse_env("RETRY_BACKOFF_MS").unwrap_or(defaults.backoff_ms),
        };

        let streaming = StreamingConfig {
            heartbeat_ms: parse_env("STREAM_HEARTBEAT_MS").unwrap_or(4000),
            meta_flush_queue: parse_env("STREAM_META_FLUSH_QUEUE").unwrap_or(256),
            event_buffer: parse_env("STREAM_EVENT_BUFFER").unwrap_or(256),
            meta_idle_ttl_secs: parse_env("STREAM_META_IDLE_TTL_SECS").unwrap_or(3600),
        };

        let server = ServerConfig {
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
            request_timeout: parse_env::<u64>("REQUEST_TIMEOUT_SECS").map(Duration::from_secs),
        };

        Ok(Config {
            generation,
            database,
            logging,
            request,
            retry,
            streaming,
            server,
        })
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

impl StreamingConfig {
    /// Heartbeat interval with the floor applied.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms.max(MIN_HEARTBEAT_MS))
    }

    pub fn meta_idle_ttl(&self) -> Duration {
        Duration::from_secs(self.meta_idle_ttl_secs)
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self { timeout_ms: 30000 }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_output_tokens: 256,
            max_output_tokens_cap: 8192,
            backoff_ms: 250,
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: 4000,
            meta_flush_queue: 256,
            event_buffer: 256,
            meta_idle_ttl_secs: 3600,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            request_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_interval_default() {
        let cfg = StreamingConfig::default();
        assert_eq!(cfg.heartbeat_interval(), Duration::from_millis(4000));
    }

    #[test]
    fn test_heartbeat_interval_floor() {
        let cfg = StreamingConfig {
            heartbeat_ms: 500,
            ..StreamingConfig::default()
        };
        assert_eq!(cfg.heartbeat_interval(), Duration::from_millis(MIN_HEARTBEAT_MS));
    }

    #[test]
    fn test_retry_defaults() {
        let cfg = RetryConfig::default();
        assert_eq!(cfg.max_attempts, 5);
        assert!(cfg.min_output_tokens < cfg.max_output_tokens_cap);
    }
}
