use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub inference_ws_url: String,
    pub api_base_url: String,
    pub frame_rate: u32,
    pub reconnect_delay: Duration,
    pub success_cooldown: Duration,
    pub required_successes: u32,
    pub log_level: Level,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_positive(name: &str, default: &str) -> Result<u32, ConfigError> {
    let raw = var_or(name, default);
    match raw.trim().parse::<u32>() {
        Ok(0) => Err(ConfigError::InvalidValue(
            name.to_string(),
            "must be greater than zero".to_string(),
        )),
        Ok(value) => Ok(value),
        Err(e) => Err(ConfigError::InvalidValue(name.to_string(), e.to_string())),
    }
}

fn parse_millis(name: &str, default: &str) -> Result<Duration, ConfigError> {
    let raw = var_or(name, default);
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string()))
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let inference_ws_url = var_or("INFERENCE_WS_URL", "ws://localhost:8001/ws");
        if !(inference_ws_url.starts_with("ws://") || inference_ws_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue(
                "INFERENCE_WS_URL".to_string(),
                format!("'{}' is not a ws:// or wss:// URL", inference_ws_url),
            ));
        }

        let api_base_url = var_or("API_BASE_URL", "http://localhost:8000")
            .trim_end_matches('/')
            .to_string();
        if api_base_url.is_empty() {
            return Err(ConfigError::MissingVar("API_BASE_URL".to_string()));
        }

        let frame_rate = parse_positive("FRAME_RATE", "10")?;
        let reconnect_delay = parse_millis("RECONNECT_DELAY_MS", "2000")?;
        let success_cooldown = parse_millis("SUCCESS_COOLDOWN_MS", "2000")?;
        let required_successes = parse_positive("REQUIRED_SUCCESSES", "5")?;

        let log_level_str = var_or("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            inference_ws_url,
            api_base_url,
            frame_rate,
            reconnect_delay,
            success_cooldown,
            required_successes,
            log_level,
        })
    }
}
