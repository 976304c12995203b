//! Application configuration.
//!
//! Centralizes the settings for the listening service. Everything is loaded
//! from environment variables (a local `.env` is honored) and validated once
//! at startup, then shared as a single struct.

use std::env;
use tracing::Level;

// --- Application constants ---

/// Long-poll timeout requested from the transport, in seconds.
pub const POLL_TIMEOUT_SECS: u64 = 30;
/// HTTP client timeout; must exceed the long-poll timeout.
pub const HTTP_TIMEOUT_SECS: u64 = 60;
/// Capacity of the shared event channel.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Holds all configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub telegram_bot_token: String,
    pub supabase_url: String,
    pub supabase_anon_key: String,
    /// Optional: without it voice answers are stored with a placeholder
    /// transcript instead of a real one.
    pub openai_api_key: Option<String>,
    pub log_level: Level,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    MissingVar(&'static str),
    #[error("invalid log level in RUST_LOG: {0}")]
    InvalidLogLevel(String),
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    // *   `TELEGRAM_BOT_TOKEN`: bot token for the chat transport. Required.
    // *   `SUPABASE_URL`: base URL of the backend store. Required.
    // *   `SUPABASE_ANON_KEY`: API key for the backend store. Required.
    // *   `OPENAI_API_KEY`: (Optional) key for voice transcription.
    // *   `RUST_LOG`: (Optional) logging level, defaults to "info".
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env if present; useful for local development.
        dotenvy::dotenv().ok();

        let telegram_bot_token = require("TELEGRAM_BOT_TOKEN")?;
        let supabase_url = normalize_base_url(&require("SUPABASE_URL")?);
        let supabase_anon_key = require("SUPABASE_ANON_KEY")?;
        let openai_api_key = env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty());

        let log_level_str = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
        let log_level = log_level_str
            .parse::<Level>()
            .map_err(|_| ConfigError::InvalidLogLevel(log_level_str))?;

        Ok(Self {
            telegram_bot_token,
            supabase_url,
            supabase_anon_key,
            openai_api_key,
            log_level,
        })
    }
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::MissingVar(name))
}

/// Strips a trailing slash so URL joins stay predictable.
fn normalize_base_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_loses_its_trailing_slash() {
        assert_eq!(
            normalize_base_url("https://example.supabase.co/"),
            "https://example.supabase.co"
        );
        assert_eq!(
            normalize_base_url("https://example.supabase.co"),
            "https://example.supabase.co"
        );
    }
}
