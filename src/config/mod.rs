//! Configuration for the marketplace client and the reference backend.
//!
//! All configuration is loaded from environment variables with sensible defaults.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::errors::AppError;

/// Anon key used when none is configured. Only suitable for local development.
pub const DEV_ANON_KEY: &str = "campus-market-dev-anon-key";

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the backend the client talks to
    pub backend_url: String,
    /// Public API key sent as the `apikey` header on every request
    pub anon_key: String,
    /// Path to the backend's SQLite database file
    pub db_path: PathBuf,
    /// Path to the product search index directory
    pub index_path: PathBuf,
    /// Address the reference backend binds to
    pub bind_addr: SocketAddr,
    /// Where the client persists its key-value cache
    pub cache_path: PathBuf,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let backend_url =
            env::var("MARKET_BACKEND_URL").unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());

        let anon_key = env::var("MARKET_ANON_KEY").unwrap_or_else(|_| DEV_ANON_KEY.to_string());

        let db_path = env::var("MARKET_DB_PATH")
            .unwrap_or_else(|_| "./data/market.sqlite".to_string())
            .into();

        let index_path = env::var("MARKET_INDEX_PATH")
            .unwrap_or_else(|_| "./data/index".to_string())
            .into();

        let bind_addr = env::var("MARKET_BIND_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .map_err(|e| AppError::BadRequest(format!("Invalid MARKET_BIND_ADDR: {}", e)))?;

        let cache_path = env::var("MARKET_CACHE_PATH")
            .unwrap_or_else(|_| "./data/cache.json".to_string())
            .into();

        let log_level = env::var("MARKET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            backend_url,
            anon_key,
            db_path,
            index_path,
            bind_addr,
            cache_path,
            log_level,
        })
    }

    /// True when the backend is running with the built-in development key.
    pub fn uses_dev_key(&self) -> bool {
        self.anon_key == DEV_ANON_KEY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        // Clear any existing env vars
        env::remove_var("MARKET_BACKEND_URL");
        env::remove_var("MARKET_ANON_KEY");
        env::remove_var("MARKET_DB_PATH");
        env::remove_var("MARKET_INDEX_PATH");
        env::remove_var("MARKET_BIND_ADDR");
        env::remove_var("MARKET_CACHE_PATH");
        env::remove_var("MARKET_LOG_LEVEL");

        let config = Config::from_env().unwrap();

        assert_eq!(config.backend_url, "http://127.0.0.1:8080");
        assert!(config.uses_dev_key());
        assert_eq!(config.db_path, PathBuf::from("./data/market.sqlite"));
        assert_eq!(config.index_path, PathBuf::from("./data/index"));
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:8080");
        assert_eq!(config.cache_path, PathBuf::from("./data/cache.json"));
        assert_eq!(config.log_level, "info");
    }
}
