//! Application configuration loaded from environment variables.

use crate::errors::{ReconcileError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database URL
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// Age (in seconds) after which an unpaid pledge is rejected
    pub pledge_timeout_secs: u64,
    /// How often (in seconds) the pledge expiry sweep runs
    pub expiry_poll_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let config = Config {
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./reconciler.db".to_string()),
            api_port: env_var("API_PORT")
                .unwrap_or_else(|_| "3002".to_string())
                .parse()
                .map_err(|_| ReconcileError::Config("Invalid API_PORT".to_string()))?,
            pledge_timeout_secs: env_var("PLEDGE_TIMEOUT_SECS")
                .unwrap_or_else(|_| "259200".to_string())
                .parse()
                .map_err(|_| ReconcileError::Config("Invalid PLEDGE_TIMEOUT_SECS".to_string()))?,
            expiry_poll_interval_secs: env_var("EXPIRY_POLL_INTERVAL_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .map_err(|_| {
                    ReconcileError::Config("Invalid EXPIRY_POLL_INTERVAL_SECS".to_string())
                })?,
        };
        if config.expiry_poll_interval_secs == 0 {
            return Err(ReconcileError::Config(
                "EXPIRY_POLL_INTERVAL_SECS must be positive".to_string(),
            ));
        }
        Ok(config)
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| ReconcileError::Config(format!("Missing env var: {key}")))
}
