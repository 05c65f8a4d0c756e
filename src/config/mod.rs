//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.
//! Queue type definitions (schema, sort, indexes) live in TOML files, see
//! [`queue`].

pub mod queue;
pub mod secrets;

pub use queue::{QueueConfig, QueueRegistry};

use crate::error::{Error, Result};
use crate::store::ConnectOptions;
use secrecy::SecretString;
use std::path::PathBuf;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    /// Directory of queue definition `.toml` files.
    pub queue_dir: PathBuf,
    pub max_connections: u32,
    pub check_availability: bool,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            queue_dir: std::env::var("DOCQ_QUEUE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("queues")),
            max_connections: parsed_var("DOCQ_MAX_CONNECTIONS", 10)?,
            check_availability: parsed_var("DOCQ_CHECK_AVAILABILITY", true)?,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            max_connections: self.max_connections,
            check_availability: self.check_availability,
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid value for {name}: {e}"))),
        Err(_) => Ok(default),
    }
}
