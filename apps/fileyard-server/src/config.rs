//! Configuration management for the Fileyard server

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::upload::{DEFAULT_COPY_BUFFER_SIZE, DEFAULT_TEMP_RETENTION};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Long-term blob storage
    pub storage_root: PathBuf,

    /// Chunks, merged files and spooled single-shot uploads
    pub temp_root: PathBuf,

    /// Age after which temp files are swept
    pub temp_retention: Duration,

    pub sweep_interval: Duration,

    /// Buffer for streaming copies and hashing
    pub copy_buffer_bytes: usize,

    /// Largest accepted request body
    pub max_request_bytes: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            database: DatabaseConfig {
                url: "sqlite:./fileyard.db".to_string(),
            },
            upload: UploadConfig::default(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            storage_root: PathBuf::from("./data/files"),
            temp_root: PathBuf::from("./data/tmp"),
            temp_retention: DEFAULT_TEMP_RETENTION,
            sweep_interval: Duration::from_secs(300),
            copy_buffer_bytes: DEFAULT_COPY_BUFFER_SIZE,
            max_request_bytes: 200 * 1024 * 1024,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable source, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        Ok(Config {
            server: ServerConfig {
                host: lookup("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_or(&lookup, "SERVER_PORT", defaults.server.port)?,
            },
            database: DatabaseConfig {
                url: lookup("DATABASE_URL").unwrap_or(defaults.database.url),
            },
            upload: UploadConfig {
                storage_root: lookup("UPLOAD_STORAGE_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.upload.storage_root),
                temp_root: lookup("UPLOAD_TEMP_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.upload.temp_root),
                temp_retention: Duration::from_secs(parse_or(
                    &lookup,
                    "UPLOAD_TEMP_RETENTION_SECS",
                    defaults.upload.temp_retention.as_secs(),
                )?),
                sweep_interval: Duration::from_secs(parse_or(
                    &lookup,
                    "UPLOAD_SWEEP_INTERVAL_SECS",
                    defaults.upload.sweep_interval.as_secs(),
                )?),
                copy_buffer_bytes: parse_or(
                    &lookup,
                    "UPLOAD_COPY_BUFFER_BYTES",
                    defaults.upload.copy_buffer_bytes,
                )?,
                max_request_bytes: parse_or(
                    &lookup,
                    "UPLOAD_MAX_REQUEST_BYTES",
                    defaults.upload.max_request_bytes,
                )?,
            },
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.database.url, "sqlite:./fileyard.db");
        assert_eq!(config.upload.temp_retention, Duration::from_secs(3600));
        assert_eq!(config.upload.sweep_interval, Duration::from_secs(300));
        assert_eq!(config.upload.copy_buffer_bytes, 64 * 1024);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("SERVER_PORT", "8080"),
            ("UPLOAD_TEMP_ROOT", "/var/tmp/fy"),
            ("UPLOAD_TEMP_RETENTION_SECS", " 60 "),
        ]))
        .unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.upload.temp_root, PathBuf::from("/var/tmp/fy"));
        assert_eq!(config.upload.temp_retention, Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_number() {
        let err = Config::from_lookup(lookup(&[("UPLOAD_COPY_BUFFER_BYTES", "lots")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { key: "UPLOAD_COPY_BUFFER_BYTES", .. }
        ));
    }
}
