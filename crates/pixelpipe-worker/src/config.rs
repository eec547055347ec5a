//! Worker configuration management

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ============================================================================
// Worker Configuration Constants
// ============================================================================

/// Default health-server host binding.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default health-server port.
pub const DEFAULT_PORT: u16 = 5002;

/// Default shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/pixelpipe";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default shared storage root, with `original/` and `processed/` below it.
pub const DEFAULT_STORAGE_ROOT: &str = "/app/images";

/// Default maximum width of a processed image in pixels.
pub const DEFAULT_TRANSFORM_MAX_WIDTH: u32 = 800;

/// Default bound on a single transformation run in seconds.
pub const DEFAULT_TRANSFORM_TIMEOUT_SECS: u64 = 60;

/// Default delivery attempts before a retriable failure becomes terminal.
pub const DEFAULT_TRANSFORM_MAX_ATTEMPTS: u32 = 3;

/// Default pause before requeueing a retriable failure, in seconds.
pub const DEFAULT_RETRY_BACKOFF_SECS: u64 = 5;

/// Default unacknowledged deliveries held at once. The baseline worker is
/// a sequential state machine; scale out by running more processes.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 1;

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub processing: ProcessingConfig,
}

/// Health-server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
}

/// Database configuration. The queue may live on a separate database; it
/// defaults to the state-store URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub queue_url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

/// Shared image storage layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub root: PathBuf,
}

impl StorageConfig {
    /// Directory the gateway writes uploads into.
    pub fn original_dir(&self) -> PathBuf {
        self.root.join("original")
    }

    /// Directory the worker writes derived artifacts into.
    pub fn processed_dir(&self) -> PathBuf {
        self.root.join("processed")
    }
}

/// Transformation and retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    pub max_width: u32,
    pub watermark_path: Option<PathBuf>,
    pub transform_timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_backoff_secs: u64,
    pub max_in_flight: usize,
}

impl ProcessingConfig {
    pub fn transform_timeout(&self) -> Duration {
        Duration::from_secs(self.transform_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }
}

impl WorkerConfig {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

        let config = WorkerConfig {
            server: ServerConfig {
                host: std::env::var("PIXELPIPE_HOST")
                    .unwrap_or_else(|_| DEFAULT_HOST.to_string()),
                port: std::env::var("PIXELPIPE_PORT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_PORT),
                shutdown_timeout_secs: std::env::var("PIXELPIPE_SHUTDOWN_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            },
            database: DatabaseConfig {
                queue_url: std::env::var("QUEUE_DATABASE_URL")
                    .unwrap_or_else(|_| database_url.clone()),
                url: database_url,
                max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_DATABASE_MAX_CONNECTIONS),
                connect_timeout_secs: std::env::var("DATABASE_CONNECT_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS),
            },
            storage: StorageConfig {
                root: std::env::var("STORAGE_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from(DEFAULT_STORAGE_ROOT)),
            },
            processing: ProcessingConfig {
                max_width: std::env::var("TRANSFORM_MAX_WIDTH")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_TRANSFORM_MAX_WIDTH),
                watermark_path: std::env::var("WATERMARK_PATH").ok().map(PathBuf::from),
                transform_timeout_secs: std::env::var("TRANSFORM_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_TRANSFORM_TIMEOUT_SECS),
                max_attempts: std::env::var("TRANSFORM_MAX_ATTEMPTS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_TRANSFORM_MAX_ATTEMPTS),
                retry_backoff_secs: std::env::var("RETRY_BACKOFF_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_RETRY_BACKOFF_SECS),
                max_in_flight: std::env::var("WORKER_MAX_IN_FLIGHT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_MAX_IN_FLIGHT),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port must be greater than 0");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.processing.max_width == 0 {
            anyhow::bail!("Transform max_width must be greater than 0");
        }

        if self.processing.max_attempts == 0 {
            anyhow::bail!("Transform max_attempts must be at least 1");
        }

        if self.processing.transform_timeout_secs == 0 {
            anyhow::bail!("Transform timeout must be greater than 0");
        }

        Ok(())
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: DEFAULT_HOST.to_string(),
                port: DEFAULT_PORT,
                shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            },
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                queue_url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            },
            storage: StorageConfig {
                root: PathBuf::from(DEFAULT_STORAGE_ROOT),
            },
            processing: ProcessingConfig {
                max_width: DEFAULT_TRANSFORM_MAX_WIDTH,
                watermark_path: None,
                transform_timeout_secs: DEFAULT_TRANSFORM_TIMEOUT_SECS,
                max_attempts: DEFAULT_TRANSFORM_MAX_ATTEMPTS,
                retry_backoff_secs: DEFAULT_RETRY_BACKOFF_SECS,
                max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(WorkerConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_port_is_rejected() {
        let mut config = WorkerConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_max_attempts_is_rejected() {
        let mut config = WorkerConfig::default();
        config.processing.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn storage_layout_uses_original_and_processed() {
        let storage = StorageConfig {
            root: PathBuf::from("/app/images"),
        };
        assert_eq!(storage.original_dir(), PathBuf::from("/app/images/original"));
        assert_eq!(storage.processed_dir(), PathBuf::from("/app/images/processed"));
    }
}
