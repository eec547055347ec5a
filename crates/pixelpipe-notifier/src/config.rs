//! Notifier configuration management

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ============================================================================
// Notifier Configuration Constants
// ============================================================================

/// Default health-server host binding.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default health-server port.
pub const DEFAULT_PORT: u16 = 5001;

/// Default shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/pixelpipe";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default per-request timeout for webhook delivery, in seconds.
pub const DEFAULT_WEBHOOK_TIMEOUT_SECS: u64 = 10;

/// Default unacknowledged deliveries held at once.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 1;

/// Notifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub delivery: DeliveryConfig,
}

/// Health-server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
}

/// Queue database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub queue_url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

/// Sink wiring: zero or more webhook endpoints; the log sink is always
/// active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    pub webhook_urls: Vec<String>,
    pub webhook_timeout_secs: u64,
    pub max_in_flight: usize,
}

impl DeliveryConfig {
    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }
}

impl NotifierConfig {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

        let config = NotifierConfig {
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
                queue_url: std::env::var("QUEUE_DATABASE_URL").unwrap_or(database_url),
                max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_DATABASE_MAX_CONNECTIONS),
                connect_timeout_secs: std::env::var("DATABASE_CONNECT_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS),
            },
            delivery: DeliveryConfig {
                webhook_urls: std::env::var("WEBHOOK_URLS")
                    .map(|raw| {
                        raw.split(',')
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or_default(),
                webhook_timeout_secs: std::env::var("WEBHOOK_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_WEBHOOK_TIMEOUT_SECS),
                max_in_flight: std::env::var("NOTIFIER_MAX_IN_FLIGHT")
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

        if self.database.queue_url.is_empty() {
            anyhow::bail!("Queue database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        for url in &self.delivery.webhook_urls {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("Webhook URL must be http(s): {}", url);
            }
        }

        Ok(())
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: DEFAULT_HOST.to_string(),
                port: DEFAULT_PORT,
                shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            },
            database: DatabaseConfig {
                queue_url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            },
            delivery: DeliveryConfig {
                webhook_urls: Vec::new(),
                webhook_timeout_secs: DEFAULT_WEBHOOK_TIMEOUT_SECS,
                max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            },
        }
    }
}
