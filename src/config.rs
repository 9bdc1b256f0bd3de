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
    pub federation: FederationConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "social.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
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

/// Federation engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Username of the local actor this instance speaks as
    pub local_username: String,
    /// User-Agent sent on outbound requests
    pub user_agent: String,
    /// Timeout for a single outbound request, in seconds
    pub request_timeout_seconds: u64,
    /// Ceiling on delivery attempts per inbox
    pub delivery_max_attempts: u32,
    /// Backoff unit; attempt n sleeps n^2 units before the next try.
    /// Defaults to 60 (attempt-squared minutes).
    pub delivery_backoff_seconds: u64,
    /// Concurrent outbound deliveries per activity
    pub max_concurrent_deliveries: usize,
    /// TTL for cached remote actor documents, in seconds
    pub actor_cache_ttl_seconds: u64,
    /// TTL for the per-domain "signature required" marker, in seconds.
    /// Long by default: once a domain demands signed fetches it rarely
    /// stops.
    pub signature_required_ttl_seconds: u64,
    /// RSA key size for the local actor keypair
    pub key_bits: usize,
}

impl FederationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn backoff_unit(&self) -> Duration {
        Duration::from_secs(self.delivery_backoff_seconds)
    }

    pub fn actor_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.actor_cache_ttl_seconds)
    }

    pub fn signature_required_ttl(&self) -> Duration {
        Duration::from_secs(self.signature_required_ttl_seconds)
    }
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
    /// 4. Environment variables (WINDWARD_*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("federation.local_username", "admin")?
            .set_default("federation.user_agent", "Windward/0.1.0")?
            .set_default("federation.request_timeout_seconds", 10)?
            .set_default("federation.delivery_max_attempts", 3)?
            .set_default("federation.delivery_backoff_seconds", 60)?
            .set_default("federation.max_concurrent_deliveries", 10)?
            .set_default("federation.actor_cache_ttl_seconds", 3600)?
            .set_default("federation.signature_required_ttl_seconds", 604_800)?
            .set_default("federation.key_bits", 4096)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (WINDWARD_*)
            .add_source(
                Environment::with_prefix("WINDWARD")
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
        if self.federation.delivery_max_attempts == 0 {
            return Err(crate::error::AppError::Config(
                "federation.delivery_max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.federation.key_bits < 2048 {
            return Err(crate::error::AppError::Config(
                "federation.key_bits must be at least 2048".to_string(),
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

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                domain: "localhost".to_string(),
                protocol: "http".to_string(),
            },
            database: DatabaseConfig {
                path: PathBuf::from("/tmp/windward-test.db"),
            },
            federation: FederationConfig {
                local_username: "admin".to_string(),
                user_agent: "Windward/0.1.0".to_string(),
                request_timeout_seconds: 10,
                delivery_max_attempts: 3,
                delivery_backoff_seconds: 60,
                max_concurrent_deliveries: 10,
                actor_cache_ttl_seconds: 3600,
                signature_required_ttl_seconds: 604_800,
                key_bits: 2048,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    #[test]
    fn validate_accepts_http_on_localhost() {
        let config = valid_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_http_for_non_local_domain() {
        let mut config = valid_config();
        config.server.domain = "social.example.com".to_string();
        config.server.protocol = "http".to_string();

        let error = config
            .validate()
            .expect_err("public domains must require https");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message)
                if message.contains("server.protocol must be https")
        ));
    }

    #[test]
    fn validate_rejects_zero_delivery_attempts() {
        let mut config = valid_config();
        config.federation.delivery_max_attempts = 0;

        let error = config
            .validate()
            .expect_err("zero attempt ceiling must fail validation");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message)
                if message.contains("delivery_max_attempts")
        ));
    }

    #[test]
    fn base_url_joins_protocol_and_domain() {
        let config = valid_config();
        assert_eq!(config.server.base_url(), "http://localhost");
    }
}
