use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// HTTP methods a route answers when the config does not list any.
pub const DEFAULT_ROUTE_METHODS: [&str; 5] = ["GET", "POST", "PUT", "DELETE", "PATCH"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("no routes configured")]
    NoRoutes,

    #[error("route {0}: path is required")]
    MissingPath(usize),

    #[error("route {0}: at least one backend is required")]
    NoBackends(usize),

    #[error("route {route}, backend {backend}: URL is required")]
    MissingBackendUrl { route: usize, backend: usize },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub rate_limiting: RateLimitingConfig,
    pub cors: CorsConfig,
    pub routes: Vec<RouteConfig>,
}

/// HTTP server settings. Timeouts are expressed in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub read_timeout: u64,
    pub write_timeout: u64,
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            read_timeout: 30,
            write_timeout: 30,
            shutdown_timeout: 10,
        }
    }
}

impl ServerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub database: String,
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            database: "gateway.db".to_string(),
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RateLimitingConfig {
    pub enabled: bool,
    pub requests_per_second: u32,
    pub burst: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    pub path: String,
    pub backends: Vec<BackendConfig>,
    pub methods: Vec<String>,
    /// Per-route rate limit in requests per second. 0 disables it.
    pub rate_limit: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub url: String,
    pub weight: i32,
}

impl Config {
    /// Loads and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks route-table invariants and normalizes the parts the rest of
    /// the gateway relies on: weights below 1 become 1, and routes without
    /// an explicit method list get the default set.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.routes.is_empty() {
            return Err(ConfigError::NoRoutes);
        }

        for (route_index, route) in self.routes.iter_mut().enumerate() {
            if route.path.is_empty() {
                return Err(ConfigError::MissingPath(route_index));
            }
            if route.backends.is_empty() {
                return Err(ConfigError::NoBackends(route_index));
            }
            for (backend_index, backend) in route.backends.iter_mut().enumerate() {
                if backend.url.is_empty() {
                    return Err(ConfigError::MissingBackendUrl {
                        route: route_index,
                        backend: backend_index,
                    });
                }
                if backend.weight <= 0 {
                    backend.weight = 1;
                }
            }
            if route.methods.is_empty() {
                route.methods = DEFAULT_ROUTE_METHODS.iter().map(|m| m.to_string()).collect();
            }
        }

        Ok(())
    }
}
