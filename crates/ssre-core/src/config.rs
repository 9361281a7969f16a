use std::fmt;
use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingEnvVar(String),
    #[error("invalid value for {var}: {reason}")]
    InvalidEnvVar { var: String, reason: String },
}

/// Which `RunStore` implementation the binary wires in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Postgres { database_url: String },
}

#[derive(Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub store: StoreBackend,
    pub bind_addr: SocketAddr,
    pub log_level: String,
    pub prompt_dom_char_limit: usize,
    pub db_max_connections: u32,
    pub db_acquire_timeout_secs: u64,
    pub api_url: String,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let store = match &self.store {
            StoreBackend::Memory => "memory",
            StoreBackend::Postgres { .. } => "postgres ([redacted])",
        };
        f.debug_struct("AppConfig")
            .field("store", &store)
            .field("bind_addr", &self.bind_addr)
            .field("log_level", &self.log_level)
            .field("prompt_dom_char_limit", &self.prompt_dom_char_limit)
            .field("db_max_connections", &self.db_max_connections)
            .field("db_acquire_timeout_secs", &self.db_acquire_timeout_secs)
            .field("api_url", &self.api_url)
            .finish()
    }
}

/// Read configuration from the process environment.
pub fn load_app_config_from_env() -> Result<AppConfig, ConfigError> {
    build_app_config(|key| std::env::var(key))
}

/// Build configuration from an arbitrary variable lookup, so tests can feed a map.
pub fn build_app_config<F>(lookup: F) -> Result<AppConfig, ConfigError>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    let or_default = |var: &str, default: &str| -> String {
        lookup(var).unwrap_or_else(|_| default.to_string())
    };

    fn parse<T>(var: &str, raw: String) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: fmt::Display,
    {
        raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidEnvVar {
            var: var.to_string(),
            reason: e.to_string(),
        })
    }

    let store = match or_default("SSRE_STORE", "memory").trim().to_ascii_lowercase().as_str() {
        "memory" => StoreBackend::Memory,
        "postgres" => StoreBackend::Postgres {
            database_url: lookup("DATABASE_URL")
                .map_err(|_| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?,
        },
        other => {
            return Err(ConfigError::InvalidEnvVar {
                var: "SSRE_STORE".to_string(),
                reason: format!("expected `memory` or `postgres`, got `{other}`"),
            })
        }
    };

    let prompt_dom_char_limit: usize = parse(
        "SSRE_PROMPT_DOM_LIMIT",
        or_default("SSRE_PROMPT_DOM_LIMIT", "2000"),
    )?;
    if prompt_dom_char_limit == 0 {
        return Err(ConfigError::InvalidEnvVar {
            var: "SSRE_PROMPT_DOM_LIMIT".to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }

    Ok(AppConfig {
        store,
        bind_addr: parse("SSRE_BIND_ADDR", or_default("SSRE_BIND_ADDR", "0.0.0.0:8000"))?,
        log_level: or_default("SSRE_LOG_LEVEL", "info"),
        prompt_dom_char_limit,
        db_max_connections: parse(
            "SSRE_DB_MAX_CONNECTIONS",
            or_default("SSRE_DB_MAX_CONNECTIONS", "10"),
        )?,
        db_acquire_timeout_secs: parse(
            "SSRE_DB_ACQUIRE_TIMEOUT_SECS",
            or_default("SSRE_DB_ACQUIRE_TIMEOUT_SECS", "10"),
        )?,
        api_url: or_default("SSRE_API_URL", "http://localhost:8000/api/v1"),
    })
}
