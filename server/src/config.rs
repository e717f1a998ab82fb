//! Configuration management for the server.

use std::env;
use tandem_engine::{wire::clamp_pull_limit, Schema, DEFAULT_PULL_LIMIT, MAX_PULL_LIMIT};

/// `DATABASE_URL` value that keeps the entry log in process memory.
pub const MEMORY_DATABASE_URL: &str = "memory:";

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// PostgreSQL connection URL, or `memory:`
    pub database_url: String,
    /// Shared bearer secret. Requests are anonymous when unset.
    pub auth_secret: Option<String>,
    /// Page size for pulls that do not ask for one
    pub pull_limit: usize,
    /// Refuse entries for collections outside the schema
    pub strict_schema: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string());

        let port = lookup("PORT")
            .unwrap_or_else(|| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::MissingDatabaseUrl)?;

        let auth_secret = lookup("AUTH_SECRET").filter(|secret| !secret.is_empty());

        let pull_limit = match lookup("PULL_LIMIT") {
            Some(raw) => match raw.parse::<usize>() {
                Ok(limit) if (1..=MAX_PULL_LIMIT).contains(&limit) => limit,
                _ => return Err(ConfigError::InvalidPullLimit(raw)),
            },
            None => DEFAULT_PULL_LIMIT,
        };

        let strict_schema = match lookup("STRICT_SCHEMA").as_deref() {
            None | Some("") | Some("0") | Some("false") => false,
            Some("1") | Some("true") => true,
            Some(other) => return Err(ConfigError::InvalidStrictSchema(other.to_string())),
        };

        Ok(Self {
            host,
            port,
            database_url,
            auth_secret,
            pull_limit,
            strict_schema,
        })
    }

    /// Whether the entry log lives in memory instead of PostgreSQL.
    pub fn uses_memory(&self) -> bool {
        self.database_url == MEMORY_DATABASE_URL
    }

    /// Schema pushes are validated against.
    pub fn schema(&self) -> Schema {
        let schema = Schema::tickets();
        if self.strict_schema {
            schema.strict()
        } else {
            schema
        }
    }

    /// Effective limit for a pull request.
    pub fn pull_limit(&self, requested: Option<usize>) -> usize {
        clamp_pull_limit(requested.or(Some(self.pull_limit)))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DATABASE_URL environment variable is required")]
    MissingDatabaseUrl,

    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("PULL_LIMIT must be between 1 and {MAX_PULL_LIMIT}, got {0:?}")]
    InvalidPullLimit(String),

    #[error("STRICT_SCHEMA must be true or false, got {0:?}")]
    InvalidStrictSchema(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = load(&[("DATABASE_URL", "postgres://localhost/tandem")]).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.pull_limit, DEFAULT_PULL_LIMIT);
        assert!(config.auth_secret.is_none());
        assert!(!config.strict_schema);
        assert!(!config.uses_memory());
    }

    #[test]
    fn database_url_is_required() {
        assert!(matches!(load(&[]), Err(ConfigError::MissingDatabaseUrl)));
    }

    #[test]
    fn invalid_values() {
        assert!(matches!(
            load(&[("DATABASE_URL", "memory:"), ("PORT", "http")]),
            Err(ConfigError::InvalidPort)
        ));
        assert!(matches!(
            load(&[("DATABASE_URL", "memory:"), ("PULL_LIMIT", "0")]),
            Err(ConfigError::InvalidPullLimit(_))
        ));
        assert!(matches!(
            load(&[("DATABASE_URL", "memory:"), ("PULL_LIMIT", "5000")]),
            Err(ConfigError::InvalidPullLimit(_))
        ));
        assert!(matches!(
            load(&[("DATABASE_URL", "memory:"), ("STRICT_SCHEMA", "maybe")]),
            Err(ConfigError::InvalidStrictSchema(_))
        ));
    }

    #[test]
    fn pull_limit_falls_back_to_configured_value() {
        let config = load(&[("DATABASE_URL", "memory:"), ("PULL_LIMIT", "25")]).unwrap();
        assert_eq!(config.pull_limit(None), 25);
        assert_eq!(config.pull_limit(Some(0)), 1);
        assert_eq!(config.pull_limit(Some(10_000)), MAX_PULL_LIMIT);
    }

    #[test]
    fn strict_schema_flag() {
        let config = load(&[("DATABASE_URL", "memory:"), ("STRICT_SCHEMA", "true")]).unwrap();
        assert!(config.uses_memory());
        assert!(config.schema().strict);
        assert!(config.schema().get_collection("tickets").is_some());
    }

    #[test]
    fn empty_auth_secret_means_anonymous() {
        let config = load(&[("DATABASE_URL", "memory:"), ("AUTH_SECRET", "")]).unwrap();
        assert!(config.auth_secret.is_none());
    }
}
