//! Replica configuration.

use crate::backoff::BackoffPolicy;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tandem_engine::{DEFAULT_PULL_LIMIT, DEFAULT_TOMBSTONE_RETENTION_MS, MAX_PULL_LIMIT};

/// Which medium carries batches to the authority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Poll,
    Websocket,
    Broadcast,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TransportKind::Poll => "poll",
            TransportKind::Websocket => "websocket",
            TransportKind::Broadcast => "broadcast",
        })
    }
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "poll" | "http" => Ok(TransportKind::Poll),
            "websocket" | "ws" => Ok(TransportKind::Websocket),
            "broadcast" => Ok(TransportKind::Broadcast),
            other => Err(ConfigError::Invalid {
                name: "transport",
                reason: format!("unknown transport '{other}'"),
            }),
        }
    }
}

/// Sync engine configuration.
///
/// Deserializes from camelCase JSON; every option has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Fixed sync interval
    pub poll_interval_ms: u64,
    /// Backoff cap
    pub max_backoff_ms: u64,
    /// Backoff after the first failure
    pub base_backoff_ms: u64,
    pub backoff_factor: f64,
    /// Relative jitter applied to backoff delays
    pub jitter: f64,
    pub transport: TransportKind,
    /// Persisted replica id; generated on first open when absent
    pub replica_id: Option<String>,
    /// Authority base URL (`http://host:port`)
    pub server_url: String,
    /// Bearer token sent to the authority
    pub auth_token: Option<String>,
    /// Per-request timeout for push and pull
    pub request_timeout_ms: u64,
    /// Entries per push
    pub max_batch_size: usize,
    /// Pull pages followed per cycle
    pub max_pull_pages: usize,
    /// Entries requested per pull page
    pub pull_limit: usize,
    /// Consecutive failures before the status turns degraded
    pub degraded_after: u32,
    pub tombstone_retention_ms: u64,
    /// Directory for file persistence; in-memory when absent
    pub data_dir: Option<PathBuf>,
    /// WebSocket keep-alive interval
    pub ping_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5000,
            max_backoff_ms: 60_000,
            base_backoff_ms: 1000,
            backoff_factor: 2.0,
            jitter: 0.2,
            transport: TransportKind::Poll,
            replica_id: None,
            server_url: "http://localhost:3000".to_string(),
            auth_token: None,
            request_timeout_ms: 10_000,
            max_batch_size: 500,
            max_pull_pages: 10,
            pull_limit: DEFAULT_PULL_LIMIT,
            degraded_after: 3,
            tombstone_retention_ms: DEFAULT_TOMBSTONE_RETENTION_MS,
            data_dir: None,
            ping_interval_ms: 30_000,
        }
    }
}

impl SyncConfig {
    /// Parse camelCase JSON and validate it.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `TANDEM_*` environment variables, reading `.env` first.
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load from an arbitrary key lookup using the `TANDEM_*` names.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("TANDEM_POLL_INTERVAL_MS") {
            config.poll_interval_ms = parse("pollIntervalMs", &v)?;
        }
        if let Some(v) = lookup("TANDEM_MAX_BACKOFF_MS") {
            config.max_backoff_ms = parse("maxBackoffMs", &v)?;
        }
        if let Some(v) = lookup("TANDEM_BASE_BACKOFF_MS") {
            config.base_backoff_ms = parse("baseBackoffMs", &v)?;
        }
        if let Some(v) = lookup("TANDEM_TRANSPORT") {
            config.transport = v.parse()?;
        }
        if let Some(v) = lookup("TANDEM_REPLICA_ID") {
            config.replica_id = Some(v);
        }
        if let Some(v) = lookup("TANDEM_SERVER_URL") {
            config.server_url = v;
        }
        if let Some(v) = lookup("TANDEM_AUTH_TOKEN") {
            config.auth_token = Some(v);
        }
        if let Some(v) = lookup("TANDEM_REQUEST_TIMEOUT_MS") {
            config.request_timeout_ms = parse("requestTimeoutMs", &v)?;
        }
        if let Some(v) = lookup("TANDEM_MAX_BATCH_SIZE") {
            config.max_batch_size = parse("maxBatchSize", &v)?;
        }
        if let Some(v) = lookup("TANDEM_DEGRADED_AFTER") {
            config.degraded_after = parse("degradedAfter", &v)?;
        }
        if let Some(v) = lookup("TANDEM_DATA_DIR") {
            config.data_dir = Some(PathBuf::from(v));
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(invalid("pollIntervalMs", "must be positive"));
        }
        if self.base_backoff_ms == 0 {
            return Err(invalid("baseBackoffMs", "must be positive"));
        }
        if self.max_backoff_ms < self.base_backoff_ms {
            return Err(invalid("maxBackoffMs", "must not be below baseBackoffMs"));
        }
        if self.backoff_factor.is_nan() || self.backoff_factor < 1.0 {
            return Err(invalid("backoffFactor", "must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(invalid("jitter", "must be in [0, 1)"));
        }
        if self.max_batch_size == 0 {
            return Err(invalid("maxBatchSize", "must be positive"));
        }
        if self.max_pull_pages == 0 {
            return Err(invalid("maxPullPages", "must be positive"));
        }
        if self.pull_limit == 0 || self.pull_limit > MAX_PULL_LIMIT {
            return Err(invalid(
                "pullLimit",
                &format!("must be in 1..={MAX_PULL_LIMIT}"),
            ));
        }
        if self.ping_interval_ms == 0 {
            return Err(invalid("pingIntervalMs", "must be positive"));
        }
        if self.degraded_after == 0 {
            return Err(invalid("degradedAfter", "must be positive"));
        }
        if self.replica_id.as_deref().is_some_and(str::is_empty) {
            return Err(invalid("replicaId", "must not be empty"));
        }
        if self.transport != TransportKind::Broadcast
            && !(self.server_url.starts_with("http://") || self.server_url.starts_with("https://"))
        {
            return Err(invalid("serverUrl", "must be an http(s) URL"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::default()
            .with_initial_delay(Duration::from_millis(self.base_backoff_ms))
            .with_max_delay(Duration::from_millis(self.max_backoff_ms))
            .with_multiplier(self.backoff_factor)
            .with_jitter(self.jitter)
    }

    /// WebSocket endpoint derived from `server_url`.
    pub fn websocket_url(&self) -> String {
        let base = self.server_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{base}/sync/ws")
    }
}

fn invalid(name: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        reason: reason.to_string(),
    }
}

fn parse<T: FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(name, &format!("cannot parse '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.poll_interval_ms, 5000);
        assert_eq!(config.max_backoff_ms, 60_000);
        assert_eq!(config.transport, TransportKind::Poll);
        assert!(config.replica_id.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn from_json_camel_case() {
        let config = SyncConfig::from_json(
            r#"{"pollIntervalMs": 1000, "transport": "websocket", "replicaId": "r-1"}"#,
        )
        .unwrap();
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.transport, TransportKind::Websocket);
        assert_eq!(config.replica_id.as_deref(), Some("r-1"));
        assert_eq!(config.max_backoff_ms, 60_000);
    }

    #[test]
    fn from_json_rejects_bad_values() {
        assert!(matches!(
            SyncConfig::from_json(r#"{"pollIntervalMs": 0}"#),
            Err(ConfigError::Invalid { name: "pollIntervalMs", .. })
        ));
        assert!(matches!(
            SyncConfig::from_json(r#"{"transport": "carrier-pigeon"}"#),
            Err(ConfigError::Parse(_))
        ));
        assert!(SyncConfig::from_json(r#"{"maxBackoffMs": 10}"#).is_err());
        assert!(SyncConfig::from_json(r#"{"jitter": 1.5}"#).is_err());
    }

    #[test]
    fn from_lookup_reads_tandem_variables() {
        let vars: HashMap<&str, &str> = [
            ("TANDEM_POLL_INTERVAL_MS", "250"),
            ("TANDEM_TRANSPORT", "ws"),
            ("TANDEM_SERVER_URL", "https://sync.example.com/"),
            ("TANDEM_AUTH_TOKEN", "secret"),
            ("TANDEM_DATA_DIR", "/tmp/tandem"),
        ]
        .into_iter()
        .collect();

        let config = SyncConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.poll_interval_ms, 250);
        assert_eq!(config.transport, TransportKind::Websocket);
        assert_eq!(config.auth_token.as_deref(), Some("secret"));
        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/tandem")));
        assert_eq!(config.websocket_url(), "wss://sync.example.com/sync/ws");
    }

    #[test]
    fn from_lookup_reports_unparsable_numbers() {
        let err = SyncConfig::from_lookup(|k| {
            (k == "TANDEM_MAX_BATCH_SIZE").then(|| "lots".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("maxBatchSize"));
    }

    #[test]
    fn backoff_policy_follows_config() {
        let config = SyncConfig {
            base_backoff_ms: 500,
            max_backoff_ms: 4000,
            backoff_factor: 3.0,
            jitter: 0.0,
            ..SyncConfig::default()
        };
        let policy = config.backoff_policy();
        assert_eq!(policy.base_delay(1), Duration::from_millis(500));
        assert_eq!(policy.base_delay(2), Duration::from_millis(1500));
        assert_eq!(policy.base_delay(3), Duration::from_millis(4000));
    }

    #[test]
    fn websocket_url_from_http() {
        let config = SyncConfig {
            server_url: "http://localhost:3000".into(),
            ..SyncConfig::default()
        };
        assert_eq!(config.websocket_url(), "ws://localhost:3000/sync/ws");
    }
}
