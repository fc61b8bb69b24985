//! Client configuration: defaults, file loading and environment overrides.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};
use crate::retry::RetryConfig;

/// Client settings. Loaded from TOML or JSON, then overridden from the
/// environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server `host:port`.
    pub address: String,
    /// Connect over TLS.
    pub tls: bool,
    /// Deadline for each awaited request.
    pub request_timeout_ms: u64,
    /// Deadline for one transaction attempt.
    pub tx_timeout_ms: u64,
    /// Assumed token lifetime when the token carries no expiry.
    pub token_ttl_secs: u64,
    /// Upper bound between token refreshes.
    pub max_refresh_secs: u64,
    /// HTTP proxy URL.
    pub proxy: Option<String>,
    /// Initial bearer token.
    pub auth_token: Option<String>,
    /// Isolated secondary root nested under the main client root.
    pub alternative_root: Option<String>,
    /// Pause after each successful writable transaction.
    pub post_write_delay_ms: u64,
    /// Size of the local transaction id space.
    pub max_concurrent_local_tx: u32,
    /// Commit-conflict retry policy.
    pub retry: RetryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:6345".to_string(),
            tls: false,
            request_timeout_ms: 30_000,
            tx_timeout_ms: 300_000,
            token_ttl_secs: 24 * 3600,
            max_refresh_secs: 3600,
            proxy: None,
            auth_token: None,
            alternative_root: None,
            post_write_delay_ms: 0,
            max_concurrent_local_tx: 1 << 20,
            retry: RetryConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Loads a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| GraphError::Config(format!("cannot read {}: {e}", path.display())))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ClientConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| GraphError::Config(e.to_string()))?,
            "json" => {
                serde_json::from_str(&contents).map_err(|e| GraphError::Config(e.to_string()))?
            }
            _ => {
                return Err(GraphError::Config(format!(
                    "unsupported config file extension: {ext}"
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `RGRAPH_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides fields from `RGRAPH_*` variables looked up through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("RGRAPH_ADDRESS") {
            self.address = v;
        }
        if let Some(v) = lookup("RGRAPH_TLS") {
            self.tls = parse_env("RGRAPH_TLS", &v)?;
        }
        if let Some(v) = lookup("RGRAPH_REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = parse_env("RGRAPH_REQUEST_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("RGRAPH_TX_TIMEOUT_MS") {
            self.tx_timeout_ms = parse_env("RGRAPH_TX_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("RGRAPH_TOKEN") {
            self.auth_token = Some(v);
        }
        if let Some(v) = lookup("RGRAPH_PROXY") {
            self.proxy = Some(v);
        }
        if let Some(v) = lookup("RGRAPH_ALTERNATIVE_ROOT") {
            self.alternative_root = Some(v);
        }
        Ok(())
    }

    /// Rejects settings the client cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(GraphError::Config("address must not be empty".into()));
        }
        if self.request_timeout_ms == 0 || self.tx_timeout_ms == 0 {
            return Err(GraphError::Config("timeouts must be non-zero".into()));
        }
        if self.max_refresh_secs > self.token_ttl_secs {
            return Err(GraphError::Config(
                "max_refresh_secs must not exceed token_ttl_secs".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(GraphError::Config("retry.max_attempts must be >= 1".into()));
        }
        if self.max_concurrent_local_tx == 0 {
            return Err(GraphError::Config(
                "max_concurrent_local_tx must be >= 1".into(),
            ));
        }
        Ok(())
    }

    /// [`ClientConfig::request_timeout_ms`] as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// [`ClientConfig::tx_timeout_ms`] as a [`Duration`].
    pub fn tx_timeout(&self) -> Duration {
        Duration::from_millis(self.tx_timeout_ms)
    }

    /// [`ClientConfig::token_ttl_secs`] as a [`Duration`].
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    /// [`ClientConfig::max_refresh_secs`] as a [`Duration`].
    pub fn max_refresh(&self) -> Duration {
        Duration::from_secs(self.max_refresh_secs)
    }

    /// [`ClientConfig::post_write_delay_ms`] as a [`Duration`].
    pub fn post_write_delay(&self) -> Duration {
        Duration::from_millis(self.post_write_delay_ms)
    }

    /// Server URL, with the scheme chosen by `tls`.
    pub fn endpoint(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{scheme}://{}", self.address)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| GraphError::Config(format!("invalid value for {key}: '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = ClientConfig::default();
        assert_eq!(config.address, "127.0.0.1:6345");
        assert!(!config.tls);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.tx_timeout(), Duration::from_secs(300));
        assert!(config.auth_token.is_none());
        assert!(config.validate().is_ok());
        assert_eq!(config.endpoint(), "http://127.0.0.1:6345");
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
address = "graph.internal:443"
tls = true
request_timeout_ms = 1000
alternative_root = "ci-run-7"

[retry]
max_attempts = 3
"#
        )
        .unwrap();

        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.address, "graph.internal:443");
        assert!(config.tls);
        assert_eq!(config.request_timeout_ms, 1000);
        assert_eq!(config.alternative_root.as_deref(), Some("ci-run-7"));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_backoff_ms, 8);
        assert_eq!(config.endpoint(), "https://graph.internal:443");
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(file, r#"{{ "address": "10.0.0.1:6345", "post_write_delay_ms": 20 }}"#).unwrap();
        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.address, "10.0.0.1:6345");
        assert_eq!(config.post_write_delay(), Duration::from_millis(20));
    }

    #[test]
    fn test_from_file_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(matches!(
            ClientConfig::from_file(file.path()),
            Err(GraphError::Config(_))
        ));
    }

    #[test]
    fn test_apply_env() {
        let env: HashMap<&str, &str> = [
            ("RGRAPH_ADDRESS", "graph:1"),
            ("RGRAPH_TLS", "true"),
            ("RGRAPH_TX_TIMEOUT_MS", "5000"),
            ("RGRAPH_TOKEN", "t0k"),
        ]
        .into_iter()
        .collect();
        let mut config = ClientConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.address, "graph:1");
        assert!(config.tls);
        assert_eq!(config.tx_timeout_ms, 5000);
        assert_eq!(config.auth_token.as_deref(), Some("t0k"));
        assert!(config.proxy.is_none());
    }

    #[test]
    fn test_apply_env_rejects_garbage() {
        let mut config = ClientConfig::default();
        let err = config
            .apply_env(|k| (k == "RGRAPH_REQUEST_TIMEOUT_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("RGRAPH_REQUEST_TIMEOUT_MS"));
    }

    #[test]
    fn test_validate() {
        let config = ClientConfig {
            max_refresh_secs: 10,
            token_ttl_secs: 5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = ClientConfig {
            address: " ".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
