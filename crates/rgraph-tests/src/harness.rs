//! Test harness: logging setup, token minting and a client wired to an
//! in-memory server.

use std::sync::{Arc, Once};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rgraph_client::{ClientConfig, GraphClient, GraphTransport, Result, RetryConfig};

use crate::server::MemoryGraphServer;

static TRACING: Once = Once::new();

/// Installs a test-friendly subscriber once per process. Honors `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(fmt::layer().with_test_writer())
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .try_init();
    });
}

/// Unsigned JWT carrying the claims the client reads.
pub fn issue_token(login: &str, issued_at: u64, expires_at: u64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let claims = serde_json::json!({ "iat": issued_at, "exp": expires_at, "login": login });
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
    format!("{header}.{payload}.unsigned")
}

/// Config suited to the in-memory server: short timeouts, fast retries.
pub fn test_config() -> ClientConfig {
    ClientConfig {
        request_timeout_ms: 5_000,
        tx_timeout_ms: 10_000,
        retry: RetryConfig {
            max_attempts: 10,
            initial_backoff_ms: 1,
            max_backoff_ms: 20,
            backoff_multiplier: 1.5,
            jitter: 0.1,
        },
        ..Default::default()
    }
}

/// One server plus a client talking to it.
pub struct TestEnv {
    pub server: MemoryGraphServer,
    pub client: Arc<GraphClient>,
}

impl TestEnv {
    pub async fn new() -> Result<Self> {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: ClientConfig) -> Result<Self> {
        Self::with_server(MemoryGraphServer::new(), config).await
    }

    pub async fn with_server(server: MemoryGraphServer, config: ClientConfig) -> Result<Self> {
        init_tracing();
        let transport: Arc<dyn GraphTransport> = Arc::new(server.clone());
        let client = Arc::new(GraphClient::init(config, transport).await?);
        Ok(Self { server, client })
    }

    /// A second client sharing this environment's server.
    pub async fn another_client(&self, config: ClientConfig) -> Result<GraphClient> {
        let transport: Arc<dyn GraphTransport> = Arc::new(self.server.clone());
        GraphClient::init(config, transport).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rgraph_client::AuthInformation;

    #[test]
    fn test_issue_token_decodes() {
        let token = issue_token("carol", 100, 200);
        let info = AuthInformation::from_jwt(&token).unwrap();
        assert_eq!(info.issued_at, 100);
        assert_eq!(info.expires_at, 200);
        assert_eq!(info.login.as_deref(), Some("carol"));
    }

    #[tokio::test]
    async fn test_env_resolves_root() {
        let env = TestEnv::new().await.unwrap();
        let root = env.client.client_root().unwrap();
        assert!(root.is_root());
        assert!(root.is_global());
        assert_eq!(
            env.server.resource_by_name("client_root_anonymous"),
            Some(root)
        );
    }
}
