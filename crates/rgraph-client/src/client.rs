//! Client facade: root management and the retrying transaction runner.
//!
//! Every call to [`GraphClient::with_write_tx`] or [`GraphClient::with_read_tx`]
//! runs the body against a fresh transaction. When the commit is rejected
//! with a conflict, the whole body runs again on a new transaction after an
//! exponential backoff. Nothing else is retried.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::{watch, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{AuthCallbacks, ConnectionStatus};
use crate::config::ClientConfig;
use crate::deadline::{race, Deadline};
use crate::driver::{DriverCache, GraphDriver};
use crate::error::{GraphError, Result};
use crate::ll_client::TransportClient;
use crate::message::ErrorCode;
use crate::model::{FieldId, FieldType, ResourceType};
use crate::resource_id::ResourceId;
use crate::retry::{is_retryable, RetryConfig};
use crate::stats::{ClientStats, StatsSnapshot};
use crate::transaction::{SessionOptions, TransactionSession};
use crate::transport::GraphTransport;

/// Resource type of client roots, main and alternative alike.
pub const CLIENT_ROOT_TYPE: (&str, &str) = ("ClientRoot", "1");

const ANONYMOUS_ROOT_NAME: &str = "client_root_anonymous";
const ALTERNATIVE_ROOT_FIELD_PREFIX: &str = "alternative_root_";

/// Name of the well-known root owned by `login`.
pub fn client_root_name(login: Option<&str>) -> String {
    match login {
        None => ANONYMOUS_ROOT_NAME.to_string(),
        Some(login) => {
            let digest = Sha256::digest(login.as_bytes());
            let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
            format!("client_root_{hex}")
        }
    }
}

/// Field on the main root that holds the alternative root `name`.
pub fn alternative_root_field(name: &str) -> String {
    format!("{ALTERNATIVE_ROOT_FIELD_PREFIX}{name}")
}

fn root_type() -> ResourceType {
    let (name, version) = CLIENT_ROOT_TYPE;
    ResourceType::new(name, version)
}

/// Per-transaction knobs for the runner.
#[derive(Debug, Clone, Default)]
pub struct TxOptions {
    /// Wait until the committed transaction is visible everywhere.
    pub sync: bool,
    /// Overrides the configured transaction timeout; covers one attempt.
    pub timeout: Option<Duration>,
    /// Cancels the whole run, retries included.
    pub cancel: Option<CancellationToken>,
    /// Overrides the configured retry policy.
    pub retry: Option<RetryConfig>,
}

impl TxOptions {
    /// Sets [`TxOptions::sync`].
    pub fn with_sync(mut self) -> Self {
        self.sync = true;
        self
    }

    /// Sets [`TxOptions::timeout`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets [`TxOptions::cancel`].
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Sets [`TxOptions::retry`].
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Roots {
    main: ResourceId,
    /// Root handed to sessions: the alternative root when one is configured.
    active: ResourceId,
}

/// High-level client. Resolves the client root once and runs transaction
/// bodies with commit-conflict retries.
pub struct GraphClient {
    ll: TransportClient,
    stats: Arc<ClientStats>,
    roots: OnceCell<Roots>,
    drivers: DriverCache,
}

impl GraphClient {
    /// Builds a client without touching the server. The root is resolved on
    /// first use.
    pub fn new(config: ClientConfig, transport: Arc<dyn GraphTransport>) -> Result<Self> {
        Self::with_callbacks(config, transport, AuthCallbacks::default())
    }

    /// Like [`GraphClient::new`], with auth hooks.
    pub fn with_callbacks(
        config: ClientConfig,
        transport: Arc<dyn GraphTransport>,
        callbacks: AuthCallbacks,
    ) -> Result<Self> {
        Ok(Self {
            ll: TransportClient::new(config, transport, callbacks)?,
            stats: Arc::new(ClientStats::new()),
            roots: OnceCell::new(),
            drivers: DriverCache::new(),
        })
    }

    /// Builds a client and resolves its root.
    pub async fn init(config: ClientConfig, transport: Arc<dyn GraphTransport>) -> Result<Self> {
        let client = Self::new(config, transport)?;
        client.ensure_root().await?;
        Ok(client)
    }

    /// Effective configuration.
    pub fn config(&self) -> &ClientConfig {
        self.ll.config()
    }

    /// Low-level client, for callers that manage streams themselves.
    pub fn transport_client(&self) -> &TransportClient {
        &self.ll
    }

    /// Current counter values.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Last observed connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.ll.status()
    }

    /// Receiver that observes every status change.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.ll.subscribe_status()
    }

    /// Round-trips to the server, updating the connection status.
    pub async fn ping(&self) -> Result<()> {
        self.ll.ping().await
    }

    /// Root used by transactions, available once resolved.
    pub fn client_root(&self) -> Result<ResourceId> {
        self.roots
            .get()
            .map(|r| r.active)
            .ok_or(GraphError::NotInitialized)
    }

    /// The main root, even when an alternative root is active.
    pub fn main_root(&self) -> Result<ResourceId> {
        self.roots
            .get()
            .map(|r| r.main)
            .ok_or(GraphError::NotInitialized)
    }

    /// Name the client root is registered under for the current login.
    pub fn root_name(&self) -> String {
        let login = self.ll.auth().info().and_then(|i| i.login);
        client_root_name(login.as_deref())
    }

    /// Resolves (creating if needed) the client root. Idempotent.
    pub async fn ensure_root(&self) -> Result<ResourceId> {
        let roots = self
            .roots
            .get_or_try_init(|| async {
                let main = self.resolve_main_root().await?;
                let active = match self.config().alternative_root.clone() {
                    Some(name) => self.resolve_alternative_root(main, &name).await?,
                    None => main,
                };
                Ok::<_, GraphError>(Roots { main, active })
            })
            .await?;
        Ok(roots.active)
    }

    async fn resolve_main_root(&self) -> Result<ResourceId> {
        let name = self.root_name();
        let created = self
            .run(
                "initialization",
                true,
                ResourceId::NULL,
                TxOptions::default(),
                |tx| {
                    let name = name.clone();
                    async move {
                        if tx.check_resource_name_exists(&name).await? {
                            return tx.get_resource_by_name(&name).await;
                        }
                        let root = tx.create_root(root_type())?;
                        tx.set_resource_name(&name, &root)?;
                        tx.commit().await?;
                        root.global().await
                    }
                },
            )
            .await;

        let root = match created {
            Err(e) if e.server_error().map(|s| s.code) == Some(ErrorCode::AlreadyExists) => {
                debug!(root = %name, "client root created concurrently, reading it back");
                self.run(
                    "initialization-read",
                    false,
                    ResourceId::NULL,
                    TxOptions::default(),
                    |tx| {
                        let name = name.clone();
                        async move { tx.get_resource_by_name(&name).await }
                    },
                )
                .await?
            }
            other => other?,
        };
        info!(root = %name, id = %root, "client root resolved");
        Ok(root)
    }

    async fn resolve_alternative_root(&self, main: ResourceId, name: &str) -> Result<ResourceId> {
        let field = FieldId::new(main, &alternative_root_field(name));
        let root = self
            .run(
                "initialization-alternative",
                true,
                main,
                TxOptions::default(),
                |tx| {
                    let field = field.clone();
                    async move {
                        if tx.field_exists(field.clone()).await? {
                            return Ok(tx.get_field(field).await?.value);
                        }
                        let alt = tx.create_struct(root_type(), None)?;
                        tx.create_field(field.clone(), FieldType::Dynamic)?;
                        tx.set_field(field, &alt)?;
                        tx.commit().await?;
                        alt.global().await
                    }
                },
            )
            .await?;
        info!(alternative_root = name, id = %root, "alternative root resolved");
        Ok(root)
    }

    /// Removes the alternative root field `name` from the main root. Returns
    /// whether it existed.
    pub async fn delete_alternative_root(&self, name: &str) -> Result<bool> {
        self.ensure_root().await?;
        let main = self.main_root()?;
        let field = FieldId::new(main, &alternative_root_field(name));
        self.run(
            "delete-alternative-root",
            true,
            main,
            TxOptions::default(),
            |tx| {
                let field = field.clone();
                async move {
                    if !tx.field_exists(field.clone()).await? {
                        return Ok(false);
                    }
                    tx.remove_field(field)?;
                    Ok(true)
                }
            },
        )
        .await
    }

    /// Runs `body` in a read-only transaction.
    pub async fn with_read_tx<T, F, Fut>(&self, name: &str, body: F) -> Result<T>
    where
        F: FnMut(TransactionSession) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.with_read_tx_opts(name, TxOptions::default(), body).await
    }

    /// Like [`GraphClient::with_read_tx`], with explicit options.
    pub async fn with_read_tx_opts<T, F, Fut>(&self, name: &str, options: TxOptions, body: F) -> Result<T>
    where
        F: FnMut(TransactionSession) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let root = self.ensure_root().await?;
        self.run(name, false, root, options, body).await
    }

    /// Runs `body` in a writable transaction, committing it when the body
    /// returns `Ok` and retrying the whole body on commit conflicts.
    pub async fn with_write_tx<T, F, Fut>(&self, name: &str, options: TxOptions, body: F) -> Result<T>
    where
        F: FnMut(TransactionSession) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let root = self.ensure_root().await?;
        self.run(name, true, root, options, body).await
    }

    /// Opens a session outside the runner. The caller owns its completion;
    /// conflicts are not retried.
    pub async fn open_tx(&self, name: &str, writable: bool) -> Result<TransactionSession> {
        let root = self.ensure_root().await?;
        let ll = self.ll.create_tx(name, CancellationToken::new()).await?;
        TransactionSession::open(
            ll,
            SessionOptions {
                name: name.to_string(),
                writable,
                client_root: root,
                request_timeout: self.config().request_timeout(),
            },
            self.stats.clone(),
        )
        .await
    }

    async fn run<T, F, Fut>(
        &self,
        name: &str,
        writable: bool,
        client_root: ResourceId,
        options: TxOptions,
        mut body: F,
    ) -> Result<T>
    where
        F: FnMut(TransactionSession) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let retry = options
            .retry
            .clone()
            .unwrap_or_else(|| self.config().retry.clone());
        let mut backoff = retry.init();

        loop {
            let attempt = backoff.attempt();
            match self
                .attempt(name, writable, client_root, &options, &mut body)
                .await
            {
                Ok((value, global_tx_id)) => {
                    if options.sync {
                        self.ll.sync_tx(global_tx_id).await?;
                    }
                    let delay = self.config().post_write_delay();
                    if writable && !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    return Ok(value);
                }
                Err(e) if is_retryable(&e) && !backoff.is_exhausted() => {
                    let delay = backoff.next_delay();
                    debug!(
                        tx = name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "commit conflict, retrying"
                    );
                    self.stats.inc_retries();
                    tokio::time::sleep(delay).await;
                    backoff.advance();
                }
                Err(e) => {
                    if is_retryable(&e) {
                        warn!(tx = name, attempt, "commit conflict, retries exhausted");
                    } else {
                        self.stats.inc_failures();
                        debug!(tx = name, attempt, error = %e, "transaction failed");
                    }
                    return Err(e);
                }
            }
        }
    }

    /// One attempt on a fresh transaction. Returns the body's value and the
    /// server's transaction id.
    async fn attempt<T, F, Fut>(
        &self,
        name: &str,
        writable: bool,
        client_root: ResourceId,
        options: &TxOptions,
        body: &mut F,
    ) -> Result<(T, u64)>
    where
        F: FnMut(TransactionSession) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        // A child token: aborting the stream must not cancel the caller's token.
        let cancel = options
            .cancel
            .as_ref()
            .map(|c| c.child_token())
            .unwrap_or_default();
        let deadline = Deadline::after(options.timeout.unwrap_or_else(|| self.config().tx_timeout()));

        let ll = race(self.ll.create_tx(name, cancel.clone()), Some(deadline), Some(&cancel)).await?;
        let session = race(
            TransactionSession::open(
                ll,
                SessionOptions {
                    name: name.to_string(),
                    writable,
                    client_root,
                    request_timeout: self.config().request_timeout(),
                },
                self.stats.clone(),
            ),
            Some(deadline),
            Some(&cancel),
        )
        .await?;

        let outcome = race(
            async {
                let value = body(session.clone()).await?;
                session.commit().await?;
                Ok(value)
            },
            Some(deadline),
            Some(&cancel),
        )
        .await;

        if let Err(e) = &outcome {
            if e.is_timeout_or_cancel() {
                session.abort(e.clone());
            }
        }
        session.complete();
        if let Err(e) = session.finished().await {
            debug!(tx = name, error = %e, "transaction stream ended with error");
        }
        outcome.map(|value| (value, session.global_tx_id()))
    }

    /// Returns the driver of type `D`, constructing it on first request.
    pub fn get_driver<D: GraphDriver>(&self) -> Result<Arc<D>> {
        self.drivers.get_or_init::<D>(self)
    }
}

impl std::fmt::Debug for GraphClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphClient")
            .field("ll", &self.ll)
            .field("roots", &self.roots.get())
            .field("drivers", &self.drivers)
            .finish()
    }
}
