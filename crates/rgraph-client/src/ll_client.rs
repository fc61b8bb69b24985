//! Low-level client: owns the transport, the auth session and the local
//! transaction id space, and opens one correlated stream per transaction.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::auth::{AuthCallbacks, AuthInformation, AuthSession, ConnectionStatus, StatusObserver, TokenRefresher};
use crate::config::ClientConfig;
use crate::correlator::MessageCorrelator;
use crate::deadline::{race, Deadline};
use crate::error::{GraphError, Result};
use crate::resource_id::MAX_LOCAL_TX_ID;
use crate::transport::{CallMetadata, GraphTransport, TransportStatus};

struct AllocState {
    next: u32,
    in_use: HashSet<u32>,
}

/// Hands out local transaction ids, recycling them modulo `max`. An id is
/// never handed out twice while its holder is alive.
pub struct LocalTxIdAllocator {
    state: Mutex<AllocState>,
    max: u32,
}

impl LocalTxIdAllocator {
    /// Allocator over ids `1..=max`.
    pub fn new(max: u32) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(AllocState {
                next: 1,
                in_use: HashSet::new(),
            }),
            max: max.clamp(1, MAX_LOCAL_TX_ID),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AllocState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Takes the next free id.
    pub fn acquire(self: &Arc<Self>) -> Result<LocalTxId> {
        let mut state = self.lock();
        if state.in_use.len() as u64 >= self.max as u64 {
            return Err(GraphError::LocalTxIdsExhausted {
                in_use: state.in_use.len(),
            });
        }
        loop {
            let candidate = state.next;
            state.next = if candidate >= self.max { 1 } else { candidate + 1 };
            if state.in_use.insert(candidate) {
                return Ok(LocalTxId {
                    id: candidate,
                    allocator: self.clone(),
                });
            }
        }
    }

    /// Claims a specific id; fails if it is already held.
    pub fn register(self: &Arc<Self>, id: u32) -> Result<LocalTxId> {
        if id == 0 || id > self.max {
            return Err(GraphError::invalid_argument(format!(
                "local transaction id {id} outside 1..={}",
                self.max
            )));
        }
        if !self.lock().in_use.insert(id) {
            return Err(GraphError::DuplicateLocalTxId(id));
        }
        Ok(LocalTxId {
            id,
            allocator: self.clone(),
        })
    }

    /// Number of ids currently held.
    pub fn in_use(&self) -> usize {
        self.lock().in_use.len()
    }

    fn release(&self, id: u32) {
        self.lock().in_use.remove(&id);
    }
}

/// A held local transaction id, released on drop.
pub struct LocalTxId {
    id: u32,
    allocator: Arc<LocalTxIdAllocator>,
}

impl LocalTxId {
    /// The raw id.
    pub fn get(&self) -> u32 {
        self.id
    }
}

impl Drop for LocalTxId {
    fn drop(&mut self) {
        self.allocator.release(self.id);
    }
}

impl std::fmt::Debug for LocalTxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LocalTxId(0x{:x})", self.id)
    }
}

/// Freshly opened transaction stream, not yet sent its open request.
#[derive(Debug)]
pub struct LlTransaction {
    /// Correlates requests and replies on the stream.
    pub correlator: MessageCorrelator,
    /// Local id reserved for this transaction.
    pub local_tx: LocalTxId,
    /// Tears the stream down when cancelled.
    pub cancel: CancellationToken,
}

struct TransportRefresher {
    transport: Arc<dyn GraphTransport>,
}

#[async_trait]
impl TokenRefresher for TransportRefresher {
    async fn refresh(&self, current: &str, ttl: Duration) -> Result<String> {
        self.transport
            .refresh_token(CallMetadata::with_bearer(current), ttl)
            .await
            .map_err(GraphError::from)
    }
}

/// Low-level client: opens transaction streams with fresh credentials and
/// hands out local transaction ids.
pub struct TransportClient {
    transport: Arc<dyn GraphTransport>,
    auth: Arc<AuthSession>,
    tx_ids: Arc<LocalTxIdAllocator>,
    config: ClientConfig,
}

impl TransportClient {
    /// Builds the auth session from `config`. Does not connect.
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn GraphTransport>,
        callbacks: AuthCallbacks,
    ) -> Result<Self> {
        config.validate()?;
        let info = config
            .auth_token
            .as_deref()
            .map(AuthInformation::from_jwt)
            .transpose()?;
        let refresher: Arc<dyn TokenRefresher> = Arc::new(TransportRefresher {
            transport: transport.clone(),
        });
        let auth = Arc::new(AuthSession::new(
            info,
            Some(refresher),
            config.token_ttl(),
            config.max_refresh(),
            callbacks,
        ));
        Ok(Self {
            transport,
            auth,
            tx_ids: LocalTxIdAllocator::new(config.max_concurrent_local_tx),
            config,
        })
    }

    /// Effective configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Auth session shared by every call.
    pub fn auth(&self) -> &Arc<AuthSession> {
        &self.auth
    }

    /// Last observed connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.auth.status()
    }

    /// Receiver that observes every status change.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.auth.subscribe_status()
    }

    /// Allocator for local transaction ids.
    pub fn local_tx_ids(&self) -> &Arc<LocalTxIdAllocator> {
        &self.tx_ids
    }

    fn observe<T>(&self, result: std::result::Result<T, TransportStatus>) -> Result<T> {
        match result {
            Ok(v) => {
                self.auth.observe_ok();
                Ok(v)
            }
            Err(status) => {
                self.auth.observe_failure(&status);
                Err(status.into())
            }
        }
    }

    /// Opens a transaction stream and wires it to a new correlator.
    pub async fn create_tx(&self, name: &str, cancel: CancellationToken) -> Result<LlTransaction> {
        let local_tx = self.tx_ids.acquire()?;
        let metadata = self.auth.call_metadata();
        let opened = race(
            async {
                self.observe(
                    self.transport
                        .open_tx_stream(metadata, cancel.clone())
                        .await,
                )
            },
            Some(Deadline::after(self.config.request_timeout())),
            Some(&cancel),
        )
        .await?;

        debug!(tx = name, local_tx_id = local_tx.get(), "transaction stream opened");
        let observer: Arc<dyn StatusObserver> = self.auth.clone();
        let correlator = MessageCorrelator::start(name, opened, cancel.clone(), Some(observer));
        Ok(LlTransaction {
            correlator,
            local_tx,
            cancel,
        })
    }

    /// Waits until a committed transaction is visible to every reader.
    pub async fn sync_tx(&self, global_tx_id: u64) -> Result<()> {
        let metadata = self.auth.call_metadata();
        race(
            async { self.observe(self.transport.sync_tx(metadata, global_tx_id).await) },
            Some(Deadline::after(self.config.request_timeout())),
            None,
        )
        .await
    }

    /// Round-trips to the server within the request timeout.
    pub async fn ping(&self) -> Result<()> {
        let metadata = self.auth.call_metadata();
        race(
            async { self.observe(self.transport.ping(metadata).await) },
            Some(Deadline::after(self.config.request_timeout())),
            None,
        )
        .await
    }
}

impl std::fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportClient")
            .field("address", &self.config.address)
            .field("auth", &self.auth)
            .field("local_tx_in_use", &self.tx_ids.in_use())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::make_jwt;
    use crate::message::{ClientMessage, ServerMessage};
    use crate::transport::{StatusCode, TxStreamParts};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;

    #[test]
    fn test_allocator_cycles_and_skips_live_ids() {
        let alloc = LocalTxIdAllocator::new(3);
        let a = alloc.acquire().unwrap();
        let b = alloc.acquire().unwrap();
        assert_eq!((a.get(), b.get()), (1, 2));
        drop(a);
        let c = alloc.acquire().unwrap();
        assert_eq!(c.get(), 3);
        let d = alloc.acquire().unwrap();
        assert_eq!(d.get(), 1);
        assert!(matches!(
            alloc.acquire().unwrap_err(),
            GraphError::LocalTxIdsExhausted { in_use: 3 }
        ));
        drop(b);
        assert_eq!(alloc.acquire().unwrap().get(), 2);
    }

    #[test]
    fn test_allocator_rejects_duplicate_registration() {
        let alloc = LocalTxIdAllocator::new(10);
        let held = alloc.register(4).unwrap();
        let err = alloc.register(4).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateLocalTxId(4)));
        assert!(err.is_programming_error());
        drop(held);
        assert!(alloc.register(4).is_ok());
        assert!(alloc.register(0).is_err());
        assert!(alloc.register(11).is_err());
    }

    #[derive(Default)]
    struct StubTransport {
        fail_open: Option<StatusCode>,
        opened: AtomicU32,
        tokens: Mutex<Vec<Option<String>>>,
        keep: Mutex<Vec<(mpsc::UnboundedReceiver<ClientMessage>, mpsc::UnboundedSender<std::result::Result<ServerMessage, TransportStatus>>)>>,
    }

    #[async_trait]
    impl GraphTransport for StubTransport {
        async fn open_tx_stream(
            &self,
            metadata: CallMetadata,
            _cancel: CancellationToken,
        ) -> std::result::Result<TxStreamParts, TransportStatus> {
            self.tokens.lock().unwrap().push(metadata.bearer_token);
            if let Some(code) = self.fail_open {
                return Err(TransportStatus::new(code, "stub"));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            self.keep.lock().unwrap().push((out_rx, in_tx));
            Ok(TxStreamParts {
                outbound: out_tx,
                inbound: in_rx,
            })
        }

        async fn sync_tx(&self, _m: CallMetadata, _id: u64) -> std::result::Result<(), TransportStatus> {
            Ok(())
        }

        async fn refresh_token(
            &self,
            _m: CallMetadata,
            _ttl: Duration,
        ) -> std::result::Result<String, TransportStatus> {
            Err(TransportStatus::new(StatusCode::Internal, "no refresh"))
        }

        async fn ping(&self, _m: CallMetadata) -> std::result::Result<(), TransportStatus> {
            Err(TransportStatus::new(StatusCode::Unavailable, "down"))
        }
    }

    #[tokio::test]
    async fn test_create_tx_attaches_token() {
        let jwt = make_jwt(4_000_000_000, 4_000_100_000, "bob");
        let transport = Arc::new(StubTransport::default());
        let config = ClientConfig {
            auth_token: Some(jwt.clone()),
            ..Default::default()
        };
        let client = TransportClient::new(config, transport.clone(), AuthCallbacks::default()).unwrap();
        let tx = client.create_tx("t", CancellationToken::new()).await.unwrap();
        assert_eq!(tx.local_tx.get(), 1);
        assert_eq!(client.local_tx_ids().in_use(), 1);
        assert_eq!(transport.tokens.lock().unwrap()[0].as_deref(), Some(jwt.as_str()));
        drop(tx);
        assert_eq!(client.local_tx_ids().in_use(), 0);
    }

    #[tokio::test]
    async fn test_create_tx_auth_failure_updates_status() {
        let transport = Arc::new(StubTransport {
            fail_open: Some(StatusCode::Unauthenticated),
            ..Default::default()
        });
        let client = TransportClient::new(ClientConfig::default(), transport, AuthCallbacks::default()).unwrap();
        let err = client.create_tx("t", CancellationToken::new()).await.unwrap_err();
        assert!(err.is_auth_error());
        assert_eq!(client.status(), ConnectionStatus::Unauthenticated);
        assert_eq!(client.local_tx_ids().in_use(), 0);
    }

    #[tokio::test]
    async fn test_ping_unavailable_marks_disconnected() {
        let client = TransportClient::new(
            ClientConfig::default(),
            Arc::new(StubTransport::default()),
            AuthCallbacks::default(),
        )
        .unwrap();
        assert!(client.ping().await.is_err());
        assert_eq!(client.status(), ConnectionStatus::Disconnected);
        assert!(client.sync_tx(1).await.is_ok());
        assert_eq!(client.status(), ConnectionStatus::Ok);
    }

    #[test]
    fn test_invalid_token_rejected() {
        let config = ClientConfig {
            auth_token: Some("not-a-jwt".into()),
            ..Default::default()
        };
        let err = TransportClient::new(
            config,
            Arc::new(StubTransport::default()),
            AuthCallbacks::default(),
        )
        .unwrap_err();
        assert!(matches!(err, GraphError::InvalidToken(_)));
    }
}
