//! Boundary to the underlying RPC transport.
//!
//! The transport provides one bidirectional stream per transaction plus a few
//! unary calls. Wire encoding is the transport's business; the client only
//! relies on in-order delivery in both directions.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::message::{ClientMessage, ServerMessage};

/// Status codes a transport can fail a call or stream with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    /// Missing or rejected token.
    Unauthenticated,
    /// Server unreachable.
    Unavailable,
    /// The call was cancelled.
    Cancelled,
    /// The call's deadline passed.
    DeadlineExceeded,
    /// Server-side failure.
    Internal,
    /// Unclassified failure.
    Unknown,
}

/// Failure of a transport call or stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportStatus {
    /// Failure class.
    pub code: StatusCode,
    /// Human-readable detail.
    pub message: String,
}

impl TransportStatus {
    /// Creates a status with the given code.
    pub fn new(code: StatusCode, message: &str) -> Self {
        Self {
            code,
            message: message.to_string(),
        }
    }
}

impl fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for TransportStatus {}

/// Per-call metadata attached by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallMetadata {
    /// Token sent as `Bearer` authorization, if any.
    pub bearer_token: Option<String>,
}

impl CallMetadata {
    /// Metadata without credentials.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Metadata carrying `token`.
    pub fn with_bearer(token: &str) -> Self {
        Self {
            bearer_token: Some(token.to_string()),
        }
    }

    /// Value for an `authorization` header, if a token is present.
    pub fn authorization(&self) -> Option<String> {
        self.bearer_token.as_ref().map(|t| format!("Bearer {t}"))
    }
}

/// Both halves of one transaction stream.
///
/// Dropping `outbound` half-closes the send direction. The transport ends
/// `inbound` once the server finished the stream or the stream failed.
#[derive(Debug)]
pub struct TxStreamParts {
    /// Client to server frames.
    pub outbound: mpsc::UnboundedSender<ClientMessage>,
    /// Server to client frames, or the status the stream failed with.
    pub inbound: mpsc::UnboundedReceiver<Result<ServerMessage, TransportStatus>>,
}

/// RPC surface the client needs from the server. Implemented over the
/// network in production and in memory for tests.
#[async_trait]
pub trait GraphTransport: Send + Sync + 'static {
    /// Opens a transaction stream. Cancelling `cancel` tears the stream down.
    async fn open_tx_stream(
        &self,
        metadata: CallMetadata,
        cancel: CancellationToken,
    ) -> Result<TxStreamParts, TransportStatus>;

    /// Waits until the effects of a committed transaction are visible everywhere.
    async fn sync_tx(&self, metadata: CallMetadata, global_tx_id: u64) -> Result<(), TransportStatus>;

    /// Exchanges the current token for a fresh one valid for `ttl`.
    async fn refresh_token(
        &self,
        metadata: CallMetadata,
        ttl: Duration,
    ) -> Result<String, TransportStatus>;

    /// Cheap liveness check.
    async fn ping(&self, metadata: CallMetadata) -> Result<(), TransportStatus>;
}
