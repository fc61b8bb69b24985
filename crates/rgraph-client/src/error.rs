//! Client error type and the mapping from transport failures.

use std::sync::Arc;

use thiserror::Error;

use crate::message::{ResponseKind, ServerError};
use crate::resource_id::ResourceId;
use crate::transport::{StatusCode, TransportStatus};

/// Errors surfaced by the client. Cloneable so one failure can resolve
/// every pending request of a stream.
#[derive(Debug, Clone, Error)]
pub enum GraphError {
    /// Caller passed an argument the client rejects before sending.
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// A local id from another transaction was used.
    #[error("local id {id} leaked into transaction 0x{expected_tx:x}")]
    CrossTransactionLeak { id: ResourceId, expected_tx: u32 },

    /// Error reported by the server for one request.
    #[error("server error: {0}")]
    Server(ServerError),

    /// The stream closed before this request was answered.
    #[error("transaction stream is closed")]
    TransactionClosed,

    /// The session was already committed, discarded or aborted.
    #[error("transaction already closed")]
    TransactionAlreadyClosed,

    /// The stream failed; `cause` is the first fatal error.
    #[error("session closed because of: {cause}")]
    SessionClosed { cause: Arc<GraphError> },

    /// The transaction was aborted locally.
    #[error("transaction aborted: {cause}")]
    Aborted { cause: Arc<GraphError> },

    /// A message arrived with no pending request.
    #[error("orphan incoming message with request id {request_id}")]
    OrphanMessage { request_id: u32 },

    /// A message answered a request other than the oldest pending one.
    #[error("out of order message: expected request id {expected}, got {got}")]
    OutOfOrderMessage { expected: u32, got: u32 },

    /// A multi-message part arrived out of sequence.
    #[error("inconsistent multi-message id: expected {expected}, got {got}")]
    InconsistentMultiId { expected: u32, got: u32 },

    /// The response kind does not match the request.
    #[error("response kind mismatch: expected {expected:?}, got {got:?}")]
    ResponseKindMismatch {
        expected: ResponseKind,
        got: ResponseKind,
    },

    /// Any other malformed server message.
    #[error("protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    /// The stream ended while requests were pending.
    #[error("stream ended with {pending} pending responses")]
    UnexpectedStreamEnd { pending: usize },

    /// The commit lost against a concurrent transaction. Retryable.
    #[error("commit conflict in transaction '{tx_name}'")]
    TxCommitConflict { tx_name: String },

    /// A deadline passed.
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The server rejected the bearer token.
    #[error("unauthenticated: {message}")]
    Unauthenticated { message: String },

    /// The server is unreachable.
    #[error("disconnected: {message}")]
    Disconnected { message: String },

    /// Any other transport failure.
    #[error("transport error ({code:?}): {message}")]
    Transport { code: StatusCode, message: String },

    /// Local transaction id is held by another transaction.
    #[error("local transaction id 0x{0:x} is already in use")]
    DuplicateLocalTxId(u32),

    /// Every local transaction id is in use.
    #[error("no free local transaction ids ({in_use} in use)")]
    LocalTxIdsExhausted { in_use: usize },

    /// The client root has not been resolved yet.
    #[error("client root is not initialized")]
    NotInitialized,

    /// The bearer token could not be decoded.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// Invalid or unreadable configuration.
    #[error("config error: {0}")]
    Config(String),

    /// A payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    SerializationError(String),
}

/// Result alias used throughout the client.
pub type Result<T> = std::result::Result<T, GraphError>;

impl GraphError {
    /// Shorthand for [`GraphError::InvalidArgument`].
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        GraphError::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`GraphError::ProtocolViolation`].
    pub fn protocol(reason: impl Into<String>) -> Self {
        GraphError::ProtocolViolation {
            reason: reason.into(),
        }
    }

    /// Wraps the first fatal error of a stream.
    pub fn session_closed(cause: GraphError) -> Self {
        GraphError::SessionClosed {
            cause: Arc::new(cause),
        }
    }

    /// Wraps the cause of a local abort.
    pub fn aborted(cause: GraphError) -> Self {
        GraphError::Aborted {
            cause: Arc::new(cause),
        }
    }

    /// The only error the retrying runner recovers from.
    pub fn is_commit_conflict(&self) -> bool {
        matches!(self, GraphError::TxCommitConflict { .. })
    }

    /// True for deadline expiry and external cancellation, including when
    /// wrapped by a session close or abort.
    pub fn is_timeout_or_cancel(&self) -> bool {
        match self {
            GraphError::Timeout { .. } | GraphError::Cancelled => true,
            GraphError::SessionClosed { cause } | GraphError::Aborted { cause } => {
                cause.is_timeout_or_cancel()
            }
            _ => false,
        }
    }

    /// True for transport-level authentication failures.
    pub fn is_auth_error(&self) -> bool {
        match self {
            GraphError::Unauthenticated { .. } => true,
            GraphError::SessionClosed { cause } | GraphError::Aborted { cause } => {
                cause.is_auth_error()
            }
            _ => false,
        }
    }

    /// Recoverable errors fail a single call and leave the transaction usable.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, GraphError::Server(e) if e.is_recoverable())
    }

    /// Bugs in the calling code rather than contention or connectivity.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            GraphError::CrossTransactionLeak { .. }
                | GraphError::TransactionAlreadyClosed
                | GraphError::DuplicateLocalTxId(_)
        )
    }

    /// Server error code, if this is a server-reported error.
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            GraphError::Server(e) => Some(e),
            _ => None,
        }
    }

    /// Unwraps session-close and abort wrappers down to the original cause.
    pub fn root_cause(&self) -> &GraphError {
        match self {
            GraphError::SessionClosed { cause } | GraphError::Aborted { cause } => {
                cause.root_cause()
            }
            other => other,
        }
    }
}

impl From<TransportStatus> for GraphError {
    fn from(status: TransportStatus) -> Self {
        match status.code {
            StatusCode::Unauthenticated => GraphError::Unauthenticated {
                message: status.message,
            },
            StatusCode::Unavailable => GraphError::Disconnected {
                message: status.message,
            },
            StatusCode::Cancelled => GraphError::Cancelled,
            StatusCode::DeadlineExceeded => GraphError::Timeout { timeout_ms: 0 },
            code => GraphError::Transport {
                code,
                message: status.message,
            },
        }
    }
}

impl From<ServerError> for GraphError {
    fn from(e: ServerError) -> Self {
        GraphError::Server(e)
    }
}

impl From<serde_json::Error> for GraphError {
    fn from(e: serde_json::Error) -> Self {
        GraphError::SerializationError(e.to_string())
    }
}
