#![warn(missing_docs)]

//! rgraph client: transactional access to a remote resource graph.
//!
//! Each transaction owns one duplex stream. Requests are correlated with
//! their responses in send order, void operations are pipelined, and the
//! client runner retries whole transaction bodies on commit conflicts.

pub mod auth;
pub mod client;
pub mod config;
pub mod correlator;
pub mod deadline;
pub mod driver;
pub mod error;
pub mod ll_client;
pub mod message;
pub mod model;
pub mod resource_id;
pub mod retry;
pub mod stats;
pub mod transaction;
pub mod transport;

pub use auth::{AuthCallbacks, AuthInformation, AuthSession, ConnectionStatus, StatusObserver, TokenRefresher};
pub use client::{client_root_name, GraphClient, TxOptions, CLIENT_ROOT_TYPE};
pub use config::ClientConfig;
pub use correlator::{MessageCorrelator, Reply, ResponseFuture};
pub use deadline::Deadline;
pub use driver::GraphDriver;
pub use error::{GraphError, Result};
pub use ll_client::{LlTransaction, LocalTxIdAllocator, TransportClient};
pub use message::{
    ClientMessage, ErrorCode, MultiMessageInfo, ResponseKind, ServerError, ServerMessage, TxRequest, TxResponse,
};
pub use model::{FieldData, FieldId, FieldStatus, FieldType, KeyValue, ResourceData, ResourceKind, ResourceType};
pub use resource_id::{ResourceId, ResourceIdKind};
pub use retry::RetryConfig;
pub use stats::{ClientStats, StatsSnapshot};
pub use transaction::{GlobalIdFuture, ResourceRef, TransactionSession};
pub use transport::{CallMetadata, GraphTransport, StatusCode, TransportStatus, TxStreamParts};
