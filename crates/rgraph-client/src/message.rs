//! Transaction stream message types.
//!
//! Requests and responses are closed enums. Every request maps to exactly one
//! [`ResponseKind`] and every response reports its own kind, so the correlator
//! can check the two against each other with an exhaustive match.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::model::{FieldData, FieldId, FieldType, KeyValue, ResourceData, ResourceType};
use crate::resource_id::ResourceId;

/// Request sent on a transaction stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxRequest {
    /// Opens the transaction. Always the first request on a stream.
    TxOpen { name: String, writable: bool },
    /// Commits a writable transaction.
    TxCommit,
    /// Drops all changes and closes the transaction.
    TxDiscard,

    /// Creates a root resource under a client-chosen local id.
    CreateRoot { local_id: ResourceId, resource_type: ResourceType },
    /// Creates a structural resource.
    CreateStruct { local_id: ResourceId, resource_type: ResourceType, data: Option<Bytes> },
    /// Creates a resource that lives only while something references it.
    CreateEphemeral { local_id: ResourceId, resource_type: ResourceType, data: Option<Bytes> },
    /// Creates an immutable value resource, deduplicated by content.
    CreateValue { local_id: ResourceId, resource_type: ResourceType, data: Bytes, error_if_exists: bool },
    /// Reads a resource, optionally with its fields.
    ResourceGet { resource_id: ResourceId, load_fields: bool },
    /// Checks whether a resource exists.
    ResourceExists { resource_id: ResourceId },
    /// Removes a resource.
    ResourceRemove { resource_id: ResourceId },
    /// Marks a resource as failed with the given error resource.
    ResourceSetError { resource_id: ResourceId, error_id: ResourceId },
    /// Forbids adding further input fields.
    LockInputs { resource_id: ResourceId },
    /// Forbids adding further output fields.
    LockOutputs { resource_id: ResourceId },

    /// Resolves a resource name.
    NameGet { name: String },
    /// Binds a name to a resource.
    NameSet { name: String, resource_id: ResourceId },
    /// Checks whether a name is bound.
    NameExists { name: String },
    /// Unbinds a name.
    NameDelete { name: String },

    /// Creates a field of the given type.
    FieldCreate { field: FieldId, field_type: FieldType },
    /// Checks whether a field exists.
    FieldExists { field: FieldId },
    /// Assigns a field value.
    FieldSet { field: FieldId, value: ResourceId },
    /// Assigns a field error.
    FieldSetError { field: FieldId, error_id: ResourceId },
    /// Reads a field.
    FieldGet { field: FieldId },
    /// Clears an assigned field.
    FieldReset { field: FieldId },
    /// Removes a field.
    FieldRemove { field: FieldId },
    /// Lists the fields of a resource as a multi-message response.
    FieldList { resource_id: ResourceId },

    /// Stores a key-value entry on a resource.
    KvSet { resource_id: ResourceId, key: String, value: Bytes },
    /// Reads an entry, failing with `NotFound` when absent.
    KvGet { resource_id: ResourceId, key: String },
    /// Reads an entry if present.
    KvGetIfExists { resource_id: ResourceId, key: String },
    /// Deletes an entry.
    KvDelete { resource_id: ResourceId, key: String },
    /// Lists the entries of a resource as a multi-message response.
    KvList { resource_id: ResourceId },
}

/// Kind of response a request expects, one per [`TxRequest`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseKind {
    /// Answer to [`TxRequest::TxOpen`].
    TxOpen,
    /// Answer to [`TxRequest::TxCommit`].
    TxCommit,
    /// Answer to [`TxRequest::TxDiscard`].
    TxDiscard,
    /// Answer to [`TxRequest::CreateRoot`].
    CreateRoot,
    /// Answer to [`TxRequest::CreateStruct`].
    CreateStruct,
    /// Answer to [`TxRequest::CreateEphemeral`].
    CreateEphemeral,
    /// Answer to [`TxRequest::CreateValue`].
    CreateValue,
    /// Answer to [`TxRequest::ResourceGet`].
    ResourceGet,
    /// Answer to [`TxRequest::ResourceExists`].
    ResourceExists,
    /// Answer to [`TxRequest::ResourceRemove`].
    ResourceRemove,
    /// Answer to [`TxRequest::ResourceSetError`].
    ResourceSetError,
    /// Answer to [`TxRequest::LockInputs`].
    LockInputs,
    /// Answer to [`TxRequest::LockOutputs`].
    LockOutputs,
    /// Answer to [`TxRequest::NameGet`].
    NameGet,
    /// Answer to [`TxRequest::NameSet`].
    NameSet,
    /// Answer to [`TxRequest::NameExists`].
    NameExists,
    /// Answer to [`TxRequest::NameDelete`].
    NameDelete,
    /// Answer to [`TxRequest::FieldCreate`].
    FieldCreate,
    /// Answer to [`TxRequest::FieldExists`].
    FieldExists,
    /// Answer to [`TxRequest::FieldSet`].
    FieldSet,
    /// Answer to [`TxRequest::FieldSetError`].
    FieldSetError,
    /// Answer to [`TxRequest::FieldGet`].
    FieldGet,
    /// Answer to [`TxRequest::FieldReset`].
    FieldReset,
    /// Answer to [`TxRequest::FieldRemove`].
    FieldRemove,
    /// Answer to [`TxRequest::FieldList`].
    FieldList,
    /// Answer to [`TxRequest::KvSet`].
    KvSet,
    /// Answer to [`TxRequest::KvGet`].
    KvGet,
    /// Answer to [`TxRequest::KvGetIfExists`].
    KvGetIfExists,
    /// Answer to [`TxRequest::KvDelete`].
    KvDelete,
    /// Answer to [`TxRequest::KvList`].
    KvList,
}

impl ResponseKind {
    /// The response of this kind when it carries no payload, `None` for
    /// kinds that always carry one.
    pub fn empty_response(self) -> Option<TxResponse> {
        let resp = match self {
            ResponseKind::TxDiscard => TxResponse::TxDiscard,
            ResponseKind::ResourceRemove => TxResponse::ResourceRemove,
            ResponseKind::ResourceSetError => TxResponse::ResourceSetError,
            ResponseKind::LockInputs => TxResponse::LockInputs,
            ResponseKind::LockOutputs => TxResponse::LockOutputs,
            ResponseKind::NameSet => TxResponse::NameSet,
            ResponseKind::NameDelete => TxResponse::NameDelete,
            ResponseKind::FieldCreate => TxResponse::FieldCreate,
            ResponseKind::FieldSet => TxResponse::FieldSet,
            ResponseKind::FieldSetError => TxResponse::FieldSetError,
            ResponseKind::FieldReset => TxResponse::FieldReset,
            ResponseKind::FieldRemove => TxResponse::FieldRemove,
            ResponseKind::KvSet => TxResponse::KvSet,
            ResponseKind::KvDelete => TxResponse::KvDelete,
            ResponseKind::TxOpen
            | ResponseKind::TxCommit
            | ResponseKind::CreateRoot
            | ResponseKind::CreateStruct
            | ResponseKind::CreateEphemeral
            | ResponseKind::CreateValue
            | ResponseKind::ResourceGet
            | ResponseKind::ResourceExists
            | ResponseKind::NameGet
            | ResponseKind::NameExists
            | ResponseKind::FieldExists
            | ResponseKind::FieldGet
            | ResponseKind::FieldList
            | ResponseKind::KvGet
            | ResponseKind::KvGetIfExists
            | ResponseKind::KvList => return None,
        };
        Some(resp)
    }
}

impl TxRequest {
    /// Kind of the response the server must answer this request with.
    pub fn expected_response(&self) -> ResponseKind {
        match self {
            TxRequest::TxOpen { .. } => ResponseKind::TxOpen,
            TxRequest::TxCommit => ResponseKind::TxCommit,
            TxRequest::TxDiscard => ResponseKind::TxDiscard,
            TxRequest::CreateRoot { .. } => ResponseKind::CreateRoot,
            TxRequest::CreateStruct { .. } => ResponseKind::CreateStruct,
            TxRequest::CreateEphemeral { .. } => ResponseKind::CreateEphemeral,
            TxRequest::CreateValue { .. } => ResponseKind::CreateValue,
            TxRequest::ResourceGet { .. } => ResponseKind::ResourceGet,
            TxRequest::ResourceExists { .. } => ResponseKind::ResourceExists,
            TxRequest::ResourceRemove { .. } => ResponseKind::ResourceRemove,
            TxRequest::ResourceSetError { .. } => ResponseKind::ResourceSetError,
            TxRequest::LockInputs { .. } => ResponseKind::LockInputs,
            TxRequest::LockOutputs { .. } => ResponseKind::LockOutputs,
            TxRequest::NameGet { .. } => ResponseKind::NameGet,
            TxRequest::NameSet { .. } => ResponseKind::NameSet,
            TxRequest::NameExists { .. } => ResponseKind::NameExists,
            TxRequest::NameDelete { .. } => ResponseKind::NameDelete,
            TxRequest::FieldCreate { .. } => ResponseKind::FieldCreate,
            TxRequest::FieldExists { .. } => ResponseKind::FieldExists,
            TxRequest::FieldSet { .. } => ResponseKind::FieldSet,
            TxRequest::FieldSetError { .. } => ResponseKind::FieldSetError,
            TxRequest::FieldGet { .. } => ResponseKind::FieldGet,
            TxRequest::FieldReset { .. } => ResponseKind::FieldReset,
            TxRequest::FieldRemove { .. } => ResponseKind::FieldRemove,
            TxRequest::FieldList { .. } => ResponseKind::FieldList,
            TxRequest::KvSet { .. } => ResponseKind::KvSet,
            TxRequest::KvGet { .. } => ResponseKind::KvGet,
            TxRequest::KvGetIfExists { .. } => ResponseKind::KvGetIfExists,
            TxRequest::KvDelete { .. } => ResponseKind::KvDelete,
            TxRequest::KvList { .. } => ResponseKind::KvList,
        }
    }

    /// List-like requests answered with a multi-message sequence.
    pub fn is_multi(&self) -> bool {
        matches!(self, TxRequest::FieldList { .. } | TxRequest::KvList { .. })
    }

    /// Every resource id carried by the request, for locality checks.
    pub fn referenced_ids(&self) -> Vec<ResourceId> {
        match self {
            TxRequest::TxOpen { .. }
            | TxRequest::TxCommit
            | TxRequest::TxDiscard
            | TxRequest::NameGet { .. }
            | TxRequest::NameExists { .. }
            | TxRequest::NameDelete { .. } => Vec::new(),
            TxRequest::CreateRoot { local_id, .. }
            | TxRequest::CreateStruct { local_id, .. }
            | TxRequest::CreateEphemeral { local_id, .. }
            | TxRequest::CreateValue { local_id, .. } => vec![*local_id],
            TxRequest::ResourceGet { resource_id, .. }
            | TxRequest::ResourceExists { resource_id }
            | TxRequest::ResourceRemove { resource_id }
            | TxRequest::LockInputs { resource_id }
            | TxRequest::LockOutputs { resource_id }
            | TxRequest::NameSet { resource_id, .. }
            | TxRequest::FieldList { resource_id }
            | TxRequest::KvSet { resource_id, .. }
            | TxRequest::KvGet { resource_id, .. }
            | TxRequest::KvGetIfExists { resource_id, .. }
            | TxRequest::KvDelete { resource_id, .. }
            | TxRequest::KvList { resource_id } => vec![*resource_id],
            TxRequest::ResourceSetError {
                resource_id,
                error_id,
            } => vec![*resource_id, *error_id],
            TxRequest::FieldCreate { field, .. }
            | TxRequest::FieldExists { field }
            | TxRequest::FieldGet { field }
            | TxRequest::FieldReset { field }
            | TxRequest::FieldRemove { field } => vec![field.resource_id],
            TxRequest::FieldSet { field, value } => vec![field.resource_id, *value],
            TxRequest::FieldSetError { field, error_id } => vec![field.resource_id, *error_id],
        }
    }
}

/// Payload of a successful response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxResponse {
    /// Server-assigned global transaction id.
    TxOpen { global_tx_id: u64 },
    /// Whether the commit was applied.
    TxCommit { success: bool },
    /// Answer to [`TxRequest::TxDiscard`].
    TxDiscard,
    /// Answer to [`TxRequest::CreateRoot`].
    CreateRoot { resource_id: ResourceId },
    /// Answer to [`TxRequest::CreateStruct`].
    CreateStruct { resource_id: ResourceId },
    /// Answer to [`TxRequest::CreateEphemeral`].
    CreateEphemeral { resource_id: ResourceId },
    /// Answer to [`TxRequest::CreateValue`].
    CreateValue { resource_id: ResourceId },
    /// Answer to [`TxRequest::ResourceGet`].
    ResourceGet { resource: ResourceData },
    /// Answer to [`TxRequest::ResourceExists`].
    ResourceExists { exists: bool },
    /// Answer to [`TxRequest::ResourceRemove`].
    ResourceRemove,
    /// Answer to [`TxRequest::ResourceSetError`].
    ResourceSetError,
    /// Answer to [`TxRequest::LockInputs`].
    LockInputs,
    /// Answer to [`TxRequest::LockOutputs`].
    LockOutputs,
    /// Answer to [`TxRequest::NameGet`].
    NameGet { resource_id: ResourceId },
    /// Answer to [`TxRequest::NameSet`].
    NameSet,
    /// Answer to [`TxRequest::NameExists`].
    NameExists { exists: bool },
    /// Answer to [`TxRequest::NameDelete`].
    NameDelete,
    /// Answer to [`TxRequest::FieldCreate`].
    FieldCreate,
    /// Answer to [`TxRequest::FieldExists`].
    FieldExists { exists: bool },
    /// Answer to [`TxRequest::FieldSet`].
    FieldSet,
    /// Answer to [`TxRequest::FieldSetError`].
    FieldSetError,
    /// Answer to [`TxRequest::FieldGet`].
    FieldGet { field: FieldData },
    /// Answer to [`TxRequest::FieldReset`].
    FieldReset,
    /// Answer to [`TxRequest::FieldRemove`].
    FieldRemove,
    /// One field of a listing.
    FieldList { field: FieldData },
    /// Answer to [`TxRequest::KvSet`].
    KvSet,
    /// Answer to [`TxRequest::KvGet`].
    KvGet { value: Bytes },
    /// Answer to [`TxRequest::KvGetIfExists`].
    KvGetIfExists { value: Option<Bytes> },
    /// Answer to [`TxRequest::KvDelete`].
    KvDelete,
    /// One entry of a listing.
    KvList { entry: KeyValue },
}

impl TxResponse {
    /// Kind of this response.
    pub fn kind(&self) -> ResponseKind {
        match self {
            TxResponse::TxOpen { .. } => ResponseKind::TxOpen,
            TxResponse::TxCommit { .. } => ResponseKind::TxCommit,
            TxResponse::TxDiscard => ResponseKind::TxDiscard,
            TxResponse::CreateRoot { .. } => ResponseKind::CreateRoot,
            TxResponse::CreateStruct { .. } => ResponseKind::CreateStruct,
            TxResponse::CreateEphemeral { .. } => ResponseKind::CreateEphemeral,
            TxResponse::CreateValue { .. } => ResponseKind::CreateValue,
            TxResponse::ResourceGet { .. } => ResponseKind::ResourceGet,
            TxResponse::ResourceExists { .. } => ResponseKind::ResourceExists,
            TxResponse::ResourceRemove => ResponseKind::ResourceRemove,
            TxResponse::ResourceSetError => ResponseKind::ResourceSetError,
            TxResponse::LockInputs => ResponseKind::LockInputs,
            TxResponse::LockOutputs => ResponseKind::LockOutputs,
            TxResponse::NameGet { .. } => ResponseKind::NameGet,
            TxResponse::NameSet => ResponseKind::NameSet,
            TxResponse::NameExists { .. } => ResponseKind::NameExists,
            TxResponse::NameDelete => ResponseKind::NameDelete,
            TxResponse::FieldCreate => ResponseKind::FieldCreate,
            TxResponse::FieldExists { .. } => ResponseKind::FieldExists,
            TxResponse::FieldSet => ResponseKind::FieldSet,
            TxResponse::FieldSetError => ResponseKind::FieldSetError,
            TxResponse::FieldGet { .. } => ResponseKind::FieldGet,
            TxResponse::FieldReset => ResponseKind::FieldReset,
            TxResponse::FieldRemove => ResponseKind::FieldRemove,
            TxResponse::FieldList { .. } => ResponseKind::FieldList,
            TxResponse::KvSet => ResponseKind::KvSet,
            TxResponse::KvGet { .. } => ResponseKind::KvGet,
            TxResponse::KvGetIfExists { .. } => ResponseKind::KvGetIfExists,
            TxResponse::KvDelete => ResponseKind::KvDelete,
            TxResponse::KvList { .. } => ResponseKind::KvList,
        }
    }
}

/// Error classes the server attaches to failed responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Addressed entity does not exist.
    NotFound,
    /// Entity already exists.
    AlreadyExists,
    /// Request is malformed or refers to foreign ids.
    InvalidArgument,
    /// Entity is in a state that forbids the operation.
    FailedPrecondition,
    /// Caller may not perform the operation.
    PermissionDenied,
    /// Server-side failure.
    Internal,
    /// Unclassified error.
    Unknown,
}

/// Error attached by the server to a response message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error class.
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
}

impl ServerError {
    /// Creates an error with the given code.
    pub fn new(code: ErrorCode, message: &str) -> Self {
        Self {
            code,
            message: message.to_string(),
        }
    }

    /// Recoverable errors fail only the offending call.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::NotFound
                | ErrorCode::AlreadyExists
                | ErrorCode::InvalidArgument
                | ErrorCode::FailedPrecondition
        )
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// Position of a message within a multi-message response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiMessageInfo {
    /// 1-based position within the sequence.
    pub id: u32,
    /// Set on the final message of the sequence.
    pub is_last: bool,
    /// The message carries no entry. Only valid on the terminator.
    pub is_empty: bool,
}

/// Outbound frame on a transaction stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Stream-unique, strictly increasing id.
    pub request_id: u32,
    /// Request payload.
    pub request: TxRequest,
}

/// Inbound frame on a transaction stream. `request_id` echoes the request
/// this message answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMessage {
    /// Id of the request this message answers.
    pub request_id: u32,
    /// Checked against the kind the request expects.
    pub kind: ResponseKind,
    /// Set on success.
    pub body: Option<TxResponse>,
    /// Set on failure.
    pub error: Option<ServerError>,
    /// Set on every part of a multi-message response.
    pub multi: Option<MultiMessageInfo>,
}

impl ServerMessage {
    /// Single successful response.
    pub fn reply(request_id: u32, body: TxResponse) -> Self {
        Self {
            request_id,
            kind: body.kind(),
            body: Some(body),
            error: None,
            multi: None,
        }
    }

    /// Failed response.
    pub fn error(request_id: u32, kind: ResponseKind, error: ServerError) -> Self {
        Self {
            request_id,
            kind,
            body: None,
            error: Some(error),
            multi: None,
        }
    }

    /// One entry of a multi-message response.
    pub fn multi_part(request_id: u32, body: TxResponse, id: u32, is_last: bool) -> Self {
        Self {
            request_id,
            kind: body.kind(),
            body: Some(body),
            error: None,
            multi: Some(MultiMessageInfo {
                id,
                is_last,
                is_empty: false,
            }),
        }
    }

    /// Terminator for a multi-message sequence with no (further) entries.
    pub fn multi_empty(request_id: u32, kind: ResponseKind, id: u32) -> Self {
        Self {
            request_id,
            kind,
            body: None,
            error: None,
            multi: Some(MultiMessageInfo {
                id,
                is_last: true,
                is_empty: true,
            }),
        }
    }

    /// Replaces the multi-message info.
    pub fn with_multi(mut self, multi: MultiMessageInfo) -> Self {
        self.multi = Some(multi);
        self
    }
}
