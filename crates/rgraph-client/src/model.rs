//! Resource graph data model as observed by the client.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::resource_id::ResourceId;

/// Whether a resource is mutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    /// Mutable resource with fields.
    Structural,
    /// Immutable, content-addressed resource.
    Value,
}

/// Versioned resource type name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceType {
    /// Type name.
    pub name: String,
    /// Type version.
    pub version: String,
}

impl ResourceType {
    /// Creates a type from its name and version.
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

/// Role of a field within its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    /// Consumed by the resource.
    Input,
    /// Produced by the resource.
    Output,
    /// Wired by the platform, not by clients.
    Service,
    /// Assignable once.
    OneTimeWritable,
    /// Created at runtime by the resource itself.
    Dynamic,
    /// Assignable any number of times.
    MultipleTimesWritable,
}

/// Field status only ever moves forward: `Empty -> Assigned -> Resolved`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FieldStatus {
    /// Nothing assigned.
    Empty,
    /// Holds a reference that may not be final yet.
    Assigned,
    /// Holds a final value or error.
    Resolved,
}

impl FieldStatus {
    /// Whether `next` is a legal successor of this status.
    pub fn can_transition_to(self, next: FieldStatus) -> bool {
        next >= self
    }
}

/// A named field on a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldId {
    /// Owning resource.
    pub resource_id: ResourceId,
    /// Field name, unique within the resource.
    pub field_name: String,
}

impl FieldId {
    /// Field `field_name` on `resource_id`.
    pub fn new(resource_id: ResourceId, field_name: &str) -> Self {
        Self {
            resource_id,
            field_name: field_name.to_string(),
        }
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_id, self.field_name)
    }
}

/// Field as returned by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldData {
    /// Field name.
    pub name: String,
    /// Role of the field.
    pub field_type: FieldType,
    /// Assignment progress.
    pub status: FieldStatus,
    /// Assigned value, null when unset.
    pub value: ResourceId,
    /// Assigned error, null when unset.
    pub error: ResourceId,
    /// The assigned value can no longer change.
    pub value_is_final: bool,
}

impl FieldData {
    /// True when a value is assigned.
    pub fn has_value(&self) -> bool {
        !self.value.is_null()
    }

    /// True when an error is assigned.
    pub fn has_error(&self) -> bool {
        !self.error.is_null()
    }
}

/// Resource as returned by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceData {
    /// Global id.
    pub id: ResourceId,
    /// Non-null when this resource is a deduplicated alias of another.
    pub original_resource_id: ResourceId,
    /// Structural or value.
    pub kind: ResourceKind,
    /// Declared type.
    pub resource_type: ResourceType,
    /// Opaque payload.
    pub data: Option<Bytes>,
    /// Error resource, null when the resource did not fail.
    pub error: ResourceId,
    /// No further input fields may be added.
    pub inputs_locked: bool,
    /// No further output fields may be added.
    pub outputs_locked: bool,
    /// All outputs are resolved.
    pub resource_ready: bool,
    /// Once set, the resource and its fields never change again.
    pub is_final: bool,
    /// Present only when requested.
    pub fields: Option<Vec<FieldData>>,
}

impl ResourceData {
    /// Looks up a loaded field by name.
    pub fn field(&self, name: &str) -> Option<&FieldData> {
        self.fields.as_ref()?.iter().find(|f| f.name == name)
    }

    /// True when the resource failed.
    pub fn has_error(&self) -> bool {
        !self.error.is_null()
    }
}

/// Key-value entry stored on a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    /// Entry key, unique per resource.
    pub key: String,
    /// Opaque entry value.
    pub value: Bytes,
}
