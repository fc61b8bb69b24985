//! In-memory resource graph server.
//!
//! Implements [`GraphTransport`] directly, without a network hop. Each stream
//! works on a snapshot of the graph taken at open time and records which
//! resources and names it read or wrote. A commit succeeds only if none of
//! those changed in the live graph since the snapshot; otherwise the server
//! answers with an unsuccessful commit, which the client reports as a
//! conflict.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use rgraph_client::{
    AuthInformation, CallMetadata, CLIENT_ROOT_TYPE, ClientMessage, ErrorCode, FieldData, FieldId, FieldStatus, FieldType,
    GraphTransport, KeyValue, ResourceData, ResourceId, ResourceKind, ResourceType, ServerError, ServerMessage,
    StatusCode, TransportStatus, TxRequest, TxResponse, TxStreamParts,
};

use crate::harness::issue_token;

type OpResult<T> = std::result::Result<T, ServerError>;

#[derive(Debug, Clone)]
struct StoredField {
    field_type: FieldType,
    value: ResourceId,
    error: ResourceId,
}

impl StoredField {
    fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            value: ResourceId::NULL,
            error: ResourceId::NULL,
        }
    }

    fn to_data(&self, name: &str) -> FieldData {
        let status = if self.value.is_null() && self.error.is_null() {
            FieldStatus::Empty
        } else {
            FieldStatus::Resolved
        };
        FieldData {
            name: name.to_string(),
            field_type: self.field_type,
            status,
            value: self.value,
            error: self.error,
            value_is_final: false,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredResource {
    id: ResourceId,
    kind: ResourceKind,
    resource_type: ResourceType,
    data: Option<Bytes>,
    error: ResourceId,
    inputs_locked: bool,
    outputs_locked: bool,
    fields: BTreeMap<String, StoredField>,
    kv: BTreeMap<String, Bytes>,
}

impl StoredResource {
    fn to_data(&self, load_fields: bool) -> ResourceData {
        ResourceData {
            id: self.id,
            original_resource_id: ResourceId::NULL,
            kind: self.kind,
            resource_type: self.resource_type.clone(),
            data: self.data.clone(),
            error: self.error,
            inputs_locked: self.inputs_locked,
            outputs_locked: self.outputs_locked,
            resource_ready: self.inputs_locked && self.outputs_locked,
            is_final: false,
            fields: load_fields.then(|| {
                self.fields
                    .iter()
                    .map(|(name, f)| f.to_data(name))
                    .collect()
            }),
        }
    }
}

/// Unit of conflict detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Key {
    Resource(ResourceId),
    Name(String),
}

#[derive(Debug, Clone, Default)]
struct Graph {
    resources: HashMap<ResourceId, StoredResource>,
    names: HashMap<String, ResourceId>,
    values: HashMap<(ResourceType, Bytes), ResourceId>,
    versions: HashMap<Key, u64>,
}

impl Graph {
    fn version(&self, key: &Key) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }
}

/// Counters observable by tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub streams_opened: u64,
    pub commits: u64,
    pub conflicts: u64,
    pub syncs: u64,
    pub refreshes: u64,
}

#[derive(Default)]
struct Counters {
    streams_opened: AtomicU64,
    commits: AtomicU64,
    conflicts: AtomicU64,
    syncs: AtomicU64,
    refreshes: AtomicU64,
}

struct Inner {
    graph: Mutex<Graph>,
    next_global: AtomicU64,
    next_tx: AtomicU64,
    require_auth: bool,
    available: AtomicBool,
    stalled: AtomicBool,
    name_race: AtomicBool,
    log: Mutex<Vec<TxRequest>>,
    counters: Counters,
}

impl Inner {
    fn graph(&self) -> MutexGuard<'_, Graph> {
        self.graph.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn log(&self) -> MutexGuard<'_, Vec<TxRequest>> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Commits a fresh client root under `name` straight into the live graph,
    /// as another client would.
    fn plant_competitor(&self, name: &str) -> OpResult<ResourceId> {
        let raw = self.next_global.fetch_add(1, Ordering::SeqCst);
        let id = ResourceId::global(true, raw).map_err(|e| ServerError::new(ErrorCode::Internal, &e.to_string()))?;
        let (type_name, version) = CLIENT_ROOT_TYPE;
        let mut graph = self.graph();
        graph.resources.insert(
            id,
            StoredResource {
                id,
                kind: ResourceKind::Structural,
                resource_type: ResourceType::new(type_name, version),
                data: None,
                error: ResourceId::NULL,
                inputs_locked: false,
                outputs_locked: false,
                fields: BTreeMap::new(),
                kv: BTreeMap::new(),
            },
        );
        graph.names.insert(name.to_string(), id);
        for key in [Key::Resource(id), Key::Name(name.to_string())] {
            *graph.versions.entry(key).or_insert(0) += 1;
        }
        Ok(id)
    }
}

#[derive(Clone)]
pub struct MemoryGraphServer {
    inner: Arc<Inner>,
}

impl Default for MemoryGraphServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGraphServer {
    pub fn new() -> Self {
        Self::build(false)
    }

    /// A server that rejects calls without a bearer token.
    pub fn with_auth() -> Self {
        Self::build(true)
    }

    fn build(require_auth: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                graph: Mutex::new(Graph::default()),
                next_global: AtomicU64::new(1),
                next_tx: AtomicU64::new(1),
                require_auth,
                available: AtomicBool::new(true),
                stalled: AtomicBool::new(false),
                name_race: AtomicBool::new(false),
                log: Mutex::new(Vec::new()),
                counters: Counters::default(),
            }),
        }
    }

    /// While unavailable, every call fails with `Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// While stalled, open streams swallow every request except the open.
    pub fn set_stalled(&self, stalled: bool) {
        self.inner.stalled.store(stalled, Ordering::SeqCst);
    }

    /// The next `NameSet` loses a race: another client's root is committed
    /// under that name first and the request fails with `AlreadyExists`.
    pub fn race_next_name_set(&self) {
        self.inner.name_race.store(true, Ordering::SeqCst);
    }

    pub fn stats(&self) -> ServerStats {
        let c = &self.inner.counters;
        ServerStats {
            streams_opened: c.streams_opened.load(Ordering::SeqCst),
            commits: c.commits.load(Ordering::SeqCst),
            conflicts: c.conflicts.load(Ordering::SeqCst),
            syncs: c.syncs.load(Ordering::SeqCst),
            refreshes: c.refreshes.load(Ordering::SeqCst),
        }
    }

    /// Every request received so far, across all streams.
    pub fn request_log(&self) -> Vec<TxRequest> {
        self.inner.log().clone()
    }

    pub fn clear_log(&self) {
        self.inner.log().clear();
    }

    /// Committed value of a field, bypassing transactions.
    pub fn field_value(&self, resource: ResourceId, field: &str) -> Option<ResourceId> {
        let graph = self.inner.graph();
        graph
            .resources
            .get(&resource)
            .and_then(|r| r.fields.get(field))
            .map(|f| f.value)
    }

    pub fn resource_by_name(&self, name: &str) -> Option<ResourceId> {
        self.inner.graph().names.get(name).copied()
    }

    pub fn resource_count(&self) -> usize {
        self.inner.graph().resources.len()
    }

    fn check_call(&self, metadata: &CallMetadata) -> std::result::Result<(), TransportStatus> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(TransportStatus::new(StatusCode::Unavailable, "server unavailable"));
        }
        if !self.inner.require_auth {
            return Ok(());
        }
        let token = metadata
            .bearer_token
            .as_deref()
            .ok_or_else(|| TransportStatus::new(StatusCode::Unauthenticated, "missing bearer token"))?;
        let info = AuthInformation::from_jwt(token)
            .map_err(|e| TransportStatus::new(StatusCode::Unauthenticated, &e.to_string()))?;
        if info.is_expired_at(now_secs() * 1000) {
            return Err(TransportStatus::new(StatusCode::Unauthenticated, "token expired"));
        }
        Ok(())
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[async_trait]
impl GraphTransport for MemoryGraphServer {
    async fn open_tx_stream(
        &self,
        metadata: CallMetadata,
        cancel: CancellationToken,
    ) -> std::result::Result<TxStreamParts, TransportStatus> {
        self.check_call(&metadata)?;
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.inner.counters.streams_opened.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(serve_stream(self.inner.clone(), out_rx, in_tx, cancel));
        Ok(TxStreamParts {
            outbound: out_tx,
            inbound: in_rx,
        })
    }

    async fn sync_tx(&self, metadata: CallMetadata, global_tx_id: u64) -> std::result::Result<(), TransportStatus> {
        self.check_call(&metadata)?;
        if global_tx_id == 0 || global_tx_id >= self.inner.next_tx.load(Ordering::SeqCst) {
            return Err(TransportStatus::new(
                StatusCode::Internal,
                &format!("unknown transaction {global_tx_id}"),
            ));
        }
        self.inner.counters.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn refresh_token(&self, metadata: CallMetadata, ttl: Duration) -> std::result::Result<String, TransportStatus> {
        self.check_call(&metadata)?;
        let login = metadata
            .bearer_token
            .as_deref()
            .and_then(|t| AuthInformation::from_jwt(t).ok())
            .and_then(|i| i.login)
            .ok_or_else(|| TransportStatus::new(StatusCode::Unauthenticated, "nothing to refresh"))?;
        self.inner.counters.refreshes.fetch_add(1, Ordering::SeqCst);
        let now = now_secs();
        Ok(issue_token(&login, now, now + ttl.as_secs()))
    }

    async fn ping(&self, metadata: CallMetadata) -> std::result::Result<(), TransportStatus> {
        self.check_call(&metadata)
    }
}

async fn serve_stream(
    inner: Arc<Inner>,
    mut requests: mpsc::UnboundedReceiver<ClientMessage>,
    responses: mpsc::UnboundedSender<std::result::Result<ServerMessage, TransportStatus>>,
    cancel: CancellationToken,
) {
    let mut tx: Option<ServerTx> = None;
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = requests.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        inner.log().push(msg.request.clone());
        let is_open = matches!(msg.request, TxRequest::TxOpen { .. });
        if inner.stalled.load(Ordering::SeqCst) && !is_open {
            trace!(request_id = msg.request_id, "stalled, request swallowed");
            continue;
        }
        for reply in handle(&inner, &mut tx, msg) {
            if responses.send(Ok(reply)).is_err() {
                return;
            }
        }
    }
    if let Some(tx) = tx {
        trace!(global_tx_id = tx.global_tx_id, committed = tx.done, "stream closed");
    }
}

fn handle(inner: &Inner, tx: &mut Option<ServerTx>, msg: ClientMessage) -> Vec<ServerMessage> {
    let ClientMessage { request_id, request } = msg;
    let kind = request.expected_response();
    let fail = |code, message: &str| vec![ServerMessage::error(request_id, kind, ServerError::new(code, message))];

    if let TxRequest::TxOpen { writable, .. } = request {
        if tx.is_some() {
            return fail(ErrorCode::FailedPrecondition, "transaction already open");
        }
        let global_tx_id = inner.next_tx.fetch_add(1, Ordering::SeqCst);
        *tx = Some(ServerTx {
            global_tx_id,
            writable,
            snapshot: inner.graph().clone(),
            reads: HashSet::new(),
            writes: HashSet::new(),
            locals: HashMap::new(),
            done: false,
        });
        return vec![ServerMessage::reply(request_id, TxResponse::TxOpen { global_tx_id })];
    }

    let Some(state) = tx.as_mut() else {
        return fail(ErrorCode::FailedPrecondition, "transaction not open");
    };
    if state.done {
        return fail(ErrorCode::FailedPrecondition, "transaction already finished");
    }

    if request.is_multi() {
        return match state.list(request) {
            Ok(parts) if parts.is_empty() => vec![ServerMessage::multi_empty(request_id, kind, 1)],
            Ok(parts) => {
                let last = parts.len() - 1;
                parts
                    .into_iter()
                    .enumerate()
                    .map(|(i, body)| ServerMessage::multi_part(request_id, body, i as u32 + 1, i == last))
                    .collect()
            }
            Err(e) => vec![ServerMessage::error(request_id, kind, e)],
        };
    }
    match state.apply(inner, request) {
        Ok(body) => vec![ServerMessage::reply(request_id, body)],
        Err(e) => vec![ServerMessage::error(request_id, kind, e)],
    }
}

fn not_found(what: impl std::fmt::Display) -> ServerError {
    ServerError::new(ErrorCode::NotFound, &format!("{what} not found"))
}

struct ServerTx {
    global_tx_id: u64,
    writable: bool,
    snapshot: Graph,
    reads: HashSet<Key>,
    writes: HashSet<Key>,
    locals: HashMap<ResourceId, ResourceId>,
    done: bool,
}

impl ServerTx {
    fn require_writable(&self) -> OpResult<()> {
        if self.writable {
            Ok(())
        } else {
            Err(ServerError::new(ErrorCode::InvalidArgument, "read-only transaction"))
        }
    }

    fn resolve(&self, id: ResourceId) -> OpResult<ResourceId> {
        if !id.is_local() {
            return Ok(id);
        }
        self.locals
            .get(&id)
            .copied()
            .ok_or_else(|| not_found(format!("local resource {id}")))
    }

    fn resource(&mut self, id: ResourceId) -> OpResult<&StoredResource> {
        let id = self.resolve(id)?;
        self.reads.insert(Key::Resource(id));
        self.snapshot
            .resources
            .get(&id)
            .ok_or_else(|| not_found(format!("resource {id}")))
    }

    fn resource_mut(&mut self, id: ResourceId) -> OpResult<&mut StoredResource> {
        self.require_writable()?;
        let id = self.resolve(id)?;
        self.reads.insert(Key::Resource(id));
        self.writes.insert(Key::Resource(id));
        self.snapshot
            .resources
            .get_mut(&id)
            .ok_or_else(|| not_found(format!("resource {id}")))
    }

    fn existing(&mut self, id: ResourceId) -> OpResult<ResourceId> {
        let resolved = self.resolve(id)?;
        self.resource(resolved)?;
        Ok(resolved)
    }

    fn read_name(&mut self, name: &str) -> Option<ResourceId> {
        self.reads.insert(Key::Name(name.to_string()));
        self.snapshot.names.get(name).copied()
    }

    fn create(
        &mut self,
        inner: &Inner,
        local_id: ResourceId,
        kind: ResourceKind,
        resource_type: ResourceType,
        data: Option<Bytes>,
    ) -> OpResult<ResourceId> {
        self.require_writable()?;
        if !local_id.is_local() {
            return Err(ServerError::new(ErrorCode::InvalidArgument, "create requires a local id"));
        }
        if self.locals.contains_key(&local_id) {
            return Err(ServerError::new(
                ErrorCode::AlreadyExists,
                &format!("local id {local_id} already used"),
            ));
        }
        let raw = inner.next_global.fetch_add(1, Ordering::SeqCst);
        let id = ResourceId::global(local_id.is_root(), raw)
            .map_err(|e| ServerError::new(ErrorCode::Internal, &e.to_string()))?;
        self.snapshot.resources.insert(
            id,
            StoredResource {
                id,
                kind,
                resource_type,
                data,
                error: ResourceId::NULL,
                inputs_locked: false,
                outputs_locked: false,
                fields: BTreeMap::new(),
                kv: BTreeMap::new(),
            },
        );
        self.writes.insert(Key::Resource(id));
        self.locals.insert(local_id, id);
        Ok(id)
    }

    fn field_mut(&mut self, field: &FieldId) -> OpResult<&mut StoredField> {
        let resource = self.resource_mut(field.resource_id)?;
        resource
            .fields
            .get_mut(&field.field_name)
            .ok_or_else(|| not_found(format!("field {field}")))
    }

    fn apply(&mut self, inner: &Inner, request: TxRequest) -> OpResult<TxResponse> {
        let resp = match request {
            TxRequest::TxOpen { .. } => {
                return Err(ServerError::new(ErrorCode::FailedPrecondition, "transaction already open"))
            }
            TxRequest::TxCommit => {
                self.done = true;
                TxResponse::TxCommit {
                    success: self.commit(inner),
                }
            }
            TxRequest::TxDiscard => {
                self.done = true;
                TxResponse::TxDiscard
            }

            TxRequest::CreateRoot {
                local_id,
                resource_type,
            } => TxResponse::CreateRoot {
                resource_id: self.create(inner, local_id, ResourceKind::Structural, resource_type, None)?,
            },
            TxRequest::CreateStruct {
                local_id,
                resource_type,
                data,
            } => TxResponse::CreateStruct {
                resource_id: self.create(inner, local_id, ResourceKind::Structural, resource_type, data)?,
            },
            TxRequest::CreateEphemeral {
                local_id,
                resource_type,
                data,
            } => TxResponse::CreateEphemeral {
                resource_id: self.create(inner, local_id, ResourceKind::Structural, resource_type, data)?,
            },
            TxRequest::CreateValue {
                local_id,
                resource_type,
                data,
                error_if_exists,
            } => {
                let key = (resource_type.clone(), data.clone());
                let resource_id = match self.snapshot.values.get(&key).copied() {
                    Some(_) if error_if_exists => {
                        return Err(ServerError::new(ErrorCode::AlreadyExists, "value resource exists"))
                    }
                    Some(existing) => {
                        self.require_writable()?;
                        self.locals.insert(local_id, existing);
                        existing
                    }
                    None => {
                        let id = self.create(inner, local_id, ResourceKind::Value, resource_type, Some(data))?;
                        self.snapshot.values.insert(key, id);
                        id
                    }
                };
                TxResponse::CreateValue { resource_id }
            }
            TxRequest::ResourceGet {
                resource_id,
                load_fields,
            } => TxResponse::ResourceGet {
                resource: self.resource(resource_id)?.to_data(load_fields),
            },
            TxRequest::ResourceExists { resource_id } => TxResponse::ResourceExists {
                exists: self.resource(resource_id).is_ok(),
            },
            TxRequest::ResourceRemove { resource_id } => {
                let id = self.resource_mut(resource_id)?.id;
                self.snapshot.resources.remove(&id);
                TxResponse::ResourceRemove
            }
            TxRequest::ResourceSetError {
                resource_id,
                error_id,
            } => {
                let error = self.existing(error_id)?;
                self.resource_mut(resource_id)?.error = error;
                TxResponse::ResourceSetError
            }
            TxRequest::LockInputs { resource_id } => {
                self.resource_mut(resource_id)?.inputs_locked = true;
                TxResponse::LockInputs
            }
            TxRequest::LockOutputs { resource_id } => {
                self.resource_mut(resource_id)?.outputs_locked = true;
                TxResponse::LockOutputs
            }

            TxRequest::NameGet { name } => TxResponse::NameGet {
                resource_id: self.read_name(&name).ok_or_else(|| not_found(format!("name '{name}'")))?,
            },
            TxRequest::NameSet { name, resource_id } => {
                self.require_writable()?;
                let id = self.existing(resource_id)?;
                if self.read_name(&name).is_some() {
                    return Err(ServerError::new(
                        ErrorCode::AlreadyExists,
                        &format!("name '{name}' already exists"),
                    ));
                }
                if inner.name_race.swap(false, Ordering::SeqCst) {
                    let competitor = inner.plant_competitor(&name)?;
                    debug!(%name, %competitor, "name taken by a concurrent writer");
                    return Err(ServerError::new(
                        ErrorCode::AlreadyExists,
                        &format!("name '{name}' already exists"),
                    ));
                }
                self.writes.insert(Key::Name(name.clone()));
                self.snapshot.names.insert(name, id);
                TxResponse::NameSet
            }
            TxRequest::NameExists { name } => TxResponse::NameExists {
                exists: self.read_name(&name).is_some(),
            },
            TxRequest::NameDelete { name } => {
                self.require_writable()?;
                if self.read_name(&name).is_none() {
                    return Err(not_found(format!("name '{name}'")));
                }
                self.writes.insert(Key::Name(name.clone()));
                self.snapshot.names.remove(&name);
                TxResponse::NameDelete
            }

            TxRequest::FieldCreate { field, field_type } => {
                let resource = self.resource_mut(field.resource_id)?;
                if resource.fields.contains_key(&field.field_name) {
                    return Err(ServerError::new(
                        ErrorCode::AlreadyExists,
                        &format!("field {field} already exists"),
                    ));
                }
                resource
                    .fields
                    .insert(field.field_name, StoredField::new(field_type));
                TxResponse::FieldCreate
            }
            TxRequest::FieldExists { field } => TxResponse::FieldExists {
                exists: self.resource(field.resource_id)?.fields.contains_key(&field.field_name),
            },
            TxRequest::FieldSet { field, value } => {
                let value = self.existing(value)?;
                let resource = self.resource_mut(field.resource_id)?;
                let stored = resource
                    .fields
                    .entry(field.field_name)
                    .or_insert_with(|| StoredField::new(FieldType::Input));
                stored.value = value;
                TxResponse::FieldSet
            }
            TxRequest::FieldSetError { field, error_id } => {
                let error = self.existing(error_id)?;
                self.field_mut(&field)?.error = error;
                TxResponse::FieldSetError
            }
            TxRequest::FieldGet { field } => {
                let resource = self.resource(field.resource_id)?;
                let data = resource
                    .fields
                    .get(&field.field_name)
                    .map(|f| f.to_data(&field.field_name))
                    .ok_or_else(|| not_found(format!("field {field}")))?;
                TxResponse::FieldGet { field: data }
            }
            TxRequest::FieldReset { field } => {
                let stored = self.field_mut(&field)?;
                stored.value = ResourceId::NULL;
                stored.error = ResourceId::NULL;
                TxResponse::FieldReset
            }
            TxRequest::FieldRemove { field } => {
                let resource = self.resource_mut(field.resource_id)?;
                if resource.fields.remove(&field.field_name).is_none() {
                    return Err(not_found(format!("field {field}")));
                }
                TxResponse::FieldRemove
            }

            TxRequest::KvSet {
                resource_id,
                key,
                value,
            } => {
                self.resource_mut(resource_id)?.kv.insert(key, value);
                TxResponse::KvSet
            }
            TxRequest::KvGet { resource_id, key } => TxResponse::KvGet {
                value: self
                    .resource(resource_id)?
                    .kv
                    .get(&key)
                    .cloned()
                    .ok_or_else(|| not_found(format!("key '{key}'")))?,
            },
            TxRequest::KvGetIfExists { resource_id, key } => TxResponse::KvGetIfExists {
                value: self.resource(resource_id)?.kv.get(&key).cloned(),
            },
            TxRequest::KvDelete { resource_id, key } => {
                if self.resource_mut(resource_id)?.kv.remove(&key).is_none() {
                    return Err(not_found(format!("key '{key}'")));
                }
                TxResponse::KvDelete
            }

            TxRequest::FieldList { .. } | TxRequest::KvList { .. } => {
                return Err(ServerError::new(ErrorCode::Internal, "list request on single path"))
            }
        };
        Ok(resp)
    }

    fn list(&mut self, request: TxRequest) -> OpResult<Vec<TxResponse>> {
        match request {
            TxRequest::FieldList { resource_id } => Ok(self
                .resource(resource_id)?
                .fields
                .iter()
                .map(|(name, f)| TxResponse::FieldList { field: f.to_data(name) })
                .collect()),
            TxRequest::KvList { resource_id } => Ok(self
                .resource(resource_id)?
                .kv
                .iter()
                .map(|(key, value)| TxResponse::KvList {
                    entry: KeyValue {
                        key: key.clone(),
                        value: value.clone(),
                    },
                })
                .collect()),
            other => Err(ServerError::new(
                ErrorCode::Internal,
                &format!("{:?} is not a list request", other.expected_response()),
            )),
        }
    }

    /// Applies this transaction's writes if nothing it touched changed.
    fn commit(&mut self, inner: &Inner) -> bool {
        let mut live = inner.graph();
        let conflict = self
            .reads
            .iter()
            .chain(self.writes.iter())
            .find(|k| live.version(k) != self.snapshot.version(k));
        if let Some(key) = conflict {
            inner.counters.conflicts.fetch_add(1, Ordering::SeqCst);
            debug!(global_tx_id = self.global_tx_id, ?key, "commit conflict");
            return false;
        }

        for key in &self.writes {
            match key {
                Key::Resource(id) => match self.snapshot.resources.get(id) {
                    Some(r) => {
                        if let (ResourceKind::Value, Some(data)) = (r.kind, &r.data) {
                            live.values.insert((r.resource_type.clone(), data.clone()), *id);
                        }
                        live.resources.insert(*id, r.clone());
                    }
                    None => {
                        live.resources.remove(id);
                    }
                },
                Key::Name(name) => match self.snapshot.names.get(name) {
                    Some(id) => {
                        live.names.insert(name.clone(), *id);
                    }
                    None => {
                        live.names.remove(name);
                    }
                },
            }
            *live.versions.entry(key.clone()).or_insert(0) += 1;
        }
        inner.counters.commits.fetch_add(1, Ordering::SeqCst);
        debug!(global_tx_id = self.global_tx_id, writes = self.writes.len(), "committed");
        true
    }
}
