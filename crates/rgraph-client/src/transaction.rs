//! High-level transaction over one correlated stream.
//!
//! Value-returning operations wait for their answer. Void operations are sent
//! right away but only their completions are queued; the next value-returning
//! operation (or commit/discard) drains that queue first, so failures of void
//! operations surface there without a round trip per call.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::correlator::{MessageCorrelator, ResponseFuture};
use crate::deadline::{race, Deadline};
use crate::error::{GraphError, Result};
use crate::ll_client::{LlTransaction, LocalTxId};
use crate::message::{TxRequest, TxResponse};
use crate::model::{FieldData, FieldId, FieldType, KeyValue, ResourceData, ResourceType};
use crate::resource_id::ResourceId;
use crate::stats::ClientStats;

/// Type of the ephemeral resource that forwards another resource's field.
pub const GET_FIELD_RESOURCE_TYPE: (&str, &str) = ("getField", "1");

/// Global id of a resource created in this transaction, available once the
/// server acknowledged the create request.
#[derive(Debug, Clone)]
pub struct GlobalIdFuture {
    rx: watch::Receiver<Option<Result<ResourceId>>>,
}

impl GlobalIdFuture {
    fn spawn(response: ResponseFuture) -> Self {
        let (tx, rx) = watch::channel(None);
        tokio::spawn(async move {
            let result = match response.single().await {
                Ok(
                    TxResponse::CreateRoot { resource_id }
                    | TxResponse::CreateStruct { resource_id }
                    | TxResponse::CreateEphemeral { resource_id }
                    | TxResponse::CreateValue { resource_id },
                ) => Ok(resource_id),
                Ok(other) => Err(unexpected(other)),
                Err(e) => Err(e),
            };
            tx.send_replace(Some(result));
        });
        Self { rx }
    }

    /// Waits for the server to acknowledge the create.
    pub async fn resolve(&self) -> Result<ResourceId> {
        let mut rx = self.rx.clone();
        let value = rx
            .wait_for(|v| v.is_some())
            .await
            .map_err(|_| GraphError::TransactionClosed)?;
        value.clone().unwrap_or(Err(GraphError::TransactionClosed))
    }

    /// Resolved id without waiting, `None` while still pending.
    pub fn try_get(&self) -> Option<Result<ResourceId>> {
        self.rx.borrow().clone()
    }
}

/// A resource created in this transaction: the local id works immediately
/// for further operations in the same transaction.
#[derive(Debug, Clone)]
pub struct ResourceRef {
    /// Transaction-scoped id, usable right away.
    pub local_id: ResourceId,
    /// Global id, known once the create is acknowledged.
    pub global_id: GlobalIdFuture,
}

impl ResourceRef {
    /// Waits for the global id.
    pub async fn global(&self) -> Result<ResourceId> {
        self.global_id.resolve().await
    }
}

impl From<&ResourceRef> for ResourceId {
    fn from(r: &ResourceRef) -> Self {
        r.local_id
    }
}

type PendingOp = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

struct SessionInner {
    name: String,
    writable: bool,
    correlator: MessageCorrelator,
    local_tx: LocalTxId,
    cancel: CancellationToken,
    global_tx_id: u64,
    client_root: ResourceId,
    local_counter: AtomicU32,
    finished: AtomicBool,
    pending: Mutex<Vec<PendingOp>>,
    request_timeout: Duration,
    stats: Arc<ClientStats>,
}

/// Options a session is opened with.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Name reported to the server, for diagnostics.
    pub name: String,
    /// Opens the transaction for writing. A read-only commit only closes the stream.
    pub writable: bool,
    /// Root this session operates under.
    pub client_root: ResourceId,
    /// Applies to each awaited request.
    pub request_timeout: Duration,
}

/// One open transaction. Cheap to clone; clones share the stream.
///
/// Void operations are queued without waiting for their reply. Their
/// errors surface at the latest on commit.
#[derive(Clone)]
pub struct TransactionSession {
    inner: Arc<SessionInner>,
}

impl TransactionSession {
    /// Sends the open request and waits for the server's transaction id.
    pub async fn open(
        ll: LlTransaction,
        options: SessionOptions,
        stats: Arc<ClientStats>,
    ) -> Result<Self> {
        let LlTransaction {
            correlator,
            local_tx,
            cancel,
        } = ll;
        let opening = correlator.send(TxRequest::TxOpen {
            name: options.name.clone(),
            writable: options.writable,
        })?;
        stats.inc_requests_sent();
        let resp = race(
            opening.single(),
            Some(Deadline::after(options.request_timeout)),
            Some(&cancel),
        )
        .await;
        let global_tx_id = match resp {
            Ok(TxResponse::TxOpen { global_tx_id }) => global_tx_id,
            Ok(other) => return Err(unexpected(other)),
            Err(e) => {
                if e.is_timeout_or_cancel() {
                    correlator.abort(e.clone());
                }
                return Err(e);
            }
        };
        stats.inc_tx_opened();
        debug!(
            tx = %options.name,
            local_tx_id = local_tx.get(),
            global_tx_id,
            writable = options.writable,
            "transaction opened"
        );

        Ok(Self {
            inner: Arc::new(SessionInner {
                name: options.name,
                writable: options.writable,
                correlator,
                local_tx,
                cancel,
                global_tx_id,
                client_root: options.client_root,
                local_counter: AtomicU32::new(0),
                finished: AtomicBool::new(false),
                pending: Mutex::new(Vec::new()),
                request_timeout: options.request_timeout,
                stats,
            }),
        })
    }

    /// Name the transaction was opened with.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the transaction was opened writable.
    pub fn is_writable(&self) -> bool {
        self.inner.writable
    }

    /// Server-assigned transaction id.
    pub fn global_tx_id(&self) -> u64 {
        self.inner.global_tx_id
    }

    /// Client-side id embedded in this transaction's local resource ids.
    pub fn local_tx_id(&self) -> u32 {
        self.inner.local_tx.get()
    }

    /// Root the session operates under.
    pub fn client_root(&self) -> ResourceId {
        self.inner.client_root
    }

    /// True after commit, discard or abort.
    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_finished() {
            return Err(GraphError::TransactionAlreadyClosed);
        }
        Ok(())
    }

    fn next_local_id(&self, root: bool) -> Result<ResourceId> {
        let counter = self.inner.local_counter.fetch_add(1, Ordering::SeqCst) + 1;
        ResourceId::local(root, counter, self.local_tx_id())
    }

    fn send(&self, request: TxRequest) -> Result<ResponseFuture> {
        let local_tx = self.local_tx_id();
        for id in request.referenced_ids() {
            id.check_locality(local_tx)?;
        }
        let fut = self.inner.correlator.send(request)?;
        self.inner.stats.inc_requests_sent();
        Ok(fut)
    }

    fn push_pending(&self, op: PendingOp) {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(op);
    }

    /// Awaits every queued void operation; returns the first failure.
    async fn drain_pending(&self) -> Result<()> {
        let ops = std::mem::take(
            &mut *self
                .inner
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        if !ops.is_empty() {
            trace!(tx = %self.inner.name, count = ops.len(), "draining pending operations");
        }
        let mut first_err = None;
        for op in ops {
            if let Err(e) = op.await {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn await_reply<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let result = race(
            fut,
            Some(Deadline::after(self.inner.request_timeout)),
            Some(&self.inner.cancel),
        )
        .await;
        if let Err(e) = &result {
            if e.is_timeout_or_cancel() {
                self.inner.correlator.abort(e.clone());
            }
        }
        result
    }

    async fn call(&self, request: TxRequest) -> Result<TxResponse> {
        self.check_open()?;
        self.drain_pending().await?;
        let fut = self.send(request)?;
        self.await_reply(fut.single()).await
    }

    async fn call_multi(&self, request: TxRequest) -> Result<Vec<TxResponse>> {
        self.check_open()?;
        self.drain_pending().await?;
        let fut = self.send(request)?;
        self.await_reply(fut.multi()).await
    }

    fn send_void(&self, request: TxRequest) -> Result<()> {
        self.check_open()?;
        let fut = self.send(request)?;
        self.push_pending(Box::pin(async move { fut.single().await.map(|_| ()) }));
        Ok(())
    }

    fn create(&self, root: bool, make: impl FnOnce(ResourceId) -> TxRequest) -> Result<ResourceRef> {
        self.check_open()?;
        let local_id = self.next_local_id(root)?;
        let fut = self.send(make(local_id))?;
        let global_id = GlobalIdFuture::spawn(fut);
        let pending = global_id.clone();
        self.push_pending(Box::pin(async move { pending.resolve().await.map(|_| ()) }));
        Ok(ResourceRef {
            local_id,
            global_id,
        })
    }

    /// Creates a root resource.
    pub fn create_root(&self, resource_type: ResourceType) -> Result<ResourceRef> {
        self.create(true, |local_id| TxRequest::CreateRoot {
            local_id,
            resource_type,
        })
    }

    /// Creates a structural resource.
    pub fn create_struct(&self, resource_type: ResourceType, data: Option<Bytes>) -> Result<ResourceRef> {
        self.create(false, |local_id| TxRequest::CreateStruct {
            local_id,
            resource_type,
            data,
        })
    }

    /// Creates an ephemeral resource.
    pub fn create_ephemeral(&self, resource_type: ResourceType, data: Option<Bytes>) -> Result<ResourceRef> {
        self.create(false, |local_id| TxRequest::CreateEphemeral {
            local_id,
            resource_type,
            data,
        })
    }

    /// Creates a value resource. With `error_if_exists` unset, an existing
    /// equal value is reused.
    pub fn create_value(
        &self,
        resource_type: ResourceType,
        data: impl Into<Bytes>,
        error_if_exists: bool,
    ) -> Result<ResourceRef> {
        let data = data.into();
        self.create(false, |local_id| TxRequest::CreateValue {
            local_id,
            resource_type,
            data,
            error_if_exists,
        })
    }

    /// Reads a resource, with its fields when `load_fields` is set.
    pub async fn get_resource_data(
        &self,
        rid: impl Into<ResourceId>,
        load_fields: bool,
    ) -> Result<ResourceData> {
        match self
            .call(TxRequest::ResourceGet {
                resource_id: rid.into(),
                load_fields,
            })
            .await?
        {
            TxResponse::ResourceGet { resource } => Ok(resource),
            other => Err(unexpected(other)),
        }
    }

    /// Checks whether a resource exists.
    pub async fn resource_exists(&self, rid: impl Into<ResourceId>) -> Result<bool> {
        match self
            .call(TxRequest::ResourceExists {
                resource_id: rid.into(),
            })
            .await?
        {
            TxResponse::ResourceExists { exists } => Ok(exists),
            other => Err(unexpected(other)),
        }
    }

    /// Removes a resource.
    pub fn remove_resource(&self, rid: impl Into<ResourceId>) -> Result<()> {
        self.send_void(TxRequest::ResourceRemove {
            resource_id: rid.into(),
        })
    }

    /// Marks a resource as failed.
    pub fn set_resource_error(&self, rid: impl Into<ResourceId>, error: impl Into<ResourceId>) -> Result<()> {
        self.send_void(TxRequest::ResourceSetError {
            resource_id: rid.into(),
            error_id: error.into(),
        })
    }

    /// Forbids further input fields.
    pub fn lock_inputs(&self, rid: impl Into<ResourceId>) -> Result<()> {
        self.send_void(TxRequest::LockInputs {
            resource_id: rid.into(),
        })
    }

    /// Forbids further output fields.
    pub fn lock_outputs(&self, rid: impl Into<ResourceId>) -> Result<()> {
        self.send_void(TxRequest::LockOutputs {
            resource_id: rid.into(),
        })
    }

    /// Locks both inputs and outputs.
    pub fn lock(&self, rid: impl Into<ResourceId>) -> Result<()> {
        let rid = rid.into();
        self.lock_inputs(rid)?;
        self.lock_outputs(rid)
    }

    /// Resolves `name`, failing with `NotFound` when it is unbound.
    pub async fn get_resource_by_name(&self, name: &str) -> Result<ResourceId> {
        match self.call(TxRequest::NameGet { name: name.to_string() }).await? {
            TxResponse::NameGet { resource_id } => Ok(resource_id),
            other => Err(unexpected(other)),
        }
    }

    /// Checks whether `name` is bound.
    pub async fn check_resource_name_exists(&self, name: &str) -> Result<bool> {
        match self
            .call(TxRequest::NameExists { name: name.to_string() })
            .await?
        {
            TxResponse::NameExists { exists } => Ok(exists),
            other => Err(unexpected(other)),
        }
    }

    /// Binds `name` to a resource.
    pub fn set_resource_name(&self, name: &str, rid: impl Into<ResourceId>) -> Result<()> {
        self.send_void(TxRequest::NameSet {
            name: name.to_string(),
            resource_id: rid.into(),
        })
    }

    /// Unbinds `name`.
    pub fn delete_resource_name(&self, name: &str) -> Result<()> {
        self.send_void(TxRequest::NameDelete {
            name: name.to_string(),
        })
    }

    /// Creates a field.
    pub fn create_field(&self, field: FieldId, field_type: FieldType) -> Result<()> {
        self.send_void(TxRequest::FieldCreate { field, field_type })
    }

    /// Checks whether a field exists.
    pub async fn field_exists(&self, field: FieldId) -> Result<bool> {
        match self.call(TxRequest::FieldExists { field }).await? {
            TxResponse::FieldExists { exists } => Ok(exists),
            other => Err(unexpected(other)),
        }
    }

    /// Assigns a field value.
    pub fn set_field(&self, field: FieldId, value: impl Into<ResourceId>) -> Result<()> {
        self.send_void(TxRequest::FieldSet {
            field,
            value: value.into(),
        })
    }

    /// Assigns a field error.
    pub fn set_field_error(&self, field: FieldId, error: impl Into<ResourceId>) -> Result<()> {
        self.send_void(TxRequest::FieldSetError {
            field,
            error_id: error.into(),
        })
    }

    /// Reads one field.
    pub async fn get_field(&self, field: FieldId) -> Result<FieldData> {
        match self.call(TxRequest::FieldGet { field }).await? {
            TxResponse::FieldGet { field } => Ok(field),
            other => Err(unexpected(other)),
        }
    }

    /// Clears an assigned field.
    pub fn reset_field(&self, field: FieldId) -> Result<()> {
        self.send_void(TxRequest::FieldReset { field })
    }

    /// Removes a field.
    pub fn remove_field(&self, field: FieldId) -> Result<()> {
        self.send_void(TxRequest::FieldRemove { field })
    }

    /// All fields of a resource, in server order.
    pub async fn list_fields(&self, rid: impl Into<ResourceId>) -> Result<Vec<FieldData>> {
        self.call_multi(TxRequest::FieldList {
            resource_id: rid.into(),
        })
        .await?
        .into_iter()
        .map(|resp| match resp {
            TxResponse::FieldList { field } => Ok(field),
            other => Err(unexpected(other)),
        })
        .collect()
    }

    /// Stores a key-value entry.
    pub fn set_kv(&self, rid: impl Into<ResourceId>, key: &str, value: impl Into<Bytes>) -> Result<()> {
        self.send_void(TxRequest::KvSet {
            resource_id: rid.into(),
            key: key.to_string(),
            value: value.into(),
        })
    }

    /// Stores `value` as JSON.
    pub fn set_kv_json<T: Serialize>(&self, rid: impl Into<ResourceId>, key: &str, value: &T) -> Result<()> {
        let encoded = serde_json::to_vec(value)?;
        self.set_kv(rid, key, encoded)
    }

    /// Reads an entry, failing with `NotFound` when it is absent.
    pub async fn get_kv(&self, rid: impl Into<ResourceId>, key: &str) -> Result<Bytes> {
        match self
            .call(TxRequest::KvGet {
                resource_id: rid.into(),
                key: key.to_string(),
            })
            .await?
        {
            TxResponse::KvGet { value } => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    /// Reads an entry as UTF-8 text.
    pub async fn get_kv_string(&self, rid: impl Into<ResourceId>, key: &str) -> Result<String> {
        let raw = self.get_kv(rid, key).await?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| GraphError::SerializationError(format!("value of '{key}' is not utf-8: {e}")))
    }

    /// Reads an entry stored with [`set_kv_json`](Self::set_kv_json).
    pub async fn get_kv_json<T: DeserializeOwned>(&self, rid: impl Into<ResourceId>, key: &str) -> Result<T> {
        let raw = self.get_kv(rid, key).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Reads an entry, `None` when it is absent.
    pub async fn get_kv_if_exists(&self, rid: impl Into<ResourceId>, key: &str) -> Result<Option<Bytes>> {
        match self
            .call(TxRequest::KvGetIfExists {
                resource_id: rid.into(),
                key: key.to_string(),
            })
            .await?
        {
            TxResponse::KvGetIfExists { value } => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    /// Deletes an entry.
    pub fn delete_kv(&self, rid: impl Into<ResourceId>, key: &str) -> Result<()> {
        self.send_void(TxRequest::KvDelete {
            resource_id: rid.into(),
            key: key.to_string(),
        })
    }

    /// All entries of a resource.
    pub async fn list_kv(&self, rid: impl Into<ResourceId>) -> Result<Vec<KeyValue>> {
        self.call_multi(TxRequest::KvList {
            resource_id: rid.into(),
        })
        .await?
        .into_iter()
        .map(|resp| match resp {
            TxResponse::KvList { entry } => Ok(entry),
            other => Err(unexpected(other)),
        })
        .collect()
    }

    /// Field that will hold the value of `field_name` on `rid` once that
    /// resource gets one. `rid` may not exist yet; no round trip is needed.
    pub fn get_future_field_value(
        &self,
        rid: impl Into<ResourceId>,
        field_name: &str,
        field_type: FieldType,
    ) -> Result<FieldId> {
        let data = serde_json::to_vec(&serde_json::json!({
            "fieldName": field_name,
            "fieldType": field_type,
        }))?;
        let (name, version) = GET_FIELD_RESOURCE_TYPE;
        let getter = self.create_ephemeral(ResourceType::new(name, version), Some(Bytes::from(data)))?;
        self.set_field(FieldId::new(getter.local_id, "resource"), rid)?;
        Ok(FieldId::new(getter.local_id, "result"))
    }

    fn begin_completion(&self) -> bool {
        !self.inner.finished.swap(true, Ordering::SeqCst)
    }

    /// Commits a writable transaction. A read-only commit only closes the stream.
    pub async fn commit(&self) -> Result<()> {
        if !self.begin_completion() {
            debug!(tx = %self.inner.name, "commit on completed transaction ignored");
            return Ok(());
        }
        if !self.inner.writable {
            self.inner.correlator.complete();
            return self.drain_pending().await;
        }

        let commit = self.send(TxRequest::TxCommit)?;
        self.inner.correlator.complete();
        self.drain_pending().await?;
        match self.await_reply(commit.single()).await? {
            TxResponse::TxCommit { success: true } => {
                self.inner.stats.inc_tx_committed();
                debug!(tx = %self.inner.name, global_tx_id = self.inner.global_tx_id, "transaction committed");
                Ok(())
            }
            TxResponse::TxCommit { success: false } => {
                self.inner.stats.inc_commit_conflicts();
                debug!(tx = %self.inner.name, global_tx_id = self.inner.global_tx_id, "commit conflict");
                Err(GraphError::TxCommitConflict {
                    tx_name: self.inner.name.clone(),
                })
            }
            other => Err(unexpected(other)),
        }
    }

    /// Ends the transaction without applying anything.
    pub async fn discard(&self) -> Result<()> {
        if !self.begin_completion() {
            debug!(tx = %self.inner.name, "discard on completed transaction ignored");
            return Ok(());
        }
        if !self.inner.writable {
            self.inner.correlator.complete();
            return self.drain_pending().await;
        }

        let discard = self.send(TxRequest::TxDiscard)?;
        self.inner.correlator.complete();
        self.drain_pending().await?;
        match self.await_reply(discard.single()).await? {
            TxResponse::TxDiscard => {
                self.inner.stats.inc_tx_discarded();
                debug!(tx = %self.inner.name, "transaction discarded");
                Ok(())
            }
            other => Err(unexpected(other)),
        }
    }

    /// Marks the session done and half-closes the stream.
    pub fn complete(&self) {
        self.inner.finished.store(true, Ordering::SeqCst);
        self.inner.correlator.complete();
    }

    /// Resolves once the stream is fully torn down.
    pub async fn finished(&self) -> Result<()> {
        self.inner.correlator.finished().await
    }

    /// Fails the transaction locally. Pending and later requests resolve
    /// with [`GraphError::Aborted`].
    pub fn abort(&self, cause: GraphError) {
        self.inner.finished.store(true, Ordering::SeqCst);
        self.inner.correlator.abort(cause);
    }
}

impl std::fmt::Debug for TransactionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionSession")
            .field("name", &self.inner.name)
            .field("writable", &self.inner.writable)
            .field("local_tx_id", &self.local_tx_id())
            .field("global_tx_id", &self.inner.global_tx_id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

fn unexpected(resp: TxResponse) -> GraphError {
    GraphError::protocol(format!("unexpected response {:?}", resp.kind()))
}
