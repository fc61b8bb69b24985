//! Request/response correlation over a single transaction stream.
//!
//! Each transaction owns one duplex stream and one background reader task.
//! Responses carry no routing information beyond the echoed request id, so
//! handlers are matched strictly in send order: the server must answer
//! requests in the order it received them.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::auth::StatusObserver;
use crate::error::{GraphError, Result};
use crate::message::{ClientMessage, ResponseKind, ServerMessage, TxRequest, TxResponse};
use crate::transport::{TransportStatus, TxStreamParts};

/// Resolved value of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Response to a single-message request.
    Single(TxResponse),
    /// All entries of a multi-message response, in order.
    Multi(Vec<TxResponse>),
}

/// Pending result of one request sent through a [`MessageCorrelator`].
#[derive(Debug)]
pub struct ResponseFuture {
    request_id: u32,
    kind: ResponseKind,
    receiver: oneshot::Receiver<Result<Reply>>,
}

impl ResponseFuture {
    /// Id the request was sent with.
    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    /// Kind of response this request expects.
    pub fn kind(&self) -> ResponseKind {
        self.kind
    }

    /// Waits for the reply, whatever its shape.
    pub async fn recv(self) -> Result<Reply> {
        self.receiver
            .await
            .map_err(|_| GraphError::TransactionClosed)?
    }

    /// Waits for a single-message response.
    pub async fn single(self) -> Result<TxResponse> {
        let request_id = self.request_id;
        match self.recv().await? {
            Reply::Single(resp) => Ok(resp),
            Reply::Multi(parts) if parts.is_empty() => Err(GraphError::protocol(format!(
                "empty response to request {request_id}"
            ))),
            Reply::Multi(_) => Err(GraphError::protocol("expected a single response")),
        }
    }

    /// Waits for the full multi-message response.
    pub async fn multi(self) -> Result<Vec<TxResponse>> {
        match self.recv().await? {
            Reply::Multi(parts) => Ok(parts),
            Reply::Single(_) => Err(GraphError::protocol("expected a multi-message response")),
        }
    }
}

struct Handler {
    request_id: u32,
    kind: ResponseKind,
    expect_multi: bool,
    parts: Vec<TxResponse>,
    parts_seen: u32,
    reply: oneshot::Sender<Result<Reply>>,
}

impl Handler {
    fn resolve(self, reply: Reply) {
        let _ = self.reply.send(Ok(reply));
    }

    fn reject(self, err: GraphError) {
        let _ = self.reply.send(Err(err));
    }
}

struct State {
    next_request_id: u32,
    handlers: VecDeque<Handler>,
    outbound: Option<mpsc::UnboundedSender<ClientMessage>>,
    /// Error every later send fails with once the session is dead.
    terminal: Option<GraphError>,
}

struct Shared {
    name: String,
    state: Mutex<State>,
    finished: watch::Sender<Option<Result<()>>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Routes one inbound message. An `Err` is fatal for the session.
    fn dispatch(&self, msg: ServerMessage) -> Result<()> {
        let mut state = self.lock();
        let handler = match state.handlers.front_mut() {
            Some(h) => h,
            None => {
                return Err(GraphError::OrphanMessage {
                    request_id: msg.request_id,
                })
            }
        };

        if msg.request_id != handler.request_id {
            return Err(GraphError::OutOfOrderMessage {
                expected: handler.request_id,
                got: msg.request_id,
            });
        }
        if msg.kind != handler.kind {
            return Err(GraphError::ResponseKindMismatch {
                expected: handler.kind,
                got: msg.kind,
            });
        }
        if let Some(body) = &msg.body {
            if body.kind() != handler.kind {
                return Err(GraphError::ResponseKindMismatch {
                    expected: handler.kind,
                    got: body.kind(),
                });
            }
        }

        if let Some(error) = msg.error {
            if msg.multi.is_none() && handler.parts_seen > 0 {
                return Err(GraphError::protocol(format!(
                    "bare error after {} parts of multi-message response to request {}: {}",
                    handler.parts_seen, msg.request_id, error
                )));
            }
            if matches!(msg.multi, Some(info) if !info.is_last) {
                return Err(GraphError::protocol(format!(
                    "error inside multi-message response to request {}: {}",
                    msg.request_id, error
                )));
            }
            let recoverable = error.is_recoverable();
            if let Some(handler) = state.handlers.pop_front() {
                trace!(tx = %self.name, request_id = handler.request_id, %error, recoverable, "request failed");
                handler.reject(GraphError::Server(error.clone()));
            }
            return if recoverable {
                Ok(())
            } else {
                Err(GraphError::Server(error))
            };
        }

        match (msg.multi, handler.expect_multi) {
            (None, true) => Err(GraphError::protocol(format!(
                "expected multi-message response to request {}",
                msg.request_id
            ))),
            // An empty terminator still answers a single-response request.
            (Some(info), false) if info.is_empty && info.is_last => {
                if info.id != 1 {
                    return Err(GraphError::InconsistentMultiId {
                        expected: 1,
                        got: info.id,
                    });
                }
                let reply = match handler.kind.empty_response() {
                    Some(body) => Reply::Single(body),
                    None => Reply::Multi(Vec::new()),
                };
                if let Some(handler) = state.handlers.pop_front() {
                    handler.resolve(reply);
                }
                Ok(())
            }
            (Some(_), false) => Err(GraphError::protocol(format!(
                "unexpected multi-message response to request {}",
                msg.request_id
            ))),
            (None, false) => {
                let body = msg.body.ok_or_else(|| {
                    GraphError::protocol(format!("empty response to request {}", msg.request_id))
                })?;
                if let Some(handler) = state.handlers.pop_front() {
                    handler.resolve(Reply::Single(body));
                }
                Ok(())
            }
            (Some(info), true) => {
                let expected = handler.parts_seen + 1;
                if info.id != expected {
                    return Err(GraphError::InconsistentMultiId {
                        expected,
                        got: info.id,
                    });
                }
                handler.parts_seen = expected;
                if !info.is_empty {
                    let body = msg.body.ok_or_else(|| {
                        GraphError::protocol(format!(
                            "multi-message part {} of request {} has no body",
                            info.id, msg.request_id
                        ))
                    })?;
                    handler.parts.push(body);
                }
                if info.is_last {
                    if let Some(mut handler) = state.handlers.pop_front() {
                        let parts = std::mem::take(&mut handler.parts);
                        handler.resolve(Reply::Multi(parts));
                    }
                }
                Ok(())
            }
        }
    }

    fn on_stream_end(&self) -> Result<()> {
        let pending = self.lock().handlers.len();
        if pending == 0 {
            Ok(())
        } else {
            Err(GraphError::UnexpectedStreamEnd { pending })
        }
    }

    /// Kills the session: queued handlers and later sends fail with the wrapped cause.
    fn fail(&self, cause: GraphError) {
        let mut state = self.lock();
        let terminal = state
            .terminal
            .get_or_insert_with(|| GraphError::session_closed(cause))
            .clone();
        state.outbound = None;
        for handler in state.handlers.drain(..) {
            handler.reject(terminal.clone());
        }
    }
}

/// Per-transaction duplex multiplexer.
pub struct MessageCorrelator {
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl MessageCorrelator {
    /// Takes ownership of a freshly opened stream and spawns its reader task.
    pub fn start(
        name: &str,
        parts: TxStreamParts,
        cancel: CancellationToken,
        observer: Option<Arc<dyn StatusObserver>>,
    ) -> Self {
        let (finished, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            name: name.to_string(),
            state: Mutex::new(State {
                next_request_id: 0,
                handlers: VecDeque::new(),
                outbound: Some(parts.outbound),
                terminal: None,
            }),
            finished,
        });

        tokio::spawn(run_inbound(
            shared.clone(),
            parts.inbound,
            cancel.clone(),
            observer,
        ));

        Self { shared, cancel }
    }

    /// Queues a handler and transmits the request with the next sequence number.
    pub fn send(&self, request: TxRequest) -> Result<ResponseFuture> {
        let kind = request.expected_response();
        let expect_multi = request.is_multi();
        let mut state = self.shared.lock();

        if let Some(err) = &state.terminal {
            return Err(err.clone());
        }
        let request_id = state.next_request_id;
        let (reply, receiver) = oneshot::channel();
        state.handlers.push_back(Handler {
            request_id,
            kind,
            expect_multi,
            parts: Vec::new(),
            parts_seen: 0,
            reply,
        });

        let sent = match &state.outbound {
            Some(outbound) => outbound.send(ClientMessage {
                request_id,
                request,
            }),
            None => {
                state.handlers.pop_back();
                return Err(GraphError::TransactionClosed);
            }
        };
        if sent.is_err() {
            state.handlers.pop_back();
            return Err(GraphError::TransactionClosed);
        }
        state.next_request_id = request_id.wrapping_add(1);
        trace!(tx = %self.shared.name, request_id, ?kind, "request sent");

        Ok(ResponseFuture {
            request_id,
            kind,
            receiver,
        })
    }

    /// Half-closes the outbound direction. Safe to call more than once.
    pub fn complete(&self) {
        if self.shared.lock().outbound.take().is_some() {
            debug!(tx = %self.shared.name, "outbound stream half-closed");
        }
    }

    /// Cancels the stream; pending and later operations fail with a wrapped abort error.
    pub fn abort(&self, cause: GraphError) {
        {
            let mut state = self.shared.lock();
            let terminal = state
                .terminal
                .get_or_insert_with(|| GraphError::aborted(cause))
                .clone();
            state.outbound = None;
            for handler in state.handlers.drain(..) {
                handler.reject(terminal.clone());
            }
        }
        warn!(tx = %self.shared.name, "transaction stream aborted");
        self.cancel.cancel();
    }

    /// Resolves once the reader task has terminated, re-raising its error if any.
    pub async fn finished(&self) -> Result<()> {
        let mut rx = self.shared.finished.subscribe();
        let outcome = rx
            .wait_for(|v| v.is_some())
            .await
            .map_err(|_| GraphError::TransactionClosed)?;
        outcome.clone().unwrap_or(Ok(()))
    }

    /// True once the stream failed or the send half was closed.
    pub fn is_closed(&self) -> bool {
        let state = self.shared.lock();
        state.terminal.is_some() || state.outbound.is_none()
    }

    /// Number of requests still waiting for a reply.
    pub fn pending(&self) -> usize {
        self.shared.lock().handlers.len()
    }
}

impl Drop for MessageCorrelator {
    fn drop(&mut self) {
        self.complete();
    }
}

impl std::fmt::Debug for MessageCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageCorrelator")
            .field("name", &self.shared.name)
            .field("pending", &self.pending())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn run_inbound(
    shared: Arc<Shared>,
    mut inbound: mpsc::UnboundedReceiver<std::result::Result<ServerMessage, TransportStatus>>,
    cancel: CancellationToken,
    observer: Option<Arc<dyn StatusObserver>>,
) {
    let result = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                let terminal = shared.lock().terminal.clone();
                break Err(terminal.unwrap_or(GraphError::Cancelled));
            }
            next = inbound.recv() => next,
        };
        match next {
            None => break shared.on_stream_end(),
            Some(Err(status)) => {
                if let Some(observer) = &observer {
                    observer.observe_failure(&status);
                }
                break Err(GraphError::from(status));
            }
            Some(Ok(msg)) => {
                if let Some(observer) = &observer {
                    observer.observe_ok();
                }
                if let Err(e) = shared.dispatch(msg) {
                    break Err(e);
                }
            }
        }
    };

    match &result {
        Ok(()) => debug!(tx = %shared.name, "transaction stream finished"),
        Err(e) => {
            debug!(tx = %shared.name, error = %e, "transaction stream failed");
            shared.fail(e.clone());
        }
    }
    shared.lock().outbound = None;
    shared.finished.send_replace(Some(result));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ErrorCode, ServerError};
    use crate::model::KeyValue;
    use crate::resource_id::ResourceId;
    use crate::transport::StatusCode;
    use bytes::Bytes;
    use proptest::prelude::*;

    type Inbound = mpsc::UnboundedSender<std::result::Result<ServerMessage, TransportStatus>>;

    fn harness() -> (MessageCorrelator, mpsc::UnboundedReceiver<ClientMessage>, Inbound) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let parts = TxStreamParts {
            outbound: out_tx,
            inbound: in_rx,
        };
        let corr = MessageCorrelator::start("test", parts, CancellationToken::new(), None);
        (corr, out_rx, in_tx)
    }

    fn rid(n: u64) -> ResourceId {
        ResourceId::global(false, n).unwrap()
    }

    fn exists_req(n: u64) -> TxRequest {
        TxRequest::ResourceExists { resource_id: rid(n) }
    }

    fn kv_list_req() -> TxRequest {
        TxRequest::KvList { resource_id: rid(1) }
    }

    fn kv(key: &str) -> TxResponse {
        TxResponse::KvList {
            entry: KeyValue {
                key: key.to_string(),
                value: Bytes::from_static(b"v"),
            },
        }
    }

    #[tokio::test]
    async fn test_single_response() {
        let (corr, mut out, inbound) = harness();
        let fut = corr.send(exists_req(1)).unwrap();
        let sent = out.recv().await.unwrap();
        assert_eq!(sent.request_id, 0);

        inbound
            .send(Ok(ServerMessage::reply(0, TxResponse::ResourceExists { exists: true })))
            .unwrap();
        assert_eq!(
            fut.single().await.unwrap(),
            TxResponse::ResourceExists { exists: true }
        );
    }

    #[tokio::test]
    async fn test_responses_follow_send_order() {
        let (corr, mut out, inbound) = harness();
        let futs: Vec<_> = (0..3).map(|i| corr.send(exists_req(i + 1)).unwrap()).collect();
        for expected in 0..3u32 {
            assert_eq!(out.recv().await.unwrap().request_id, expected);
        }
        for i in 0..3u32 {
            inbound
                .send(Ok(ServerMessage::reply(i, TxResponse::ResourceExists { exists: i == 1 })))
                .unwrap();
        }
        let results: Vec<bool> = {
            let mut v = Vec::new();
            for f in futs {
                match f.single().await.unwrap() {
                    TxResponse::ResourceExists { exists } => v.push(exists),
                    other => panic!("unexpected {other:?}"),
                }
            }
            v
        };
        assert_eq!(results, vec![false, true, false]);
    }

    #[tokio::test]
    async fn test_recoverable_error_rejects_only_current() {
        let (corr, _out, inbound) = harness();
        let first = corr.send(exists_req(1)).unwrap();
        let second = corr.send(exists_req(2)).unwrap();

        inbound
            .send(Ok(ServerMessage::error(
                0,
                ResponseKind::ResourceExists,
                ServerError::new(ErrorCode::NotFound, "missing"),
            )))
            .unwrap();
        inbound
            .send(Ok(ServerMessage::reply(1, TxResponse::ResourceExists { exists: true })))
            .unwrap();

        let err = first.single().await.unwrap_err();
        assert!(err.is_recoverable());
        assert!(second.single().await.is_ok());
        assert!(corr.send(exists_req(3)).is_ok());
    }

    #[tokio::test]
    async fn test_unrecoverable_error_closes_session() {
        let (corr, _out, inbound) = harness();
        let first = corr.send(exists_req(1)).unwrap();
        let second = corr.send(exists_req(2)).unwrap();

        inbound
            .send(Ok(ServerMessage::error(
                0,
                ResponseKind::ResourceExists,
                ServerError::new(ErrorCode::Internal, "disk on fire"),
            )))
            .unwrap();

        let err = first.single().await.unwrap_err();
        assert!(matches!(err, GraphError::Server(ref e) if e.code == ErrorCode::Internal));

        let err = second.single().await.unwrap_err();
        assert!(matches!(err, GraphError::SessionClosed { .. }));
        assert!(err.to_string().contains("disk on fire"));

        assert!(corr.finished().await.is_err());
        let err = corr.send(exists_req(3)).unwrap_err();
        assert!(matches!(err, GraphError::SessionClosed { .. }));
    }

    #[tokio::test]
    async fn test_orphan_message_is_fatal() {
        let (corr, _out, inbound) = harness();
        inbound
            .send(Ok(ServerMessage::reply(0, TxResponse::ResourceRemove)))
            .unwrap();
        let err = corr.finished().await.unwrap_err();
        assert!(matches!(err, GraphError::OrphanMessage { request_id: 0 }));
        assert!(corr.send(exists_req(1)).is_err());
    }

    #[tokio::test]
    async fn test_out_of_order_message_is_fatal() {
        let (corr, _out, inbound) = harness();
        let fut = corr.send(exists_req(1)).unwrap();
        inbound
            .send(Ok(ServerMessage::reply(5, TxResponse::ResourceExists { exists: true })))
            .unwrap();
        let err = fut.single().await.unwrap_err();
        assert!(matches!(
            err.root_cause(),
            GraphError::OutOfOrderMessage { expected: 0, got: 5 }
        ));
    }

    #[tokio::test]
    async fn test_kind_mismatch_is_fatal() {
        let (corr, _out, inbound) = harness();
        let fut = corr.send(exists_req(1)).unwrap();
        inbound
            .send(Ok(ServerMessage::reply(0, TxResponse::FieldSet)))
            .unwrap();
        let err = fut.single().await.unwrap_err();
        assert!(matches!(err.root_cause(), GraphError::ResponseKindMismatch { .. }));
        assert!(corr.finished().await.is_err());
    }

    #[tokio::test]
    async fn test_multi_message_accumulates_in_order() {
        let (corr, _out, inbound) = harness();
        let fut = corr.send(kv_list_req()).unwrap();
        inbound.send(Ok(ServerMessage::multi_part(0, kv("a"), 1, false))).unwrap();
        inbound.send(Ok(ServerMessage::multi_part(0, kv("b"), 2, false))).unwrap();
        inbound.send(Ok(ServerMessage::multi_part(0, kv("c"), 3, true))).unwrap();
        assert_eq!(fut.multi().await.unwrap(), vec![kv("a"), kv("b"), kv("c")]);
    }

    #[tokio::test]
    async fn test_multi_message_empty_terminator_dropped() {
        let (corr, _out, inbound) = harness();
        let fut = corr.send(kv_list_req()).unwrap();
        inbound.send(Ok(ServerMessage::multi_part(0, kv("a"), 1, false))).unwrap();
        inbound
            .send(Ok(ServerMessage::multi_empty(0, ResponseKind::KvList, 2)))
            .unwrap();
        assert_eq!(fut.multi().await.unwrap(), vec![kv("a")]);

        let fut = corr.send(kv_list_req()).unwrap();
        inbound
            .send(Ok(ServerMessage::multi_empty(1, ResponseKind::KvList, 1)))
            .unwrap();
        assert!(fut.multi().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_terminator_answers_single_request() {
        let (corr, _out, inbound) = harness();
        let remove = corr
            .send(TxRequest::ResourceRemove { resource_id: rid(1) })
            .unwrap();
        let exists = corr.send(exists_req(2)).unwrap();
        inbound
            .send(Ok(ServerMessage::multi_empty(0, ResponseKind::ResourceRemove, 1)))
            .unwrap();
        inbound
            .send(Ok(ServerMessage::multi_empty(1, ResponseKind::ResourceExists, 1)))
            .unwrap();

        assert_eq!(remove.single().await.unwrap(), TxResponse::ResourceRemove);
        // A value-returning request without a body fails alone.
        let err = exists.single().await.unwrap_err();
        assert!(matches!(err, GraphError::ProtocolViolation { .. }));
        assert!(!corr.is_closed());
        assert_eq!(corr.pending(), 0);

        let next = corr.send(exists_req(3)).unwrap();
        inbound
            .send(Ok(ServerMessage::reply(2, TxResponse::ResourceExists { exists: true })))
            .unwrap();
        assert!(next.single().await.is_ok());
    }

    #[tokio::test]
    async fn test_non_empty_multi_part_on_single_request_is_fatal() {
        let (corr, _out, inbound) = harness();
        let fut = corr
            .send(TxRequest::ResourceRemove { resource_id: rid(1) })
            .unwrap();
        inbound
            .send(Ok(ServerMessage::multi_part(0, TxResponse::ResourceRemove, 1, true)))
            .unwrap();
        let err = fut.single().await.unwrap_err();
        assert!(matches!(err.root_cause(), GraphError::ProtocolViolation { .. }));
        assert!(corr.finished().await.is_err());
    }

    #[tokio::test]
    async fn test_multi_message_gap_rejected() {
        let (corr, _out, inbound) = harness();
        let fut = corr.send(kv_list_req()).unwrap();
        inbound.send(Ok(ServerMessage::multi_part(0, kv("a"), 1, false))).unwrap();
        inbound.send(Ok(ServerMessage::multi_part(0, kv("c"), 3, true))).unwrap();
        let err = fut.multi().await.unwrap_err();
        assert!(matches!(
            err.root_cause(),
            GraphError::InconsistentMultiId { expected: 2, got: 3 }
        ));
    }

    #[tokio::test]
    async fn test_error_mid_multi_sequence_is_fatal() {
        let (corr, _out, inbound) = harness();
        let fut = corr.send(kv_list_req()).unwrap();
        let msg = ServerMessage::error(
            0,
            ResponseKind::KvList,
            ServerError::new(ErrorCode::NotFound, "gone"),
        )
        .with_multi(crate::message::MultiMessageInfo {
            id: 1,
            is_last: false,
            is_empty: false,
        });
        inbound.send(Ok(msg)).unwrap();
        let err = fut.multi().await.unwrap_err();
        assert!(matches!(err, GraphError::SessionClosed { .. }));
        assert!(corr.finished().await.is_err());
    }

    #[tokio::test]
    async fn test_bare_error_after_multi_parts_is_fatal() {
        let (corr, _out, inbound) = harness();
        let fut = corr.send(kv_list_req()).unwrap();
        let later = corr.send(exists_req(1)).unwrap();
        inbound.send(Ok(ServerMessage::multi_part(0, kv("a"), 1, false))).unwrap();
        inbound
            .send(Ok(ServerMessage::error(
                0,
                ResponseKind::KvList,
                ServerError::new(ErrorCode::NotFound, "gone"),
            )))
            .unwrap();
        let err = fut.multi().await.unwrap_err();
        assert!(matches!(err.root_cause(), GraphError::ProtocolViolation { .. }));
        assert!(matches!(later.single().await.unwrap_err(), GraphError::SessionClosed { .. }));
        assert!(corr.finished().await.is_err());
    }

    #[tokio::test]
    async fn test_error_on_final_multi_chunk_is_recoverable() {
        let (corr, _out, inbound) = harness();
        let fut = corr.send(kv_list_req()).unwrap();
        let msg = ServerMessage::error(
            0,
            ResponseKind::KvList,
            ServerError::new(ErrorCode::NotFound, "gone"),
        )
        .with_multi(crate::message::MultiMessageInfo {
            id: 1,
            is_last: true,
            is_empty: false,
        });
        inbound.send(Ok(msg)).unwrap();
        assert!(fut.multi().await.unwrap_err().is_recoverable());
        assert!(corr.send(exists_req(1)).is_ok());
    }

    #[tokio::test]
    async fn test_complete_is_idempotent_half_close() {
        let (corr, mut out, inbound) = harness();
        corr.complete();
        corr.complete();
        assert!(out.recv().await.is_none());
        assert!(matches!(
            corr.send(exists_req(1)).unwrap_err(),
            GraphError::TransactionClosed
        ));
        drop(inbound);
        assert!(corr.finished().await.is_ok());
    }

    #[tokio::test]
    async fn test_abort_fails_pending_and_future_ops() {
        let (corr, _out, _inbound) = harness();
        let fut = corr.send(exists_req(1)).unwrap();
        corr.abort(GraphError::Cancelled);

        let err = fut.single().await.unwrap_err();
        assert!(matches!(err, GraphError::Aborted { .. }));
        assert!(err.is_timeout_or_cancel());
        assert!(matches!(
            corr.send(exists_req(2)).unwrap_err(),
            GraphError::Aborted { .. }
        ));
        assert!(corr.finished().await.unwrap_err().is_timeout_or_cancel());
    }

    #[tokio::test]
    async fn test_stream_end_with_pending_handlers() {
        let (corr, _out, inbound) = harness();
        let fut = corr.send(exists_req(1)).unwrap();
        drop(inbound);
        let err = fut.single().await.unwrap_err();
        assert!(matches!(
            err.root_cause(),
            GraphError::UnexpectedStreamEnd { pending: 1 }
        ));
    }

    #[tokio::test]
    async fn test_transport_auth_failure() {
        let (corr, _out, inbound) = harness();
        let fut = corr.send(exists_req(1)).unwrap();
        inbound
            .send(Err(TransportStatus::new(StatusCode::Unauthenticated, "expired")))
            .unwrap();
        let err = fut.single().await.unwrap_err();
        assert!(err.is_auth_error());
    }

    proptest! {
        #[test]
        fn prop_handler_order_matches_send_order(errors in proptest::collection::vec(any::<bool>(), 1..24)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let (corr, _out, inbound) = harness();
                let futs: Vec<_> = (0..errors.len())
                    .map(|i| corr.send(exists_req(i as u64 + 1)).unwrap())
                    .collect();
                for (i, fail) in errors.iter().enumerate() {
                    let msg = if *fail {
                        ServerMessage::error(
                            i as u32,
                            ResponseKind::ResourceExists,
                            ServerError::new(ErrorCode::NotFound, &i.to_string()),
                        )
                    } else {
                        ServerMessage::reply(i as u32, TxResponse::ResourceExists { exists: i % 2 == 0 })
                    };
                    inbound.send(Ok(msg)).unwrap();
                }
                for (i, (fut, fail)) in futs.into_iter().zip(errors.iter()).enumerate() {
                    assert_eq!(fut.request_id(), i as u32);
                    match fut.single().await {
                        Ok(TxResponse::ResourceExists { exists }) => {
                            assert!(!fail);
                            assert_eq!(exists, i % 2 == 0);
                        }
                        Err(GraphError::Server(e)) => {
                            assert!(fail);
                            assert_eq!(e.message, i.to_string());
                        }
                        other => panic!("unexpected {other:?}"),
                    }
                }
            });
        }
    }
}
