//! Request/response correlation over one framed connection.
//!
//! [`Correlator`] owns the pending-request table.  Nothing else mutates it:
//! the supervisor goes through [`Correlator::attach`] and
//! [`Correlator::flush`], the inbound pump through
//! [`Correlator::handle_response`].
//!
//! ```text
//! call(method) ──▶ register id ──▶ send frame ──▶ wait(timeout)
//!                                                  ├─ response  → Ok / Err(kind)
//!                                                  ├─ timeout   → retry with a new id
//!                                                  │              or fail (E_NOT_READY)
//!                                                  │              or escalate (fatal)
//!                                                  └─ flush     → Err(connection reset)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;

use super::error::RpcError;
use super::message::{Message, Request, RequestId, Response};
use super::methods::{CallPolicy, MethodTable};
use super::transport::FrameWriter;

type Outcome = Result<Value, RpcError>;

// ---------------------------------------------------------------------------
// RpcCaller trait
// ---------------------------------------------------------------------------

/// The seam business logic calls through.  [`Correlator`] is the production
/// implementation; tests substitute a mock.
#[async_trait]
pub trait RpcCaller: Send + Sync {
    /// Call `method` with the catalog policy for it.
    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError>;
}

// ---------------------------------------------------------------------------
// RpcEvent
// ---------------------------------------------------------------------------

/// Out-of-band signals for whoever supervises the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcEvent {
    /// A fatal-on-timeout method timed out; the worker should be treated as
    /// unhealthy and the session moved to `error`.
    FatalTimeout { method: String },
    /// Pending requests were rejected because the connection went away.
    Flushed { rejected: usize },
}

// ---------------------------------------------------------------------------
// PendingRequest
// ---------------------------------------------------------------------------

struct PendingRequest {
    method: String,
    sent_at: Instant,
    timeout: Duration,
    retries_remaining: u32,
    tx: oneshot::Sender<Outcome>,
}

/// Read-only view of one in-flight request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInfo {
    pub id: RequestId,
    pub method: String,
    pub timeout: Duration,
    pub retries_remaining: u32,
}

// ---------------------------------------------------------------------------
// Correlator
// ---------------------------------------------------------------------------

pub struct Correlator {
    next_id: AtomicI64,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
    writer: Mutex<Option<FrameWriter>>,
    methods: MethodTable,
    events: broadcast::Sender<RpcEvent>,
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("pending", &self.pending_len())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Correlator {
    pub fn new(methods: MethodTable) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            next_id: AtomicI64::new(1),
            pending: Mutex::new(HashMap::new()),
            writer: Mutex::new(None),
            methods,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RpcEvent> {
        self.events.subscribe()
    }

    pub fn methods(&self) -> &MethodTable {
        &self.methods
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<RequestId, PendingRequest>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_writer(&self) -> MutexGuard<'_, Option<FrameWriter>> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Route outgoing frames to a freshly started worker.
    pub fn attach(&self, writer: FrameWriter) {
        *self.lock_writer() = Some(writer);
    }

    pub fn is_connected(&self) -> bool {
        self.lock_writer()
            .as_ref()
            .is_some_and(|w| !w.is_closed())
    }

    /// Detach the current connection and reject every pending request with
    /// `E_INTERNAL` "connection reset".  Returns how many were rejected.
    ///
    /// After this returns no response for a pre-flush request can be
    /// delivered: the ids are gone from the table.
    pub async fn flush(&self) -> usize {
        let writer = self.lock_writer().take();
        let drained: Vec<_> = self.lock_pending().drain().collect();

        let rejected = drained.len();
        for (id, pending) in drained {
            log::debug!("rpc: rejecting pending {} (id {id})", pending.method);
            let _ = pending.tx.send(Err(RpcError::connection_reset()));
        }
        if let Some(writer) = writer {
            writer.close().await;
        }

        if rejected > 0 {
            log::warn!("rpc: connection reset, rejected {rejected} pending request(s)");
        }
        let _ = self.events.send(RpcEvent::Flushed { rejected });
        rejected
    }

    pub fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }

    pub fn pending(&self) -> Vec<PendingInfo> {
        self.lock_pending()
            .iter()
            .map(|(id, p)| PendingInfo {
                id: id.clone(),
                method: p.method.clone(),
                timeout: p.timeout,
                retries_remaining: p.retries_remaining,
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------------

    /// Call with an explicit policy instead of the catalog one.
    pub async fn call_with(
        &self,
        method: &str,
        params: Option<Value>,
        policy: CallPolicy,
    ) -> Result<Value, RpcError> {
        let max_retries = if policy.fatal_on_timeout { 0 } else { policy.max_retries };
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let retries_remaining = max_retries + 1 - attempt;
            let (id, rx) = self.register(method, policy.timeout, retries_remaining);

            let Some(writer) = self.lock_writer().clone() else {
                self.lock_pending().remove(&id);
                return Err(detached(attempt));
            };

            let frame = Message::Request(Request {
                id: id.clone(),
                method: method.to_string(),
                params: params.clone(),
            })
            .to_value();

            if let Err(e) = writer.send(&frame).await {
                log::warn!("rpc: failed to send {method} (id {id}): {e}");
                self.lock_pending().remove(&id);
                return Err(RpcError::connection_reset());
            }
            log::debug!("rpc: → {method} (id {id}, attempt {attempt})");

            match tokio::time::timeout(policy.timeout, rx).await {
                Ok(Ok(outcome)) => return outcome,
                Ok(Err(_)) => return Err(RpcError::connection_reset()),
                Err(_) => {
                    self.lock_pending().remove(&id);

                    if policy.fatal_on_timeout {
                        log::error!(
                            "rpc: {method} timed out after {:?}, escalating",
                            policy.timeout
                        );
                        let _ = self.events.send(RpcEvent::FatalTimeout {
                            method: method.to_string(),
                        });
                        return Err(RpcError::timeout(method, attempt, true));
                    }
                    if attempt > max_retries {
                        log::warn!("rpc: {method} timed out after {attempt} attempt(s)");
                        return Err(RpcError::timeout(method, attempt, false));
                    }
                    log::debug!("rpc: {method} (id {id}) timed out, retrying");
                }
            }
        }
    }

    fn register(
        &self,
        method: &str,
        timeout: Duration,
        retries_remaining: u32,
    ) -> (RequestId, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.lock_pending();
        let id = loop {
            let candidate = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
            if !pending.contains_key(&candidate) {
                break candidate;
            }
        };
        pending.insert(
            id.clone(),
            PendingRequest {
                method: method.to_string(),
                sent_at: Instant::now(),
                timeout,
                retries_remaining,
                tx,
            },
        );
        (id, rx)
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Resolve the waiter for `response.id`.  Returns `false` when no such
    /// request is pending (late reply after a timeout or a flush).
    pub fn handle_response(&self, response: Response) -> bool {
        let Some(pending) = self.lock_pending().remove(&response.id) else {
            log::debug!("rpc: dropping response for unknown id {}", response.id);
            return false;
        };

        log::debug!(
            "rpc: ← {} (id {}) in {:?}",
            pending.method,
            response.id,
            pending.sent_at.elapsed()
        );
        let _ = pending.tx.send(response.outcome);
        true
    }

    /// Answer a worker-initiated request.
    pub async fn reply(&self, id: RequestId, outcome: Result<Value, RpcError>) {
        let Some(writer) = self.lock_writer().clone() else {
            return;
        };
        let frame = Message::Response(Response { id, outcome }).to_value();
        if let Err(e) = writer.send(&frame).await {
            log::warn!("rpc: failed to send reply: {e}");
        }
    }
}

/// Error for a call that finds no connection.  A retry that lost its
/// connection to a flush reports the same reset as the flushed attempts.
fn detached(attempt: u32) -> RpcError {
    if attempt > 1 {
        RpcError::connection_reset()
    } else {
        RpcError::not_connected()
    }
}

#[async_trait]
impl RpcCaller for Correlator {
    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        let policy = self.methods.policy(method);
        self.call_with(method, params, policy).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::rpc::error::ErrorKind;
    use crate::rpc::transport::{FrameReader, TransportEvent};
    use serde_json::json;
    use tokio::io::{duplex, DuplexStream};

    /// Correlator wired to an in-memory pipe; the returned reader sees what
    /// the worker would see.
    fn connected() -> (Arc<Correlator>, FrameReader<DuplexStream>, FrameWriterPeer) {
        let (host_out, worker_in) = duplex(64 * 1024);
        let (worker_out, host_in) = duplex(64 * 1024);
        let correlator = Arc::new(Correlator::new(MethodTable::default()));
        correlator.attach(FrameWriter::new(host_out));
        (
            correlator,
            FrameReader::new(worker_in),
            FrameWriterPeer {
                writer: FrameWriter::new(worker_out),
                reader: FrameReader::new(host_in),
            },
        )
    }

    /// The worker's outbound half plus the host's inbound reader.
    struct FrameWriterPeer {
        writer: FrameWriter,
        reader: FrameReader<DuplexStream>,
    }

    impl FrameWriterPeer {
        /// Send a frame from the worker and route it into the correlator.
        async fn respond(&mut self, correlator: &Correlator, value: Value) {
            self.writer.send(&value).await.unwrap();
            let Some(Ok(TransportEvent::Frame(frame))) = self.reader.next().await else {
                panic!("expected a frame");
            };
            let Message::Response(resp) = Message::classify(frame).unwrap() else {
                panic!("expected a response");
            };
            correlator.handle_response(resp);
        }
    }

    async fn next_request(reader: &mut FrameReader<DuplexStream>) -> Request {
        match reader.next().await {
            Some(Ok(TransportEvent::Frame(v))) => match Message::classify(v).unwrap() {
                Message::Request(req) => req,
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn resolves_matching_response() {
        let (correlator, mut worker_rx, mut worker) = connected();

        let c = Arc::clone(&correlator);
        let call = tokio::spawn(async move { c.call("system.info", None).await });

        let req = next_request(&mut worker_rx).await;
        assert_eq!(req.method, "system.info");
        worker
            .respond(&correlator, json!({"id": req.id, "result": {"version": "1.0"}}))
            .await;

        assert_eq!(call.await.unwrap().unwrap(), json!({"version": "1.0"}));
        assert_eq!(correlator.pending_len(), 0);
    }

    #[tokio::test]
    async fn concurrent_calls_answered_in_reverse_are_not_cross_wired() {
        let (correlator, mut worker_rx, mut worker) = connected();

        let mut calls = Vec::new();
        for n in 0..5 {
            let c = Arc::clone(&correlator);
            calls.push(tokio::spawn(async move {
                let out = c.call("audio.set_device", Some(json!({"n": n}))).await;
                (n, out)
            }));
        }

        let mut requests = Vec::new();
        for _ in 0..5 {
            requests.push(next_request(&mut worker_rx).await);
        }
        for req in requests.into_iter().rev() {
            let n = req.params.as_ref().unwrap()["n"].clone();
            worker
                .respond(&correlator, json!({"id": req.id, "result": {"echo": n}}))
                .await;
        }

        for call in calls {
            let (n, out) = call.await.unwrap();
            assert_eq!(out.unwrap(), json!({"echo": n}));
        }
    }

    #[tokio::test]
    async fn error_response_carries_kind() {
        let (correlator, mut worker_rx, mut worker) = connected();

        let c = Arc::clone(&correlator);
        let call = tokio::spawn(async move { c.call("recording.start", None).await });

        let req = next_request(&mut worker_rx).await;
        worker
            .respond(
                &correlator,
                json!({"id": req.id, "error": {"code": -32002, "message": "denied"}}),
            )
            .await;

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::MicPermission);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_retries_then_fails_after_three_attempts() {
        let (correlator, mut worker_rx, _worker) = connected();

        let seen = tokio::spawn(async move {
            let mut ids = Vec::new();
            while let Some(Ok(TransportEvent::Frame(v))) = worker_rx.next().await {
                ids.push(v["id"].clone());
            }
            ids
        });

        let started = Instant::now();
        let err = correlator
            .call_with(
                "system.ping",
                None,
                CallPolicy::new(Duration::from_millis(100), 2),
            )
            .await
            .unwrap_err();

        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(err.is_timeout());
        assert_eq!(err.kind, ErrorKind::NotReady);
        assert_eq!(err.details.as_ref().unwrap()["attempts"], json!(3));
        assert_eq!(correlator.pending_len(), 0);

        correlator.flush().await;
        let ids = seen.await.unwrap();
        assert_eq!(ids.len(), 3);
        // Every retry goes out under a fresh id.
        assert!(ids[0] != ids[1] && ids[1] != ids[2]);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_timeout_never_retries_and_escalates() {
        let (correlator, mut worker_rx, _worker) = connected();
        let mut events = correlator.subscribe();

        let seen = tokio::spawn(async move {
            let mut count = 0;
            while let Some(Ok(_)) = worker_rx.next().await {
                count += 1;
            }
            count
        });

        let err = correlator
            .call_with("asr.initialize", None, CallPolicy::fatal(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(err.is_fatal_timeout());
        assert_eq!(
            events.recv().await.unwrap(),
            RpcEvent::FatalTimeout {
                method: "asr.initialize".into()
            }
        );

        correlator.flush().await;
        assert_eq!(seen.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn flush_rejects_pending_with_connection_reset() {
        let (correlator, mut worker_rx, _worker) = connected();

        let c = Arc::clone(&correlator);
        let call = tokio::spawn(async move { c.call("recording.stop", None).await });
        let req = next_request(&mut worker_rx).await;

        assert_eq!(correlator.pending().len(), 1);
        assert_eq!(correlator.flush().await, 1);

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
        assert_eq!(err.message, "connection reset");

        // A late response for the flushed id is ignored.
        assert!(!correlator.handle_response(Response {
            id: req.id,
            outcome: Ok(json!(true)),
        }));
        assert!(!correlator.is_connected());
    }

    #[test]
    fn retry_after_flush_reports_connection_reset() {
        assert_eq!(detached(1).kind, ErrorKind::NotReady);
        let err = detached(2);
        assert_eq!(err.kind, ErrorKind::Internal);
        assert_eq!(err.message, "connection reset");
    }

    #[tokio::test]
    async fn call_without_connection_fails_fast() {
        let correlator = Correlator::new(MethodTable::default());
        let err = correlator.call("system.ping", None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotReady);
        assert_eq!(correlator.pending_len(), 0);
    }
}
