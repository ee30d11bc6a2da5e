//! Service client port.

use core::fmt;
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use cyphal_dsdl::Service;
use cyphal_transport::{
    InputSession, OutputSession, Priority, ServiceId, SessionStatistics, Timestamp, Transfer,
    TransferFrom,
};
use tokio::{sync::oneshot, task::AbortHandle, time::Instant};

use crate::{
    PresentationError,
    controller::{PortImpl, PortKey, Shared, lock},
    port::{DEFAULT_PRIORITY, DEFAULT_SERVICE_REQUEST_TIMEOUT, OutgoingTransferIdCounter, RECEIVE_SLICE},
};

/// Statistical counters of a client session specifier; shared by all
/// proxies of the same service and server node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientStatistics {
    /// Counters of the request (output) transport session.
    pub request_transport_session: SessionStatistics,
    /// Counters of the response (input) transport session.
    pub response_transport_session: SessionStatistics,
    /// Requests accepted by the transport.
    pub sent_requests: u64,
    /// Requests that timed out before the transport accepted them.
    pub unsent_requests: u64,
    /// Response transfers that failed deserialization.
    pub deserialization_failures: u64,
    /// Response transfers without a matching pending request.
    pub unexpected_responses: u64,
}

/// A client proxy for one service on one server node.
///
/// Each task should obtain its own proxy from
/// [`Presentation::make_client`](crate::Presentation::make_client);
/// per-proxy settings (priority, response timeout) do not affect other
/// proxies. All proxies of the same service and server node share the
/// implementation, its transfer-ID counter, and both transport sessions.
pub struct Client<C: Service> {
    imp: Arc<ClientImpl<C>>,
    priority: Priority,
    response_timeout: Duration,
}

impl<C: Service> Client<C> {
    pub(crate) fn from_impl(imp: Arc<ClientImpl<C>>) -> Self {
        Self { imp, priority: DEFAULT_PRIORITY, response_timeout: DEFAULT_SERVICE_REQUEST_TIMEOUT }
    }

    /// The service-ID this client invokes.
    #[must_use]
    pub fn service_id(&self) -> ServiceId {
        self.imp.core.input_session.specifier().data_specifier.port_id()
    }

    /// Sends the request and suspends until the matching response arrives
    /// or the response timeout expires (`None`).
    ///
    /// On transports with a small transfer-ID modulus (such as CAN) the
    /// call fails with
    /// [`PresentationError::RequestTransferIdVariabilityExhausted`] when
    /// every transfer-ID value already has a request in flight.
    pub async fn call(
        &self,
        request: &C::Request,
    ) -> Result<Option<(C::Response, TransferFrom)>, PresentationError> {
        self.imp.call(request, self.priority, self.response_timeout).await
    }

    /// The priority applied to requests sent via this proxy.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Sets the priority for subsequent requests via this proxy.
    pub fn set_priority(&mut self, value: Priority) {
        self.priority = value;
    }

    /// The response timeout of this proxy; also used as the send timeout
    /// of the request transfer.
    #[must_use]
    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    /// Sets the response timeout for subsequent calls via this proxy.
    pub fn set_response_timeout(&mut self, value: Duration) {
        self.response_timeout = value;
    }

    /// The shared transfer-ID counter of this session specifier.
    #[must_use]
    pub fn transfer_id_counter(&self) -> Arc<OutgoingTransferIdCounter> {
        Arc::clone(&self.imp.core.counter)
    }

    /// Statistical counters, shared per session specifier.
    #[must_use]
    pub fn sample_statistics(&self) -> ClientStatistics {
        let core = &self.imp.core;
        ClientStatistics {
            request_transport_session: self.imp.output_session.sample_statistics(),
            response_transport_session: core.input_session.sample_statistics(),
            sent_requests: core.sent_requests.load(Ordering::Relaxed),
            unsent_requests: core.unsent_requests.load(Ordering::Relaxed),
            deserialization_failures: core.deserialization_failures.load(Ordering::Relaxed),
            unexpected_responses: core.unexpected_responses.load(Ordering::Relaxed),
        }
    }

    /// Closes this proxy. Equivalent to dropping it; the underlying
    /// sessions are closed when the last proxy goes away.
    pub fn close(self) {}
}

impl<C: Service> fmt::Debug for Client<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("dtype", &C::model().to_string())
            .field("input_session", &self.imp.core.input_session)
            .field("output_session", &self.imp.output_session)
            .finish_non_exhaustive()
    }
}

/// State shared between the implementation handle and its response
/// routing task.
pub(crate) struct ClientCore<C: Service> {
    input_session: Arc<dyn InputSession>,
    counter: Arc<OutgoingTransferIdCounter>,
    pending: Mutex<HashMap<u64, oneshot::Sender<(C::Response, TransferFrom)>>>,
    down: AtomicBool,
    sent_requests: AtomicU64,
    unsent_requests: AtomicU64,
    deserialization_failures: AtomicU64,
    unexpected_responses: AtomicU64,
}

impl<C: Service> ClientCore<C> {
    fn forget(&self, transfer_id: u64) {
        lock(&self.pending).remove(&transfer_id);
    }

    /// Drops every pending request future; their awaiting callers observe
    /// a closed port.
    fn fail_pending(&self) {
        lock(&self.pending).clear();
    }
}

/// The shared client implementation; at most one per session specifier.
/// Runs the routing task that matches received responses to pending
/// requests by transfer-ID.
pub(crate) struct ClientImpl<C: Service> {
    pub(crate) core: Arc<ClientCore<C>>,
    output_session: Arc<dyn OutputSession>,
    send_lock: tokio::sync::Mutex<()>,
    routing_task: AbortHandle,
    shared: Arc<Shared>,
    key: PortKey,
}

impl<C: Service> ClientImpl<C> {
    pub(crate) fn new(
        input_session: Arc<dyn InputSession>,
        output_session: Arc<dyn OutputSession>,
        counter: Arc<OutgoingTransferIdCounter>,
        shared: Arc<Shared>,
        key: PortKey,
    ) -> Self {
        let core = Arc::new(ClientCore {
            input_session,
            counter,
            pending: Mutex::new(HashMap::new()),
            down: AtomicBool::new(false),
            sent_requests: AtomicU64::new(0),
            unsent_requests: AtomicU64::new(0),
            deserialization_failures: AtomicU64::new(0),
            unexpected_responses: AtomicU64::new(0),
        });
        let routing_task = tokio::spawn(Self::routing_loop(Arc::clone(&core))).abort_handle();
        Self {
            core,
            output_session,
            send_lock: tokio::sync::Mutex::new(()),
            routing_task,
            shared,
            key,
        }
    }

    async fn call(
        &self,
        request: &C::Request,
        priority: Priority,
        response_timeout: Duration,
    ) -> Result<Option<(C::Response, TransferFrom)>, PresentationError> {
        let monotonic_deadline = Instant::now() + response_timeout;

        // The lock stays taken over the send on purpose: requests of one
        // session specifier reach the transport in transfer-ID order.
        let (transfer_id, response_rx) = {
            let _guard = self.send_lock.lock().await;
            if self.core.down.load(Ordering::Acquire) {
                return Err(PresentationError::PortClosed(format!("{:?}", self.key)));
            }
            // The modulus is computed here rather than left to the
            // transport because the response carries the reduced value and
            // must be matched against the request.
            let modulo = self.shared.transport.protocol_parameters().transfer_id_modulo;
            let transfer_id = self.core.counter.get_then_increment() % modulo;
            let response_rx = {
                let mut pending = lock(&self.core.pending);
                if pending.contains_key(&transfer_id) {
                    return Err(PresentationError::RequestTransferIdVariabilityExhausted(
                        format!("{:?} with transfer-ID modulo {modulo}", self.key),
                    ));
                }
                let (tx, rx) = oneshot::channel();
                pending.insert(transfer_id, tx);
                rx
            };
            let sent = match self
                .send_request(request, transfer_id, priority, monotonic_deadline)
                .await
            {
                Ok(sent) => sent,
                Err(error) => {
                    self.core.forget(transfer_id);
                    return Err(error);
                }
            };
            if !sent {
                self.core.unsent_requests.fetch_add(1, Ordering::Relaxed);
                self.core.forget(transfer_id);
                return Ok(None);
            }
            self.core.sent_requests.fetch_add(1, Ordering::Relaxed);
            (transfer_id, response_rx)
        };

        // Await the response with the lock released. The pending entry is
        // removed on every exit path so that a reused transfer-ID value
        // does not collide with a stale future.
        let outcome = tokio::time::timeout_at(monotonic_deadline, response_rx).await;
        self.core.forget(transfer_id);
        match outcome {
            Ok(Ok(response)) => Ok(Some(response)),
            // The sender side was dropped: the implementation went down.
            Ok(Err(_)) => Err(PresentationError::PortClosed(format!("{:?}", self.key))),
            Err(_) => Ok(None), // Response timeout.
        }
    }

    async fn send_request(
        &self,
        request: &C::Request,
        transfer_id: u64,
        priority: Priority,
        monotonic_deadline: Instant,
    ) -> Result<bool, PresentationError> {
        let payload = cyphal_dsdl::serialize(request)?;
        let transfer = Transfer {
            timestamp: Timestamp::now(),
            priority,
            transfer_id,
            fragmented_payload: vec![payload],
        };
        match self.output_session.send(transfer, monotonic_deadline).await {
            Ok(sent) => Ok(sent),
            Err(error) => {
                if error.is_closed() {
                    self.core.down.store(true, Ordering::Release);
                }
                Err(error.into())
            }
        }
    }

    async fn routing_loop(core: Arc<ClientCore<C>>) {
        loop {
            if core.down.load(Ordering::Acquire) {
                return;
            }
            match core.input_session.receive(Instant::now() + RECEIVE_SLICE).await {
                Ok(None) => {}
                Ok(Some(transfer)) => {
                    let response = match cyphal_dsdl::deserialize::<C::Response>(
                        &transfer.fragmented_payload,
                    ) {
                        Ok(Some(response)) => response,
                        Ok(None) => {
                            core.deserialization_failures.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                        Err(error) => {
                            // Codec misuse inside the deserialization
                            // routine; the client is unusable.
                            tracing::error!(%error, "client routing task failed");
                            core.down.store(true, Ordering::Release);
                            core.fail_pending();
                            return;
                        }
                    };
                    let matched = lock(&core.pending).remove(&transfer.transfer_id);
                    match matched {
                        Some(tx) => {
                            // The caller may have timed out meanwhile; a
                            // failed send is then indistinguishable from a
                            // late response and is dropped the same way.
                            let _ = tx.send((response, transfer));
                        }
                        None => {
                            tracing::info!(
                                transfer_id = transfer.transfer_id,
                                "response does not match any pending request"
                            );
                            core.unexpected_responses.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                Err(error) => {
                    tracing::debug!(%error, "client routing task stops");
                    core.down.store(true, Ordering::Release);
                    core.fail_pending();
                    return;
                }
            }
        }
    }
}

impl<C: Service> PortImpl for ClientImpl<C> {
    fn shut_down(&self) {
        self.core.down.store(true, Ordering::Release);
        self.routing_task.abort();
        self.core.input_session.close();
        self.output_session.close();
        self.core.fail_pending();
    }

    fn dtype_name(&self) -> String {
        C::model().to_string()
    }
}

impl<C: Service> Drop for ClientImpl<C> {
    fn drop(&mut self) {
        self.core.down.store(true, Ordering::Release);
        self.routing_task.abort();
        self.shared.deregister(&self.key);
        self.core.input_session.close();
        self.output_session.close();
        self.core.fail_pending();
    }
}
