//! Service server port.

use core::fmt;
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use cyphal_dsdl::{Serializable, Service};
use cyphal_transport::{
    DataSpecifier, InputSession, NodeId, OutputSession, OutputSessionSpecifier, PayloadMetadata,
    Priority, ServiceId, ServiceRole, SessionStatistics, Timestamp, Transfer,
};
use tokio::{task::AbortHandle, time::Instant};

use crate::{
    PresentationError,
    controller::{PortImpl, PortKey, Shared, lock},
    port::{DEFAULT_SERVICE_REQUEST_TIMEOUT, RECEIVE_SLICE},
};

/// Auxiliary information accompanying every received request. The response
/// reuses the request's priority and transfer-ID, as the protocol
/// prescribes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceRequestMetadata {
    /// Reception timestamp of the request transfer.
    pub timestamp: cyphal_transport::Timestamp,
    /// Priority of the request; the response is sent at the same level.
    pub priority: Priority,
    /// Transfer-ID of the request; the response carries the same value.
    pub transfer_id: u64,
    /// The node the response is sent back to.
    pub client_node_id: NodeId,
}

/// Statistical counters of a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatistics {
    /// Counters of the request (input) transport session.
    pub request_transport_session: SessionStatistics,
    /// Counters of the per-client response sessions, keyed by client
    /// node-ID.
    pub response_transport_sessions: HashMap<NodeId, SessionStatistics>,
    /// Requests passed to the handler.
    pub served_requests: u64,
    /// Request transfers that failed deserialization.
    pub deserialization_failures: u64,
    /// Request transfers without a source node-ID (anonymous clients
    /// cannot invoke services).
    pub malformed_requests: u64,
}

/// A server for one service.
///
/// Obtained from [`Presentation::get_server`](crate::Presentation::get_server),
/// which returns the same instance on repeated calls. At most one task may
/// serve at any given time. Dropping the last handle closes the transport
/// sessions; the presentation controller also closes servers when it is
/// closed itself.
pub struct Server<C: Service> {
    imp: Arc<ServerImpl<C>>,
}

impl<C: Service> Clone for Server<C> {
    fn clone(&self) -> Self {
        Self { imp: Arc::clone(&self.imp) }
    }
}

impl<C: Service> Server<C> {
    pub(crate) fn from_impl(imp: Arc<ServerImpl<C>>) -> Self {
        Self { imp }
    }

    /// The service-ID this server responds on.
    #[must_use]
    pub fn service_id(&self) -> ServiceId {
        self.imp.service_id
    }

    /// Serves requests until the deadline is reached (then exits
    /// normally) or, with no deadline, until the server is closed.
    ///
    /// For every received request the handler is invoked with the request
    /// object and its metadata and returns the response, or `None` to
    /// withhold the reply (a discouraged practice: the client can only
    /// time out).
    pub async fn serve<F, Fut>(
        &self,
        handler: F,
        monotonic_deadline: Option<Instant>,
    ) -> Result<(), PresentationError>
    where
        F: FnMut(C::Request, ServiceRequestMetadata) -> Fut,
        Fut: Future<Output = Option<C::Response>>,
    {
        self.imp.serve(handler, monotonic_deadline).await
    }

    /// Like [`Server::serve`] with a relative timeout.
    pub async fn serve_for<F, Fut>(
        &self,
        handler: F,
        timeout: Duration,
    ) -> Result<(), PresentationError>
    where
        F: FnMut(C::Request, ServiceRequestMetadata) -> Fut,
        Fut: Future<Output = Option<C::Response>>,
    {
        self.serve(handler, Some(Instant::now() + timeout)).await
    }

    /// Runs the server from a background task until it is closed. If a
    /// background task is already running, it is replaced. This mode
    /// shall not be combined with direct `serve*` calls.
    pub fn serve_in_background<F, Fut>(&self, mut handler: F)
    where
        F: FnMut(C::Request, ServiceRequestMetadata) -> Fut + Send + 'static,
        Fut: Future<Output = Option<C::Response>> + Send,
        C::Response: Sync,
    {
        let imp = Arc::clone(&self.imp);
        let task = tokio::spawn(async move {
            loop {
                match imp.serve(&mut handler, None).await {
                    Ok(()) => return,
                    Err(error) if error.is_closed() => {
                        tracing::debug!(%error, "server task stops");
                        return;
                    }
                    Err(error) => {
                        tracing::warn!(%error, "server task failure");
                        tokio::time::sleep(RECEIVE_SLICE).await;
                    }
                }
            }
        });
        let mut background = lock(&self.imp.background);
        if let Some(previous) = background.replace(task.abort_handle()) {
            previous.abort();
        }
    }

    /// The response send timeout; a response that cannot be sent within it
    /// is abandoned with a warning.
    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        *lock(&self.imp.send_timeout)
    }

    /// Sets the response send timeout.
    pub fn set_send_timeout(&self, value: Duration) {
        *lock(&self.imp.send_timeout) = value;
    }

    /// Statistical counters of this server.
    #[must_use]
    pub fn sample_statistics(&self) -> ServerStatistics {
        self.imp.sample_statistics()
    }

    /// Stops the server and closes its transport sessions immediately,
    /// regardless of other outstanding handles.
    pub fn close(self) {
        self.imp.shut_down();
    }
}

impl<C: Service> fmt::Debug for Server<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("dtype", &C::model().to_string())
            .field("input_session", &self.imp.input_session)
            .finish_non_exhaustive()
    }
}

/// The server implementation; at most one per service-ID.
pub(crate) struct ServerImpl<C: Service> {
    input_session: Arc<dyn InputSession>,
    service_id: ServiceId,
    output_sessions: Mutex<HashMap<NodeId, Arc<dyn OutputSession>>>,
    send_timeout: Mutex<Duration>,
    serve_lock: tokio::sync::Mutex<()>,
    background: Mutex<Option<AbortHandle>>,
    down: AtomicBool,
    served_requests: AtomicU64,
    deserialization_failures: AtomicU64,
    malformed_requests: AtomicU64,
    shared: Arc<Shared>,
    key: PortKey,
    _dtype: std::marker::PhantomData<fn() -> C>,
}

impl<C: Service> ServerImpl<C> {
    pub(crate) fn new(
        input_session: Arc<dyn InputSession>,
        service_id: ServiceId,
        shared: Arc<Shared>,
        key: PortKey,
    ) -> Self {
        Self {
            input_session,
            service_id,
            output_sessions: Mutex::new(HashMap::new()),
            send_timeout: Mutex::new(DEFAULT_SERVICE_REQUEST_TIMEOUT),
            serve_lock: tokio::sync::Mutex::new(()),
            background: Mutex::new(None),
            down: AtomicBool::new(false),
            served_requests: AtomicU64::new(0),
            deserialization_failures: AtomicU64::new(0),
            malformed_requests: AtomicU64::new(0),
            shared,
            key,
            _dtype: std::marker::PhantomData,
        }
    }

    async fn serve<F, Fut>(
        &self,
        mut handler: F,
        monotonic_deadline: Option<Instant>,
    ) -> Result<(), PresentationError>
    where
        F: FnMut(C::Request, ServiceRequestMetadata) -> Fut,
        Fut: Future<Output = Option<C::Response>>,
    {
        let _guard = self.serve_lock.lock().await;
        loop {
            if self.down.load(Ordering::Acquire) {
                return Err(PresentationError::PortClosed(format!("{:?}", self.key)));
            }
            let slice_deadline = monotonic_deadline.unwrap_or_else(|| Instant::now() + RECEIVE_SLICE);
            let Some(transfer) = self.input_session.receive(slice_deadline).await? else {
                if monotonic_deadline.is_some() {
                    return Ok(()); // The deadline was reached.
                }
                continue;
            };
            let Some(client_node_id) = transfer.source_node_id else {
                // Anonymous nodes cannot be responded to.
                self.malformed_requests.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            let metadata = ServiceRequestMetadata {
                timestamp: transfer.timestamp,
                priority: transfer.priority,
                transfer_id: transfer.transfer_id,
                client_node_id,
            };
            let request =
                match cyphal_dsdl::deserialize::<C::Request>(&transfer.fragmented_payload)? {
                    Some(request) => request,
                    None => {
                        self.deserialization_failures.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                };
            self.served_requests.fetch_add(1, Ordering::Relaxed);
            // If the handler opts out, no response is sent and the client
            // can only time out.
            if let Some(response) = handler(request, metadata).await {
                self.send_response(&response, metadata).await;
            }
        }
    }

    async fn send_response(&self, response: &C::Response, metadata: ServiceRequestMetadata) {
        let session = match self.output_session_for(metadata.client_node_id) {
            Ok(session) => session,
            Err(error) => {
                tracing::warn!(%error, client = metadata.client_node_id, "no response session");
                return;
            }
        };
        let payload = match cyphal_dsdl::serialize(response) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(%error, "response serialization failed");
                return;
            }
        };
        let transfer = Transfer {
            timestamp: Timestamp::now(),
            priority: metadata.priority,
            transfer_id: metadata.transfer_id,
            fragmented_payload: vec![payload],
        };
        let deadline = Instant::now() + *lock(&self.send_timeout);
        match session.send(transfer, deadline).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(client = metadata.client_node_id, "response send timed out");
            }
            Err(error) => {
                tracing::warn!(%error, client = metadata.client_node_id, "response send failed");
            }
        }
    }

    /// The response session towards a client, created lazily on the first
    /// response to that node and cached for the lifetime of the server.
    fn output_session_for(
        &self,
        client_node_id: NodeId,
    ) -> Result<Arc<dyn OutputSession>, PresentationError> {
        let mut sessions = lock(&self.output_sessions);
        if let Some(session) = sessions.get(&client_node_id) {
            return Ok(Arc::clone(session));
        }
        tracing::debug!(client = client_node_id, "opening response session");
        let specifier = OutputSessionSpecifier {
            data_specifier: DataSpecifier::Service {
                service_id: self.service_id,
                role: ServiceRole::Response,
            },
            remote_node_id: Some(client_node_id),
        };
        let metadata = PayloadMetadata { extent_bytes: C::Response::model().extent_bytes };
        let session = self.shared.transport.output_session(specifier, metadata)?;
        sessions.insert(client_node_id, Arc::clone(&session));
        Ok(session)
    }

    fn sample_statistics(&self) -> ServerStatistics {
        ServerStatistics {
            request_transport_session: self.input_session.sample_statistics(),
            response_transport_sessions: lock(&self.output_sessions)
                .iter()
                .map(|(node_id, session)| (*node_id, session.sample_statistics()))
                .collect(),
            served_requests: self.served_requests.load(Ordering::Relaxed),
            deserialization_failures: self.deserialization_failures.load(Ordering::Relaxed),
            malformed_requests: self.malformed_requests.load(Ordering::Relaxed),
        }
    }
}

impl<C: Service> PortImpl for ServerImpl<C> {
    fn shut_down(&self) {
        self.down.store(true, Ordering::Release);
        if let Some(task) = lock(&self.background).take() {
            task.abort();
        }
        self.input_session.close();
        for session in lock(&self.output_sessions).values() {
            session.close();
        }
    }

    fn dtype_name(&self) -> String {
        C::model().to_string()
    }
}

impl<C: Service> Drop for ServerImpl<C> {
    fn drop(&mut self) {
        self.shut_down();
        self.shared.deregister(&self.key);
    }
}
