//! Fully in-memory transport used for tests, demos, and API exploration.
//!
//! The loopback transport short-circuits output sessions into input
//! sessions as if a real network sat in between: every sent transfer is
//! delivered to every matching local input session (both the selective
//! session for the local node-ID and the promiscuous one). It honors the
//! complete transport contract and doubles as the conformance reference
//! for concrete transports.

mod input;
mod output;
mod tracer;

use core::fmt;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::Instant;

pub use self::{input::LoopbackInputSession, output::LoopbackOutputSession, tracer::LoopbackTracer};
use crate::{
    AlienTransfer, Capture, CaptureHandler, InputSession, InputSessionSpecifier, NodeId,
    OutputSession, OutputSessionSpecifier, PayloadMetadata, ProtocolParameters, Timestamp,
    Transport, TransportError,
};

/// What [`Transport::spoof`] does on the next invocation. Test rigging.
#[derive(Debug, Clone, Default)]
pub enum SpoofBehavior {
    /// Deliver the capture event and report success.
    #[default]
    Succeed,
    /// Sleep until the deadline and report a timeout.
    Timeout,
    /// Fail with the configured error.
    Fail(TransportError),
}

type SharedCaptureHandler = Arc<dyn Fn(&Capture) + Send + Sync>;

pub(crate) struct State {
    local_node_id: Option<NodeId>,
    allow_anonymous_transfers: bool,
    inner: Mutex<Inner>,
}

struct Inner {
    input_sessions: HashMap<InputSessionSpecifier, Arc<LoopbackInputSession>>,
    output_sessions: HashMap<OutputSessionSpecifier, Arc<LoopbackOutputSession>>,
    capture_handlers: Vec<SharedCaptureHandler>,
    protocol_parameters: ProtocolParameters,
    send_delay: Duration,
    spoof_behavior: SpoofBehavior,
    closed: bool,
}

/// The in-process loopback transport. Clones share the same instance.
///
/// Data can only be exchanged within one transport instance: transfers
/// sent by the local node come back to the local node. The protocol
/// parameters are practically unbounded by default and can be overridden
/// to emulate constrained transports.
#[derive(Clone)]
pub struct LoopbackTransport {
    state: Arc<State>,
}

impl LoopbackTransport {
    /// Creates a transport with the given local node-ID (absent for an
    /// anonymous instance); anonymous output sessions are permitted.
    #[must_use]
    pub fn new(local_node_id: Option<NodeId>) -> Self {
        Self::with_anonymous_policy(local_node_id, true)
    }

    /// Like [`LoopbackTransport::new`] with explicit control over whether
    /// an anonymous instance may create output sessions.
    #[must_use]
    pub fn with_anonymous_policy(
        local_node_id: Option<NodeId>,
        allow_anonymous_transfers: bool,
    ) -> Self {
        Self {
            state: Arc::new(State {
                local_node_id,
                allow_anonymous_transfers,
                inner: Mutex::new(Inner {
                    input_sessions: HashMap::new(),
                    output_sessions: HashMap::new(),
                    capture_handlers: Vec::new(),
                    protocol_parameters: ProtocolParameters {
                        transfer_id_modulo: u64::MAX,
                        max_nodes: u64::from(u16::MAX),
                        mtu: usize::MAX,
                    },
                    send_delay: Duration::ZERO,
                    spoof_behavior: SpoofBehavior::Succeed,
                    closed: false,
                }),
            }),
        }
    }

    /// Test rigging: inserts this delay before every sent transfer; if the
    /// transfer deadline has passed once the delay elapses, the send is
    /// reported as timed out.
    pub fn set_send_delay(&self, value: Duration) {
        self.state.lock_inner().send_delay = value;
    }

    /// The configured send delay.
    #[must_use]
    pub fn send_delay(&self) -> Duration {
        self.state.lock_inner().send_delay
    }

    /// Test rigging: replaces the advertised protocol parameters, e.g. to
    /// emulate a small transfer-ID modulus.
    pub fn set_protocol_parameters(&self, value: ProtocolParameters) {
        self.state.lock_inner().protocol_parameters = value;
    }

    /// Test rigging: configures the outcome of subsequent
    /// [`Transport::spoof`] calls.
    pub fn set_spoof_behavior(&self, value: SpoofBehavior) {
        self.state.lock_inner().spoof_behavior = value;
    }

    /// Live input sessions, for introspection in tests.
    #[must_use]
    pub fn input_sessions(&self) -> Vec<Arc<LoopbackInputSession>> {
        self.state.lock_inner().input_sessions.values().cloned().collect()
    }

    /// Live output sessions, for introspection in tests.
    #[must_use]
    pub fn output_sessions(&self) -> Vec<Arc<LoopbackOutputSession>> {
        self.state.lock_inner().output_sessions.values().cloned().collect()
    }

    /// Whether any capture handler is registered.
    #[must_use]
    pub fn capture_active(&self) -> bool {
        !self.state.lock_inner().capture_handlers.is_empty()
    }

    /// A tracer that reconstructs transfers from loopback capture events.
    #[must_use]
    pub fn make_tracer() -> LoopbackTracer {
        LoopbackTracer::default()
    }
}

impl State {
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Lock poisoning cannot occur: no code path panics while holding
        // the lock.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn local_node_id(&self) -> Option<NodeId> {
        self.local_node_id
    }

    pub(crate) fn send_delay(&self) -> Duration {
        self.lock_inner().send_delay
    }

    pub(crate) fn transfer_id_modulo(&self) -> u64 {
        self.lock_inner().protocol_parameters.transfer_id_modulo
    }

    /// Capture handlers and the input sessions the transfer must be
    /// multicast to, snapshotted so that delivery happens without holding
    /// the lock.
    pub(crate) fn delivery_plan(
        &self,
        data_specifier: crate::DataSpecifier,
    ) -> (Vec<SharedCaptureHandler>, Vec<Arc<LoopbackInputSession>>) {
        let inner = self.lock_inner();
        let mut destinations = Vec::new();
        let mut remotes = vec![self.local_node_id];
        if self.local_node_id.is_some() {
            remotes.push(None); // The promiscuous session, if distinct.
        }
        for remote_node_id in remotes {
            let key = InputSessionSpecifier { data_specifier, remote_node_id };
            if let Some(session) = inner.input_sessions.get(&key) {
                destinations.push(Arc::clone(session));
            }
        }
        (inner.capture_handlers.clone(), destinations)
    }

    pub(crate) fn remove_input_session(&self, specifier: &InputSessionSpecifier) {
        self.lock_inner().input_sessions.remove(specifier);
    }

    pub(crate) fn remove_output_session(&self, specifier: &OutputSessionSpecifier) {
        self.lock_inner().output_sessions.remove(specifier);
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn local_node_id(&self) -> Option<NodeId> {
        self.state.local_node_id
    }

    fn protocol_parameters(&self) -> ProtocolParameters {
        self.state.lock_inner().protocol_parameters
    }

    fn input_session(
        &self,
        specifier: InputSessionSpecifier,
        payload_metadata: PayloadMetadata,
    ) -> Result<Arc<dyn InputSession>, TransportError> {
        let mut inner = self.state.lock_inner();
        if inner.closed {
            return Err(TransportError::ResourceClosed(format!("{self:?}")));
        }
        let session = inner
            .input_sessions
            .entry(specifier)
            .or_insert_with(|| {
                Arc::new(LoopbackInputSession::new(
                    specifier,
                    payload_metadata,
                    Arc::downgrade(&self.state),
                ))
            })
            .clone();
        Ok(session)
    }

    fn output_session(
        &self,
        specifier: OutputSessionSpecifier,
        payload_metadata: PayloadMetadata,
    ) -> Result<Arc<dyn OutputSession>, TransportError> {
        let mut inner = self.state.lock_inner();
        if inner.closed {
            return Err(TransportError::ResourceClosed(format!("{self:?}")));
        }
        if let Some(session) = inner.output_sessions.get(&specifier) {
            return Ok(Arc::clone(session) as Arc<dyn OutputSession>);
        }
        if self.state.local_node_id.is_none() && !self.state.allow_anonymous_transfers {
            return Err(TransportError::OperationNotDefinedForAnonymousNode(format!(
                "anonymous transfers are not enabled for {self:?}"
            )));
        }
        let session = Arc::new(LoopbackOutputSession::new(
            specifier,
            payload_metadata,
            Arc::downgrade(&self.state),
        ));
        inner.output_sessions.insert(specifier, Arc::clone(&session));
        Ok(session)
    }

    fn close(&self) {
        let (inputs, outputs) = {
            let mut inner = self.state.lock_inner();
            inner.closed = true;
            inner.spoof_behavior =
                SpoofBehavior::Fail(TransportError::ResourceClosed(format!("{self:?}")));
            let inputs: Vec<_> = inner.input_sessions.drain().map(|(_, s)| s).collect();
            let outputs: Vec<_> = inner.output_sessions.drain().map(|(_, s)| s).collect();
            (inputs, outputs)
        };
        for session in inputs {
            session.close();
        }
        for session in outputs {
            session.close();
        }
    }

    fn begin_capture(&self, handler: CaptureHandler) {
        self.state.lock_inner().capture_handlers.push(Arc::from(handler));
    }

    async fn spoof(
        &self,
        transfer: AlienTransfer,
        monotonic_deadline: Instant,
    ) -> Result<bool, TransportError> {
        let behavior = self.state.lock_inner().spoof_behavior.clone();
        match behavior {
            SpoofBehavior::Fail(error) => Err(error),
            SpoofBehavior::Timeout => {
                tokio::time::sleep_until(monotonic_deadline).await;
                Ok(false)
            }
            SpoofBehavior::Succeed => {
                let handlers = self.state.lock_inner().capture_handlers.clone();
                let capture = Capture { timestamp: Timestamp::now(), transfer };
                for handler in handlers {
                    handler(&capture);
                }
                Ok(true)
            }
        }
    }
}

impl fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("local_node_id", &self.state.local_node_id)
            .field("allow_anonymous_transfers", &self.state.allow_anonymous_transfers)
            .finish_non_exhaustive()
    }
}
