//! Redundant transport: aggregates homogeneous transports for failover.
//!
//! An output session sends every transfer via all inferior transports and
//! succeeds if at least one of them accepted it in time. An input session
//! merges the streams of all inferiors and discards duplicates by
//! `(source node-ID, transfer-ID)`, so a transfer delivered over several
//! redundant links surfaces to the application exactly once.
//!
//! All inferiors must agree on the local node-ID. Aggregating transports
//! with different transfer-ID moduli is permitted but degrades service
//! calls, because the modulo-reduced transfer-ID is the response
//! correlation key; homogeneous inferiors are strongly recommended.

use core::fmt;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::{Notify, mpsc},
    task::AbortHandle,
    time::Instant,
};

use crate::{
    AlienTransfer, CaptureHandler, InputSession, InputSessionSpecifier, NodeId, OutputSession,
    OutputSessionSpecifier, PayloadMetadata, ProtocolParameters, Transfer, TransferFrom,
    Transport, TransportError,
};

/// How many recent `(source, transfer-ID)` pairs an input session
/// remembers for duplicate rejection.
const DEDUPLICATION_WINDOW: usize = 1024;

/// How long a forwarding task waits per receive attempt; bounds how
/// quickly it notices that its inferior session is closed.
const FORWARD_SLICE: Duration = Duration::from_secs(1);

struct State {
    inferiors: Vec<Arc<dyn Transport>>,
    inner: Mutex<Inner>,
}

struct Inner {
    input_sessions: HashMap<InputSessionSpecifier, Arc<RedundantInputSession>>,
    output_sessions: HashMap<OutputSessionSpecifier, Arc<RedundantOutputSession>>,
    closed: bool,
}

/// A transport aggregating several inferior transports. Clones share the
/// same instance.
#[derive(Clone)]
pub struct RedundantTransport {
    state: Arc<State>,
}

impl RedundantTransport {
    /// Aggregates the given transports. Fails with
    /// [`TransportError::InvalidMediaConfiguration`] if the set is empty or
    /// the inferiors disagree on the local node-ID.
    pub fn new(inferiors: Vec<Arc<dyn Transport>>) -> Result<Self, TransportError> {
        let Some(first) = inferiors.first() else {
            return Err(TransportError::InvalidMediaConfiguration(
                "a redundant transport requires at least one inferior".into(),
            ));
        };
        let local_node_id = first.local_node_id();
        if inferiors.iter().any(|t| t.local_node_id() != local_node_id) {
            return Err(TransportError::InvalidMediaConfiguration(
                "all inferior transports must share the same local node-ID".into(),
            ));
        }
        Ok(Self {
            state: Arc::new(State {
                inferiors,
                inner: Mutex::new(Inner {
                    input_sessions: HashMap::new(),
                    output_sessions: HashMap::new(),
                    closed: false,
                }),
            }),
        })
    }

    /// The aggregated transports, in registration order.
    #[must_use]
    pub fn inferiors(&self) -> Vec<Arc<dyn Transport>> {
        self.state.inferiors.clone()
    }
}

impl State {
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl Transport for RedundantTransport {
    fn local_node_id(&self) -> Option<NodeId> {
        self.state.inferiors[0].local_node_id()
    }

    fn protocol_parameters(&self) -> ProtocolParameters {
        // The aggregate can promise no more than its weakest inferior.
        let mut out = self.state.inferiors[0].protocol_parameters();
        for inferior in &self.state.inferiors[1..] {
            let p = inferior.protocol_parameters();
            out.transfer_id_modulo = out.transfer_id_modulo.min(p.transfer_id_modulo);
            out.max_nodes = out.max_nodes.min(p.max_nodes);
            out.mtu = out.mtu.min(p.mtu);
        }
        out
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
        if let Some(session) = inner.input_sessions.get(&specifier) {
            return Ok(Arc::clone(session) as Arc<dyn InputSession>);
        }
        let inferior_sessions = self
            .state
            .inferiors
            .iter()
            .map(|t| t.input_session(specifier, payload_metadata))
            .collect::<Result<Vec<_>, _>>()?;
        let session = Arc::new(RedundantInputSession::new(
            specifier,
            payload_metadata,
            inferior_sessions,
            Arc::downgrade(&self.state),
        ));
        inner.input_sessions.insert(specifier, Arc::clone(&session));
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
        let inferior_sessions = self
            .state
            .inferiors
            .iter()
            .map(|t| t.output_session(specifier, payload_metadata))
            .collect::<Result<Vec<_>, _>>()?;
        let session = Arc::new(RedundantOutputSession {
            specifier,
            payload_metadata,
            inferior_sessions,
            transport: Arc::downgrade(&self.state),
            closed: AtomicBool::new(false),
        });
        inner.output_sessions.insert(specifier, Arc::clone(&session));
        Ok(session)
    }

    fn close(&self) {
        let (inputs, outputs) = {
            let mut inner = self.state.lock_inner();
            inner.closed = true;
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
        for inferior in &self.state.inferiors {
            inferior.close();
        }
    }

    fn begin_capture(&self, handler: CaptureHandler) {
        let shared: Arc<dyn Fn(&crate::Capture) + Send + Sync> = Arc::from(handler);
        for inferior in &self.state.inferiors {
            let shared = Arc::clone(&shared);
            inferior.begin_capture(Box::new(move |capture| shared(capture)));
        }
    }

    async fn spoof(
        &self,
        transfer: AlienTransfer,
        monotonic_deadline: Instant,
    ) -> Result<bool, TransportError> {
        let mut accepted = true;
        for inferior in &self.state.inferiors {
            accepted &= inferior.spoof(transfer.clone(), monotonic_deadline).await?;
        }
        Ok(accepted)
    }
}

impl fmt::Debug for RedundantTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedundantTransport")
            .field("inferiors", &self.state.inferiors)
            .finish_non_exhaustive()
    }
}

/// Merged receiving end over all inferior transports with duplicate
/// rejection.
pub struct RedundantInputSession {
    specifier: InputSessionSpecifier,
    payload_metadata: PayloadMetadata,
    inferior_sessions: Vec<Arc<dyn InputSession>>,
    merged: tokio::sync::Mutex<MergedQueue>,
    forward_tasks: Vec<AbortHandle>,
    transport: Weak<State>,
    statistics: Mutex<crate::SessionStatistics>,
    closed: AtomicBool,
    close_notify: Arc<Notify>,
}

struct MergedQueue {
    rx: mpsc::UnboundedReceiver<TransferFrom>,
    seen: HashSet<(NodeId, u64)>,
    order: VecDeque<(NodeId, u64)>,
}

impl RedundantInputSession {
    fn new(
        specifier: InputSessionSpecifier,
        payload_metadata: PayloadMetadata,
        inferior_sessions: Vec<Arc<dyn InputSession>>,
        transport: Weak<State>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let forward_tasks = inferior_sessions
            .iter()
            .map(|session| {
                let session = Arc::clone(session);
                let tx = tx.clone();
                tokio::spawn(async move {
                    loop {
                        match session.receive(Instant::now() + FORWARD_SLICE).await {
                            Ok(Some(transfer)) => {
                                if tx.send(transfer).is_err() {
                                    break;
                                }
                            }
                            Ok(None) => {}
                            Err(error) => {
                                tracing::debug!(%error, "redundant forwarding stops");
                                break;
                            }
                        }
                    }
                })
                .abort_handle()
            })
            .collect();
        Self {
            specifier,
            payload_metadata,
            inferior_sessions,
            merged: tokio::sync::Mutex::new(MergedQueue {
                rx,
                seen: HashSet::new(),
                order: VecDeque::new(),
            }),
            forward_tasks,
            transport,
            statistics: Mutex::new(crate::SessionStatistics::default()),
            closed: AtomicBool::new(false),
            close_notify: Arc::new(Notify::new()),
        }
    }
}

impl MergedQueue {
    /// Whether the transfer is first-seen within the deduplication window.
    /// Anonymous transfers cannot be deduplicated (the same key may belong
    /// to different sources) and are always accepted.
    fn accept(&mut self, transfer: &TransferFrom) -> bool {
        let Some(source) = transfer.source_node_id else {
            return true;
        };
        let key = (source, transfer.transfer_id);
        if !self.seen.insert(key) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > DEDUPLICATION_WINDOW {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

#[async_trait]
impl InputSession for RedundantInputSession {
    fn specifier(&self) -> &InputSessionSpecifier {
        &self.specifier
    }

    fn payload_metadata(&self) -> &PayloadMetadata {
        &self.payload_metadata
    }

    async fn receive(
        &self,
        monotonic_deadline: Instant,
    ) -> Result<Option<TransferFrom>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ResourceClosed(format!("{self:?}")));
        }
        let mut merged = self.merged.lock().await;
        loop {
            let received = if monotonic_deadline <= Instant::now() {
                merged.rx.try_recv().ok()
            } else {
                tokio::select! {
                    transfer = merged.rx.recv() => transfer,
                    () = self.close_notify.notified() => {
                        return Err(TransportError::ResourceClosed(format!("{self:?}")));
                    }
                    () = tokio::time::sleep_until(monotonic_deadline) => None,
                }
            };
            let Some(transfer) = received else { return Ok(None) };
            if merged.accept(&transfer) {
                let mut stats = lock(&self.statistics);
                stats.transfers += 1;
                stats.frames += 1;
                stats.payload_bytes += transfer.payload_size_bytes() as u64;
                return Ok(Some(transfer));
            }
        }
    }

    fn sample_statistics(&self) -> crate::SessionStatistics {
        *lock(&self.statistics)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_notify.notify_waiters();
            for task in &self.forward_tasks {
                task.abort();
            }
            for session in &self.inferior_sessions {
                session.close();
            }
            if let Some(transport) = self.transport.upgrade() {
                transport.lock_inner().input_sessions.remove(&self.specifier);
            }
        }
    }
}

impl fmt::Debug for RedundantInputSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedundantInputSession")
            .field("specifier", &self.specifier)
            .field("inferiors", &self.inferior_sessions.len())
            .finish_non_exhaustive()
    }
}

/// Sending end over all inferior transports.
pub struct RedundantOutputSession {
    specifier: OutputSessionSpecifier,
    payload_metadata: PayloadMetadata,
    inferior_sessions: Vec<Arc<dyn OutputSession>>,
    transport: Weak<State>,
    closed: AtomicBool,
}

#[async_trait]
impl OutputSession for RedundantOutputSession {
    fn specifier(&self) -> &OutputSessionSpecifier {
        &self.specifier
    }

    fn payload_metadata(&self) -> &PayloadMetadata {
        &self.payload_metadata
    }

    async fn send(
        &self,
        transfer: Transfer,
        monotonic_deadline: Instant,
    ) -> Result<bool, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ResourceClosed(format!("{self:?}")));
        }
        let mut accepted = false;
        let mut first_error = None;
        for session in &self.inferior_sessions {
            match session.send(transfer.clone(), monotonic_deadline).await {
                Ok(result) => accepted |= result,
                Err(error) => {
                    tracing::warn!(%error, session = ?session, "inferior send failed");
                    first_error.get_or_insert(error);
                }
            }
        }
        match (accepted, first_error) {
            // One accepting inferior makes the aggregate send a success.
            (true, _) | (false, None) => Ok(accepted),
            (false, Some(error)) => Err(error),
        }
    }

    fn sample_statistics(&self) -> crate::SessionStatistics {
        let mut out = crate::SessionStatistics::default();
        for session in &self.inferior_sessions {
            let s = session.sample_statistics();
            out.transfers += s.transfers;
            out.frames += s.frames;
            out.payload_bytes += s.payload_bytes;
            out.drops += s.drops;
        }
        out
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            for session in &self.inferior_sessions {
                session.close();
            }
            if let Some(transport) = self.transport.upgrade() {
                transport.lock_inner().output_sessions.remove(&self.specifier);
            }
        }
    }
}

impl fmt::Debug for RedundantOutputSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedundantOutputSession")
            .field("specifier", &self.specifier)
            .field("inferiors", &self.inferior_sessions.len())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackTransport;

    #[test]
    fn rejects_an_empty_inferior_set() {
        assert!(matches!(
            RedundantTransport::new(Vec::new()),
            Err(TransportError::InvalidMediaConfiguration(_))
        ));
    }

    #[test]
    fn rejects_mismatched_node_ids() {
        let a: Arc<dyn Transport> = Arc::new(LoopbackTransport::new(Some(1)));
        let b: Arc<dyn Transport> = Arc::new(LoopbackTransport::new(Some(2)));
        assert!(matches!(
            RedundantTransport::new(vec![a, b]),
            Err(TransportError::InvalidMediaConfiguration(_))
        ));
    }

    #[test]
    fn parameters_are_the_weakest_of_the_inferiors() {
        let a = LoopbackTransport::new(Some(1));
        a.set_protocol_parameters(ProtocolParameters {
            transfer_id_modulo: 32,
            max_nodes: 128,
            mtu: 8,
        });
        let b = LoopbackTransport::new(Some(1));
        b.set_protocol_parameters(ProtocolParameters {
            transfer_id_modulo: 1 << 48,
            max_nodes: 65535,
            mtu: 1408,
        });
        let red = RedundantTransport::new(vec![
            Arc::new(a) as Arc<dyn Transport>,
            Arc::new(b) as Arc<dyn Transport>,
        ])
        .unwrap_or_else(|_| unreachable!("node-IDs match"));
        let p = red.protocol_parameters();
        assert_eq!(p.transfer_id_modulo, 32);
        assert_eq!(p.max_nodes, 128);
        assert_eq!(p.mtu, 8);
    }
}
