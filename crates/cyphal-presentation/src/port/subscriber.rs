//! Message subscriber port.

use core::fmt;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::time::Duration;

use cyphal_dsdl::Message;
use cyphal_transport::{InputSession, SessionStatistics, SubjectId, TransferFrom};
use tokio::{sync::mpsc, task::AbortHandle, time::Instant};

use crate::{
    PresentationError,
    controller::{PortImpl, PortKey, Shared, lock},
    port::RECEIVE_SLICE,
};

/// Statistical counters of one subscriber proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberStatistics {
    /// Counters of the underlying transport session; shared per session
    /// specifier.
    pub transport_session: SessionStatistics,
    /// Messages delivered into this proxy's queue.
    pub messages: u64,
    /// Messages dropped because this proxy's queue was full.
    pub overruns: u64,
    /// Transfers that failed deserialization; shared per session
    /// specifier.
    pub deserialization_failures: u64,
}

/// A subscriber proxy for one subject.
///
/// Each task should obtain its own proxy from
/// [`Presentation::make_subscriber`](crate::Presentation::make_subscriber).
/// Every proxy of a subject sees every received message: the shared
/// implementation deserializes each transfer once and fans the message out
/// to all proxy queues. Dropping the last proxy cancels the receive task
/// and closes the underlying transport session.
pub struct Subscriber<T: Message + Clone> {
    imp: Arc<SubscriberImpl<T>>,
    listener: Arc<Listener<T>>,
    queue: Arc<tokio::sync::Mutex<QueueRx<T>>>,
    background: Mutex<Option<AbortHandle>>,
    closed: AtomicBool,
}

impl<T: Message + Clone> Subscriber<T> {
    pub(crate) fn from_impl(imp: &Arc<SubscriberImpl<T>>, queue_capacity: Option<usize>) -> Self {
        let (tx, rx) = match queue_capacity {
            Some(capacity) => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                (QueueTx::Bounded(tx), QueueRx::Bounded(rx))
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (QueueTx::Unbounded(tx), QueueRx::Unbounded(rx))
            }
        };
        let listener = Arc::new(Listener {
            tx,
            pushes: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
        });
        imp.core.add_listener(&listener);
        Self {
            imp: Arc::clone(imp),
            listener,
            queue: Arc::new(tokio::sync::Mutex::new(rx)),
            background: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// The subject-ID this subscriber is bound to.
    #[must_use]
    pub fn subject_id(&self) -> SubjectId {
        self.imp.core.session.specifier().data_specifier.port_id()
    }

    /// Suspends until a message arrives or the deadline expires (`None`).
    /// A deadline in the past polls the queue without suspending.
    pub async fn receive(
        &self,
        monotonic_deadline: Instant,
    ) -> Result<Option<(T, TransferFrom)>, PresentationError> {
        self.ensure_up()?;
        let mut queue = self.queue.lock().await;
        Ok(queue.recv_until(monotonic_deadline).await)
    }

    /// Like [`Subscriber::receive`] with a relative timeout.
    pub async fn receive_for(
        &self,
        timeout: Duration,
    ) -> Result<Option<(T, TransferFrom)>, PresentationError> {
        self.receive(Instant::now() + timeout).await
    }

    /// Non-suspending poll returning the message only.
    pub async fn get(&self) -> Result<Option<T>, PresentationError> {
        Ok(self.receive(Instant::now()).await?.map(|(message, _)| message))
    }

    /// Suspends until the next message; `None` once the subscriber or the
    /// underlying session is closed. The iteration analog of
    /// [`Subscriber::receive`].
    pub async fn next(&self) -> Option<(T, TransferFrom)> {
        loop {
            match self.receive_for(RECEIVE_SLICE).await {
                Ok(Some(out)) => return Some(out),
                Ok(None) => {}
                Err(_) => return None,
            }
        }
    }

    /// Invokes the handler from a background task for every received
    /// message. The task is cancelled when the proxy is closed; if a
    /// handler is already installed, it is replaced.
    ///
    /// This mode should not be mixed with the direct `receive*` methods on
    /// the same proxy, otherwise the message distribution between the
    /// consumers becomes unpredictable.
    pub fn receive_in_background<F>(&self, mut handler: F)
    where
        F: FnMut(T, TransferFrom) + Send + 'static,
    {
        let queue = Arc::clone(&self.queue);
        let task = tokio::spawn(async move {
            let mut queue = queue.lock().await;
            loop {
                if let Some((message, transfer)) = queue.recv_until(Instant::now() + RECEIVE_SLICE).await
                {
                    handler(message, transfer);
                }
            }
        });
        let mut background = lock(&self.background);
        if let Some(previous) = background.replace(task.abort_handle()) {
            previous.abort();
        }
    }

    /// Statistical counters of this proxy and its shared implementation.
    #[must_use]
    pub fn sample_statistics(&self) -> SubscriberStatistics {
        SubscriberStatistics {
            transport_session: self.imp.core.session.sample_statistics(),
            messages: self.listener.pushes.load(Ordering::Relaxed),
            overruns: self.listener.overruns.load(Ordering::Relaxed),
            deserialization_failures: self.imp.core.deserialization_failures.load(Ordering::Relaxed),
        }
    }

    /// Closes this proxy. Equivalent to dropping it.
    pub fn close(self) {}

    fn ensure_up(&self) -> Result<(), PresentationError> {
        if self.closed.load(Ordering::Acquire) || self.imp.core.down.load(Ordering::Acquire) {
            return Err(PresentationError::PortClosed(format!("{:?}", self.imp.key)));
        }
        Ok(())
    }
}

impl<T: Message + Clone> Drop for Subscriber<T> {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        if let Some(task) = lock(&self.background).take() {
            task.abort();
        }
        self.imp.core.remove_listener(&self.listener);
    }
}

impl<T: Message + Clone> fmt::Debug for Subscriber<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("dtype", &T::model().to_string())
            .field("session", &self.imp.core.session)
            .finish_non_exhaustive()
    }
}

enum QueueTx<T> {
    Bounded(mpsc::Sender<(T, TransferFrom)>),
    Unbounded(mpsc::UnboundedSender<(T, TransferFrom)>),
}

enum QueueRx<T> {
    Bounded(mpsc::Receiver<(T, TransferFrom)>),
    Unbounded(mpsc::UnboundedReceiver<(T, TransferFrom)>),
}

impl<T> QueueRx<T> {
    /// Receives with an absolute deadline; a deadline not in the future
    /// degenerates to a non-suspending poll.
    async fn recv_until(&mut self, monotonic_deadline: Instant) -> Option<(T, TransferFrom)> {
        if monotonic_deadline <= Instant::now() {
            return match self {
                Self::Bounded(rx) => rx.try_recv().ok(),
                Self::Unbounded(rx) => rx.try_recv().ok(),
            };
        }
        let recv = async {
            match self {
                Self::Bounded(rx) => rx.recv().await,
                Self::Unbounded(rx) => rx.recv().await,
            }
        };
        tokio::time::timeout_at(monotonic_deadline, recv).await.ok().flatten()
    }
}

/// One proxy's queue and its delivery counters.
struct Listener<T> {
    tx: QueueTx<T>,
    pushes: AtomicU64,
    overruns: AtomicU64,
}

impl<T> Listener<T> {
    fn push(&self, message: T, transfer: TransferFrom) {
        let delivered = match &self.tx {
            QueueTx::Bounded(tx) => tx.try_send((message, transfer)).is_ok(),
            QueueTx::Unbounded(tx) => tx.send((message, transfer)).is_ok(),
        };
        if delivered {
            self.pushes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.overruns.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// State shared between the implementation handle and its receive task.
pub(crate) struct SubscriberCore<T> {
    pub(crate) session: Arc<dyn InputSession>,
    listeners: Mutex<Vec<Arc<Listener<T>>>>,
    deserialization_failures: AtomicU64,
    down: AtomicBool,
}

impl<T> SubscriberCore<T> {
    fn add_listener(&self, listener: &Arc<Listener<T>>) {
        lock(&self.listeners).push(Arc::clone(listener));
    }

    fn remove_listener(&self, listener: &Arc<Listener<T>>) {
        lock(&self.listeners).retain(|candidate| !Arc::ptr_eq(candidate, listener));
    }
}

/// The shared subscriber implementation; at most one per session
/// specifier. Runs the receive task that deserializes each transfer once
/// and fans it out to all listeners.
pub(crate) struct SubscriberImpl<T: Message + Clone> {
    pub(crate) core: Arc<SubscriberCore<T>>,
    receive_task: AbortHandle,
    shared: Arc<Shared>,
    pub(crate) key: PortKey,
}

impl<T: Message + Clone> SubscriberImpl<T> {
    pub(crate) fn new(session: Arc<dyn InputSession>, shared: Arc<Shared>, key: PortKey) -> Self {
        let core = Arc::new(SubscriberCore {
            session,
            listeners: Mutex::new(Vec::new()),
            deserialization_failures: AtomicU64::new(0),
            down: AtomicBool::new(false),
        });
        let receive_task = tokio::spawn(Self::receive_loop(Arc::clone(&core))).abort_handle();
        Self { core, receive_task, shared, key }
    }

    async fn receive_loop(core: Arc<SubscriberCore<T>>) {
        loop {
            if core.down.load(Ordering::Acquire) {
                return;
            }
            match core.session.receive(Instant::now() + RECEIVE_SLICE).await {
                Ok(None) => {}
                Ok(Some(transfer)) => {
                    match cyphal_dsdl::deserialize::<T>(&transfer.fragmented_payload) {
                        Ok(Some(message)) => {
                            let listeners = lock(&core.listeners).clone();
                            for listener in listeners {
                                listener.push(message.clone(), transfer.clone());
                            }
                        }
                        Ok(None) => {
                            core.deserialization_failures.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(error) => {
                            // Codec misuse inside the deserialization
                            // routine; the subject is unusable.
                            tracing::error!(%error, "subscriber receive task failed");
                            core.down.store(true, Ordering::Release);
                            return;
                        }
                    }
                }
                Err(error) => {
                    tracing::debug!(%error, "subscriber receive task stops");
                    core.down.store(true, Ordering::Release);
                    return;
                }
            }
        }
    }
}

impl<T: Message + Clone> PortImpl for SubscriberImpl<T> {
    fn shut_down(&self) {
        self.core.down.store(true, Ordering::Release);
        self.receive_task.abort();
        self.core.session.close();
    }

    fn dtype_name(&self) -> String {
        T::model().to_string()
    }
}

impl<T: Message + Clone> Drop for SubscriberImpl<T> {
    fn drop(&mut self) {
        self.core.down.store(true, Ordering::Release);
        self.receive_task.abort();
        self.shared.deregister(&self.key);
        self.core.session.close();
    }
}
