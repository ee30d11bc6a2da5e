//! Message publisher port.

use core::fmt;
use std::{
    marker::PhantomData,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use cyphal_dsdl::Message;
use cyphal_transport::{
    OutputSession, Priority, SessionStatistics, SubjectId, Timestamp, Transfer,
};
use tokio::time::Instant;

use crate::{
    PresentationError,
    controller::{PortImpl, PortKey, Shared},
    port::{DEFAULT_PRIORITY, DEFAULT_SEND_TIMEOUT, OutgoingTransferIdCounter},
};

/// A publisher proxy for one subject.
///
/// Each task should obtain its own proxy from
/// [`Presentation::make_publisher`](crate::Presentation::make_publisher);
/// proxies are cheap, and per-proxy settings (priority, send timeout) do
/// not affect other proxies of the same subject. The transfer-ID counter,
/// by contrast, is a transport-layer entity shared per session specifier.
///
/// Dropping the last proxy of a subject closes the underlying transport
/// session.
pub struct Publisher<T: Message> {
    imp: Arc<PublisherImpl<T>>,
    priority: Priority,
    send_timeout: Duration,
}

impl<T: Message> Publisher<T> {
    pub(crate) fn from_impl(imp: Arc<PublisherImpl<T>>) -> Self {
        Self { imp, priority: DEFAULT_PRIORITY, send_timeout: DEFAULT_SEND_TIMEOUT }
    }

    /// The subject-ID this publisher is bound to.
    #[must_use]
    pub fn subject_id(&self) -> SubjectId {
        self.imp.session.specifier().data_specifier.port_id()
    }

    /// The priority applied to transfers published via this proxy.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Sets the priority for subsequent publications via this proxy.
    pub fn set_priority(&mut self, value: Priority) {
        self.priority = value;
    }

    /// The per-publication send timeout of this proxy.
    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    /// Sets the send timeout for subsequent publications via this proxy.
    pub fn set_send_timeout(&mut self, value: Duration) {
        self.send_timeout = value;
    }

    /// The shared transfer-ID counter of this session specifier. Useful in
    /// special cases where the transfer-ID must be overridden manually,
    /// e.g. time synchronization publishers.
    #[must_use]
    pub fn transfer_id_counter(&self) -> Arc<OutgoingTransferIdCounter> {
        Arc::clone(&self.imp.counter)
    }

    /// Serializes and publishes the message. Returns `false` if the
    /// transfer could not be handed to the medium within the send timeout.
    ///
    /// Should not be mixed with [`Publisher::publish_soon`] on the same
    /// proxy, otherwise the relative ordering of the messages becomes
    /// unspecified.
    pub async fn publish(&self, message: &T) -> Result<bool, PresentationError> {
        self.imp.publish(message, self.priority, Instant::now() + self.send_timeout).await
    }

    /// Serializes and publishes the message from a background task without
    /// suspending the caller. Failures are logged and otherwise ignored;
    /// the send timeout is still in effect.
    pub fn publish_soon(&self, message: T)
    where
        T: Sync,
    {
        let imp = Arc::clone(&self.imp);
        let priority = self.priority;
        let deadline = Instant::now() + self.send_timeout;
        tokio::spawn(async move {
            match imp.publish(&message, priority, deadline).await {
                Ok(true) => {}
                Ok(false) => tracing::info!(dtype = %T::model(), "deferred publication timed out"),
                Err(error) => {
                    tracing::warn!(dtype = %T::model(), %error, "deferred publication failed");
                }
            }
        });
    }

    /// Traffic counters of the underlying session, shared per session
    /// specifier.
    #[must_use]
    pub fn sample_statistics(&self) -> SessionStatistics {
        self.imp.session.sample_statistics()
    }

    /// Closes this proxy. Equivalent to dropping it; the underlying
    /// session is closed when the last proxy goes away.
    pub fn close(self) {}
}

impl<T: Message> fmt::Debug for Publisher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("dtype", &T::model().to_string())
            .field("session", &self.imp.session)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// The shared publisher implementation; at most one per session specifier.
pub(crate) struct PublisherImpl<T: Message> {
    session: Arc<dyn OutputSession>,
    counter: Arc<OutgoingTransferIdCounter>,
    send_lock: tokio::sync::Mutex<()>,
    down: AtomicBool,
    shared: Arc<Shared>,
    key: PortKey,
    _dtype: PhantomData<fn() -> T>,
}

impl<T: Message> PublisherImpl<T> {
    pub(crate) fn new(
        session: Arc<dyn OutputSession>,
        counter: Arc<OutgoingTransferIdCounter>,
        shared: Arc<Shared>,
        key: PortKey,
    ) -> Self {
        Self {
            session,
            counter,
            send_lock: tokio::sync::Mutex::new(()),
            down: AtomicBool::new(false),
            shared,
            key,
            _dtype: PhantomData,
        }
    }

    /// Publications through one implementation complete in invocation
    /// order; the lock serializes access to the transport session.
    async fn publish(
        &self,
        message: &T,
        priority: Priority,
        monotonic_deadline: Instant,
    ) -> Result<bool, PresentationError> {
        let _guard = self.send_lock.lock().await;
        if self.down.load(Ordering::Acquire) {
            return Err(PresentationError::PortClosed(format!("{:?}", self.key)));
        }
        let payload = cyphal_dsdl::serialize(message)?;
        let transfer = Transfer {
            timestamp: Timestamp::now(),
            priority,
            transfer_id: self.counter.get_then_increment(),
            fragmented_payload: vec![payload],
        };
        match self.session.send(transfer, monotonic_deadline).await {
            Ok(accepted) => Ok(accepted),
            Err(error) => {
                if error.is_closed() {
                    self.down.store(true, Ordering::Release);
                }
                Err(error.into())
            }
        }
    }
}

impl<T: Message> PortImpl for PublisherImpl<T> {
    fn shut_down(&self) {
        self.down.store(true, Ordering::Release);
        self.session.close();
    }

    fn dtype_name(&self) -> String {
        T::model().to_string()
    }
}

impl<T: Message> Drop for PublisherImpl<T> {
    fn drop(&mut self) {
        self.shared.deregister(&self.key);
        self.session.close();
    }
}
