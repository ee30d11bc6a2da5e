//! Loopback input session.

use core::fmt;
use std::{
    sync::{
        Mutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::{Notify, mpsc},
    time::Instant,
};

use crate::{
    InputSession, InputSessionSpecifier, PayloadMetadata, SessionStatistics, TransferFrom,
    TransportError,
};

/// Default transfer-ID timeout advertised by loopback input sessions.
pub const DEFAULT_TRANSFER_ID_TIMEOUT: Duration = Duration::from_secs(2);

/// Receiving end of the loopback short circuit; fed by every matching
/// output session of the same transport.
pub struct LoopbackInputSession {
    specifier: InputSessionSpecifier,
    payload_metadata: PayloadMetadata,
    transport: Weak<super::State>,
    queue_tx: mpsc::UnboundedSender<TransferFrom>,
    queue_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<TransferFrom>>,
    transfer_id_timeout: Mutex<Duration>,
    statistics: Mutex<SessionStatistics>,
    closed: AtomicBool,
    close_notify: Notify,
}

impl LoopbackInputSession {
    pub(super) fn new(
        specifier: InputSessionSpecifier,
        payload_metadata: PayloadMetadata,
        transport: Weak<super::State>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            specifier,
            payload_metadata,
            transport,
            queue_tx,
            queue_rx: tokio::sync::Mutex::new(queue_rx),
            transfer_id_timeout: Mutex::new(DEFAULT_TRANSFER_ID_TIMEOUT),
            statistics: Mutex::new(SessionStatistics::default()),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        }
    }

    /// Inserts a transfer into the receive queue of this session.
    pub(super) fn push(&self, transfer: TransferFrom) {
        // A failed send means the receiver half is gone, i.e. the session
        // is being torn down; the transfer is dropped like on a real wire.
        let _ = self.queue_tx.send(transfer);
    }

    /// The advertised transfer-ID timeout.
    #[must_use]
    pub fn transfer_id_timeout(&self) -> Duration {
        *lock(&self.transfer_id_timeout)
    }

    /// Overrides the advertised transfer-ID timeout.
    pub fn set_transfer_id_timeout(&self, value: Duration) {
        *lock(&self.transfer_id_timeout) = value;
    }
}

#[async_trait]
impl InputSession for LoopbackInputSession {
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
        let mut queue = self.queue_rx.lock().await;
        let received = if monotonic_deadline <= Instant::now() {
            queue.try_recv().ok() // Non-suspending poll.
        } else {
            tokio::select! {
                transfer = queue.recv() => transfer,
                () = self.close_notify.notified() => {
                    return Err(TransportError::ResourceClosed(format!("{self:?}")));
                }
                () = tokio::time::sleep_until(monotonic_deadline) => None,
            }
        };
        if let Some(transfer) = &received {
            let mut stats = lock(&self.statistics);
            stats.transfers += 1;
            stats.frames += 1;
            stats.payload_bytes += transfer.payload_size_bytes() as u64;
        }
        Ok(received)
    }

    fn sample_statistics(&self) -> SessionStatistics {
        *lock(&self.statistics)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_notify.notify_waiters();
            if let Some(transport) = self.transport.upgrade() {
                transport.remove_input_session(&self.specifier);
            }
        }
    }
}

impl fmt::Debug for LoopbackInputSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackInputSession")
            .field("specifier", &self.specifier)
            .field("payload_metadata", &self.payload_metadata)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
