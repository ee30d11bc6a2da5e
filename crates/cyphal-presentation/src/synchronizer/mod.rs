//! Subscription synchronizers: group messages of several subjects into
//! synchronized batches.
//!
//! A synchronizer owns a set of subscribers (one per synchronized subject,
//! all of the same data type) and delivers groups with one
//! `(message, transfer)` entry per subscriber, in subscriber order. A group
//! is emitted only when every slot is filled, so the output rate never
//! exceeds the rate of the slowest subject.
//!
//! Two grouping policies are provided:
//!
//! - [`MonotonicClusteringSynchronizer`] clusters by a monotonically
//!   non-decreasing key function (typically a timestamp) with a
//!   configurable tolerance;
//! - [`TransferIdSynchronizer`] groups messages sharing the same
//!   `(source node-ID, transfer-ID)` pair.

mod monotonic;
mod transfer_id;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cyphal_transport::TransferFrom;
use tokio::{sync::mpsc, task::AbortHandle, time::Instant};

pub use self::{monotonic::MonotonicClusteringSynchronizer, transfer_id::TransferIdSynchronizer};
use crate::{controller::lock, port::RECEIVE_SLICE};

/// One synchronized message with its transfer metadata.
pub type MessageWithMetadata<T> = (T, TransferFrom);

/// A complete synchronized group, one entry per subscriber, in subscriber
/// order.
pub type SynchronizedGroup<T> = Vec<MessageWithMetadata<T>>;

/// Message ordering key: the local wall-clock reception timestamp in
/// seconds. Works for messages of any type.
pub fn local_reception_timestamp<T>(_message: &T, transfer: &TransferFrom) -> f64 {
    transfer.timestamp.system_secs_f64()
}

/// Message ordering key: the local monotonic reception timestamp in
/// seconds. Works for messages of any type; may perform worse than the
/// wall-clock alternative because the monotonic clock is usually less
/// accurate.
pub fn local_reception_monotonic_timestamp<T>(_message: &T, transfer: &TransferFrom) -> f64 {
    transfer.timestamp.monotonic_secs_f64()
}

/// The delivery side shared by both synchronizers: a queue of completed
/// groups with an optional background forwarding task.
pub(crate) struct GroupQueue<T> {
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<SynchronizedGroup<T>>>>,
    background: Mutex<Option<AbortHandle>>,
}

impl<T: Send + 'static> GroupQueue<T> {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<SynchronizedGroup<T>>) -> Self {
        Self { rx: Arc::new(tokio::sync::Mutex::new(rx)), background: Mutex::new(None) }
    }

    pub(crate) async fn recv_until(
        &self,
        monotonic_deadline: Instant,
    ) -> Option<SynchronizedGroup<T>> {
        let mut rx = self.rx.lock().await;
        if monotonic_deadline <= Instant::now() {
            return rx.try_recv().ok();
        }
        tokio::time::timeout_at(monotonic_deadline, rx.recv()).await.ok().flatten()
    }

    pub(crate) async fn recv_for(&self, timeout: Duration) -> Option<SynchronizedGroup<T>> {
        self.recv_until(Instant::now() + timeout).await
    }

    /// Suspends until the next group; `None` once the feeding side is
    /// gone.
    pub(crate) async fn next(&self) -> Option<SynchronizedGroup<T>> {
        loop {
            let mut rx = self.rx.lock().await;
            match tokio::time::timeout(RECEIVE_SLICE, rx.recv()).await {
                Ok(Some(group)) => return Some(group),
                Ok(None) => return None,
                Err(_) => {}
            }
        }
    }

    pub(crate) fn forward_in_background<F>(&self, mut handler: F)
    where
        F: FnMut(SynchronizedGroup<T>) + Send + 'static,
    {
        let rx = Arc::clone(&self.rx);
        let task = tokio::spawn(async move {
            let mut rx = rx.lock().await;
            while let Some(group) = rx.recv().await {
                handler(group);
            }
        });
        let mut background = lock(&self.background);
        if let Some(previous) = background.replace(task.abort_handle()) {
            previous.abort();
        }
    }
}

impl<T> Drop for GroupQueue<T> {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.background).take() {
            task.abort();
        }
    }
}
