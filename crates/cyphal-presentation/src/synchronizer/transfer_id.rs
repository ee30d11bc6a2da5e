//! Synchronization by `(source node-ID, transfer-ID)` equality.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cyphal_dsdl::Message;
use cyphal_transport::NodeId;
use tokio::{sync::mpsc, time::Instant};

use super::{GroupQueue, MessageWithMetadata, SynchronizedGroup};
use crate::{Subscriber, controller::lock};

/// Default cluster eviction span, chosen below the CAN transfer-ID
/// modulus of 32.
pub const DEFAULT_SPAN: u64 = 30;

/// Groups messages that share the same `(source node-ID, transfer-ID)`
/// pair; all messages of a group therefore originate from the same node.
/// Anonymous messages are dropped unconditionally because their source is
/// undefined.
///
/// The protocol specification does not recommend this mode of
/// synchronization; it is provided for completeness. Clusters older (in
/// sequence-number terms) than the configured span are evicted, which
/// bounds memory and avoids false matches when cyclic transfer-IDs wrap.
pub struct TransferIdSynchronizer<T: Message + Clone> {
    subscribers: Vec<Subscriber<T>>,
    queue: GroupQueue<T>,
}

impl<T: Message + Clone> TransferIdSynchronizer<T> {
    /// Creates a synchronizer over the given subscribers with the default
    /// span. The synchronizer takes ownership of the subscribers; they are
    /// closed when it is dropped.
    #[must_use]
    pub fn new(subscribers: Vec<Subscriber<T>>) -> Self {
        Self::with_span(subscribers, DEFAULT_SPAN)
    }

    /// Like [`TransferIdSynchronizer::new`] with an explicit span.
    #[must_use]
    pub fn with_span(subscribers: Vec<Subscriber<T>>, span: u64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let matcher = Arc::new(Mutex::new(Matcher::new(subscribers.len(), span)));
        for (index, subscriber) in subscribers.iter().enumerate() {
            let matcher = Arc::clone(&matcher);
            let tx = tx.clone();
            subscriber.receive_in_background(move |message, transfer| {
                let Some(source_node_id) = transfer.source_node_id else {
                    return; // Anonymous: the group key is undefined.
                };
                let key = (source_node_id, transfer.transfer_id);
                if let Some(group) = lock(&matcher).update(key, index, (message, transfer)) {
                    let _ = tx.send(group);
                }
            });
        }
        Self { subscribers, queue: GroupQueue::new(rx) }
    }

    /// The synchronized subscribers; the ordering matches the group
    /// entries.
    #[must_use]
    pub fn subscribers(&self) -> &[Subscriber<T>] {
        &self.subscribers
    }

    /// Suspends until a group is completed or the deadline expires.
    pub async fn receive(&self, monotonic_deadline: Instant) -> Option<SynchronizedGroup<T>> {
        self.queue.recv_until(monotonic_deadline).await
    }

    /// Like [`TransferIdSynchronizer::receive`] with a relative timeout.
    pub async fn receive_for(&self, timeout: Duration) -> Option<SynchronizedGroup<T>> {
        self.queue.recv_for(timeout).await
    }

    /// Non-suspending poll returning the messages only.
    pub async fn get(&self) -> Option<Vec<T>> {
        let group = self.queue.recv_until(Instant::now()).await?;
        Some(group.into_iter().map(|(message, _)| message).collect())
    }

    /// Suspends until the next group. The iteration analog of
    /// [`TransferIdSynchronizer::receive`].
    pub async fn next(&self) -> Option<SynchronizedGroup<T>> {
        self.queue.next().await
    }

    /// Invokes the handler from a background task for every completed
    /// group. Shall not be combined with the direct `receive*` methods.
    pub fn receive_in_background<F>(&self, handler: F)
    where
        F: FnMut(SynchronizedGroup<T>) + Send + 'static,
    {
        self.queue.forward_in_background(handler);
    }

    /// Like [`TransferIdSynchronizer::receive_in_background`] with the
    /// metadata stripped.
    pub fn get_in_background<F>(&self, mut handler: F)
    where
        F: FnMut(Vec<T>) + Send + 'static,
    {
        self.receive_in_background(move |group| {
            handler(group.into_iter().map(|(message, _)| message).collect());
        });
    }

    /// Closes the synchronizer and its subscribers. Equivalent to
    /// dropping it.
    pub fn close(self) {}
}

struct Cluster<T> {
    seq_no: u64,
    slots: Vec<Option<MessageWithMetadata<T>>>,
}

impl<T> Cluster<T> {
    fn new(size: usize, seq_no: u64) -> Self {
        Self { seq_no, slots: (0..size).map(|_| None).collect() }
    }

    fn put(&mut self, index: usize, item: MessageWithMetadata<T>) -> Option<SynchronizedGroup<T>> {
        self.slots[index] = Some(item);
        if self.slots.iter().all(Option::is_some) {
            Some(self.slots.drain(..).flatten().collect())
        } else {
            None
        }
    }
}

struct Matcher<T> {
    clusters: HashMap<(NodeId, u64), Cluster<T>>,
    subject_count: usize,
    span: u64,
    seq_counter: u64,
}

impl<T> Matcher<T> {
    fn new(subject_count: usize, span: u64) -> Self {
        Self { clusters: HashMap::new(), subject_count, span: span.max(1), seq_counter: 0 }
    }

    fn update(
        &mut self,
        key: (NodeId, u64),
        index: usize,
        item: MessageWithMetadata<T>,
    ) -> Option<SynchronizedGroup<T>> {
        if !self.clusters.contains_key(&key) {
            // Evict clusters that aged beyond the span before admitting a
            // new one.
            let horizon = self.seq_counter;
            let span = self.span;
            self.clusters.retain(|_, cluster| horizon - cluster.seq_no < span);
            self.clusters.insert(key, Cluster::new(self.subject_count, self.seq_counter));
            self.seq_counter += 1;
        }
        let Some(cluster) = self.clusters.get_mut(&key) else {
            return None;
        };
        let result = cluster.put(index, item);
        if result.is_some() {
            self.clusters.remove(&key);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cyphal_transport::{Priority, Timestamp, TransferFrom};

    fn meta() -> TransferFrom {
        TransferFrom {
            timestamp: Timestamp::now(),
            priority: Priority::Nominal,
            transfer_id: 0,
            fragmented_payload: Vec::new(),
            source_node_id: Some(1),
        }
    }

    fn values(group: SynchronizedGroup<u32>) -> Vec<u32> {
        group.into_iter().map(|(v, _)| v).collect()
    }

    #[test]
    fn groups_complete_per_key() {
        let mut mat: Matcher<u32> = Matcher::new(3, 3);

        assert!(mat.update((1, 0), 1, (51, meta())).is_none());
        assert!(mat.update((1, 1), 1, (51, meta())).is_none());
        assert!(mat.update((1, 1), 0, (50, meta())).is_none());
        assert!(mat.update((1, 2), 1, (61, meta())).is_none());
        assert!(mat.update((1, 2), 2, (62, meta())).is_none());
        assert_eq!(mat.clusters.len(), 3);

        // The span limit evicts the oldest cluster when a new one arrives.
        assert!(mat.update((1, 3), 0, (40, meta())).is_none());
        assert_eq!(mat.clusters.len(), 3);
        assert!(mat.update((1, 3), 1, (41, meta())).is_none());

        let group = mat.update((1, 1), 2, (52, meta()));
        assert_eq!(group.map(values), Some(vec![50, 51, 52]));
        assert_eq!(mat.clusters.len(), 2);

        let group = mat.update((1, 2), 0, (60, meta()));
        assert_eq!(group.map(values), Some(vec![60, 61, 62]));
        assert_eq!(mat.clusters.len(), 1);
    }

    #[test]
    fn distinct_sources_never_group() {
        let mut mat: Matcher<u32> = Matcher::new(2, 10);
        assert!(mat.update((1, 7), 0, (1, meta())).is_none());
        assert!(mat.update((2, 7), 1, (2, meta())).is_none());
        assert_eq!(mat.clusters.len(), 2);
    }
}
