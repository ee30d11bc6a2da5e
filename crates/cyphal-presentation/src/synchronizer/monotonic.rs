//! Synchronization by monotonic key clustering.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cyphal_dsdl::Message;
use cyphal_transport::TransferFrom;
use tokio::{sync::mpsc, time::Instant};

use super::{GroupQueue, MessageWithMetadata, SynchronizedGroup};
use crate::{Subscriber, controller::lock};

/// Default limit on the number of clusters kept at any moment.
pub const DEFAULT_DEPTH: usize = 15;

/// Groups messages whose ordering keys fall within a configurable
/// tolerance of each other.
///
/// The key function maps each received message to a monotonically
/// non-decreasing float, such as the timestamp field of the message or the
/// local reception timestamp (see
/// [`local_reception_timestamp`](super::local_reception_timestamp)).
/// Messages are sorted into clusters; once a cluster has a message from
/// every subscriber it is emitted, and all clusters with smaller keys are
/// dropped. Each received message is used at most once; if a cluster
/// receives several messages from the same subject, the latest one wins.
///
/// The number of clusters is bounded by the depth limit, which protects
/// against the key leaping backwards (e.g. when the synchronized time is
/// adjusted): when the limit is exceeded, the cluster with the smallest
/// sequence number is dropped first.
///
/// The tolerance can be changed at runtime, which enables feedback-driven
/// auto-tuning: if the tolerance is too small, more groups are skipped, so
/// the key delta between successfully emitted groups grows, and the
/// tolerance can be updated as a function of that delta.
pub struct MonotonicClusteringSynchronizer<T: Message + Clone> {
    subscribers: Vec<Subscriber<T>>,
    queue: GroupQueue<T>,
    tolerance: Arc<Mutex<f64>>,
}

impl<T: Message + Clone> MonotonicClusteringSynchronizer<T> {
    /// Creates a synchronizer over the given subscribers with the default
    /// depth limit. The synchronizer takes ownership of the subscribers;
    /// they are closed when it is dropped.
    pub fn new<F>(subscribers: Vec<Subscriber<T>>, key_function: F, tolerance: f64) -> Self
    where
        F: Fn(&T, &TransferFrom) -> f64 + Send + Sync + 'static,
    {
        Self::with_depth(subscribers, key_function, tolerance, DEFAULT_DEPTH)
    }

    /// Like [`MonotonicClusteringSynchronizer::new`] with an explicit
    /// depth limit.
    pub fn with_depth<F>(
        subscribers: Vec<Subscriber<T>>,
        key_function: F,
        tolerance: f64,
        depth: usize,
    ) -> Self
    where
        F: Fn(&T, &TransferFrom) -> f64 + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let matcher = Arc::new(Mutex::new(Matcher::new(subscribers.len(), depth)));
        let tolerance = Arc::new(Mutex::new(tolerance));
        let key_function = Arc::new(key_function);
        for (index, subscriber) in subscribers.iter().enumerate() {
            let matcher = Arc::clone(&matcher);
            let tolerance = Arc::clone(&tolerance);
            let key_function = Arc::clone(&key_function);
            let tx = tx.clone();
            subscriber.receive_in_background(move |message, transfer| {
                let key = key_function(&message, &transfer);
                let accepted_tolerance = *lock(&tolerance);
                let emitted =
                    lock(&matcher).update(key, accepted_tolerance, index, (message, transfer));
                if let Some(group) = emitted {
                    let _ = tx.send(group);
                }
            });
        }
        Self { subscribers, queue: GroupQueue::new(rx), tolerance }
    }

    /// The current tolerance.
    #[must_use]
    pub fn tolerance(&self) -> f64 {
        *lock(&self.tolerance)
    }

    /// Changes the tolerance; takes effect for subsequently received
    /// messages.
    pub fn set_tolerance(&self, value: f64) {
        *lock(&self.tolerance) = value;
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

    /// Like [`MonotonicClusteringSynchronizer::receive`] with a relative
    /// timeout.
    pub async fn receive_for(&self, timeout: Duration) -> Option<SynchronizedGroup<T>> {
        self.queue.recv_for(timeout).await
    }

    /// Non-suspending poll returning the messages only.
    pub async fn get(&self) -> Option<Vec<T>> {
        let group = self.queue.recv_until(Instant::now()).await?;
        Some(group.into_iter().map(|(message, _)| message).collect())
    }

    /// Suspends until the next group. The iteration analog of
    /// [`MonotonicClusteringSynchronizer::receive`].
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

    /// Like [`MonotonicClusteringSynchronizer::receive_in_background`]
    /// with the metadata stripped.
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
    key: f64,
    seq_no: u64,
    slots: Vec<Option<MessageWithMetadata<T>>>,
}

impl<T> Cluster<T> {
    fn new(key: f64, size: usize, seq_no: u64) -> Self {
        Self { key, seq_no, slots: (0..size).map(|_| None).collect() }
    }

    fn delta(&self, key: f64) -> f64 {
        (self.key - key).abs()
    }

    /// Stores the item; returns the completed group once every slot is
    /// occupied.
    fn put(&mut self, index: usize, item: MessageWithMetadata<T>) -> Option<SynchronizedGroup<T>> {
        self.slots[index] = Some(item);
        if self.slots.iter().all(Option::is_some) {
            Some(self.slots.drain(..).flatten().collect())
        } else {
            None
        }
    }
}

/// Key-ordered bounded set of clusters.
struct Matcher<T> {
    clusters: Vec<Cluster<T>>, // Sorted by key.
    subject_count: usize,
    depth: usize,
    seq_counter: u64,
}

impl<T> Matcher<T> {
    fn new(subject_count: usize, depth: usize) -> Self {
        Self { clusters: Vec::new(), subject_count, depth: depth.max(1), seq_counter: 0 }
    }

    fn update(
        &mut self,
        key: f64,
        tolerance: f64,
        index: usize,
        item: MessageWithMetadata<T>,
    ) -> Option<SynchronizedGroup<T>> {
        let insertion = self.clusters.partition_point(|c| c.key < key);
        // Up to three neighbors of the bisection point are candidates.
        let chosen = [insertion.wrapping_sub(1), insertion, insertion + 1]
            .into_iter()
            .filter(|&i| i < self.clusters.len())
            .map(|i| (self.clusters[i].delta(key), i))
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .filter(|(delta, _)| *delta <= tolerance)
            .map(|(_, i)| i);
        let chosen = match chosen {
            Some(i) => i,
            None => self.new_cluster(key),
        };
        let result = self.clusters[chosen].put(index, item);
        if result.is_some() {
            // The group is complete: this cluster and everything older is
            // dropped so that each message is used at most once.
            let emitted_key = self.clusters[chosen].key;
            self.clusters.retain(|c| c.key > emitted_key);
        }
        result
    }

    /// Inserts a new cluster at the key, evicting the oldest (smallest
    /// sequence number) cluster if the depth limit would be exceeded.
    /// Returns the index of the new cluster.
    fn new_cluster(&mut self, key: f64) -> usize {
        if self.clusters.len() >= self.depth {
            if let Some(oldest) = self
                .clusters
                .iter()
                .enumerate()
                .min_by_key(|(_, c)| c.seq_no)
                .map(|(i, _)| i)
            {
                self.clusters.remove(oldest);
            }
        }
        let cluster = Cluster::new(key, self.subject_count, self.seq_counter);
        self.seq_counter += 1;
        let position = self.clusters.partition_point(|c| c.key < key);
        self.clusters.insert(position, cluster);
        position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> TransferFrom {
        TransferFrom {
            timestamp: cyphal_transport::Timestamp::now(),
            priority: cyphal_transport::Priority::Nominal,
            transfer_id: 0,
            fragmented_payload: Vec::new(),
            source_node_id: Some(1),
        }
    }

    fn values(group: SynchronizedGroup<u32>) -> Vec<u32> {
        group.into_iter().map(|(v, _)| v).collect()
    }

    #[test]
    fn cluster_completes_when_all_slots_are_filled() {
        let mut cluster: Cluster<u32> = Cluster::new(5.0, 3, 0);
        assert!((cluster.delta(5.1) - 0.1).abs() < 1e-9);
        assert!(cluster.put(1, (11, meta())).is_none());
        assert!(cluster.put(0, (10, meta())).is_none());
        let group = cluster.put(2, (12, meta()));
        assert_eq!(group.map(values), Some(vec![10, 11, 12]));
    }

    #[test]
    fn matcher_clusters_by_key_distance() {
        let mut mat: Matcher<u32> = Matcher::new(3, 3);

        assert!(mat.update(1.0, 0.5, 1, (51, meta())).is_none());
        assert_eq!(mat.clusters.len(), 1);

        assert!(mat.update(5.0, 0.5, 1, (51, meta())).is_none());
        assert_eq!(mat.clusters.len(), 2);

        // Close enough to the 5.0 cluster: no new cluster is created.
        assert!(mat.update(4.8, 0.5, 0, (50, meta())).is_none());
        assert_eq!(mat.clusters.len(), 2);

        assert!(mat.update(6.0, 0.5, 1, (61, meta())).is_none());
        assert_eq!(mat.clusters.len(), 3);

        assert!(mat.update(6.4, 0.5, 2, (62, meta())).is_none());
        assert_eq!(mat.clusters.len(), 3);

        // The depth limit evicts the oldest cluster (key 1.0).
        assert!(mat.update(4.0, 0.5, 0, (40, meta())).is_none());
        assert_eq!(mat.clusters.len(), 3);

        assert!(mat.update(4.0, 0.5, 1, (41, meta())).is_none());
        assert_eq!(mat.clusters.len(), 3);

        // Completes the 5.0 cluster; older clusters are dropped with it.
        let group = mat.update(5.4, 0.5, 2, (52, meta()));
        assert_eq!(group.map(values), Some(vec![50, 51, 52]));
        assert_eq!(mat.clusters.len(), 1);

        // A large tolerance attaches to the remaining 6.x cluster.
        let group = mat.update(9.1, 10.0, 0, (60, meta()));
        assert_eq!(group.map(values), Some(vec![60, 61, 62]));
        assert_eq!(mat.clusters.len(), 0);
    }

    #[test]
    fn latest_message_wins_within_a_cluster() {
        let mut mat: Matcher<u32> = Matcher::new(2, 4);
        assert!(mat.update(1.0, 0.5, 0, (1, meta())).is_none());
        assert!(mat.update(1.1, 0.5, 0, (2, meta())).is_none());
        let group = mat.update(1.2, 0.5, 1, (3, meta()));
        assert_eq!(group.map(values), Some(vec![2, 3]));
    }
}
