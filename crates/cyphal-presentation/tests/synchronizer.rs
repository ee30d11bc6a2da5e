//! Subscription synchronizer behavior over the loopback transport.

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use cyphal_dsdl::sample::Integer64;
use cyphal_presentation::{
    Presentation,
    synchronizer::{
        MonotonicClusteringSynchronizer, TransferIdSynchronizer, local_reception_timestamp,
    },
};
use cyphal_transport::loopback::LoopbackTransport;

const SUBJECTS: [u16; 3] = [2000, 2001, 2002];

fn values(group: &[(Integer64, cyphal_transport::TransferFrom)]) -> Vec<i64> {
    group.iter().map(|(message, _)| message.value).collect()
}

#[tokio::test]
async fn monotonic_clustering_groups_by_receipt_time() {
    let presentation = Presentation::new(LoopbackTransport::new(Some(1234)));
    let publishers: Vec<_> = SUBJECTS
        .iter()
        .map(|&subject| presentation.make_publisher::<Integer64>(subject).unwrap())
        .collect();
    let subscribers = SUBJECTS
        .iter()
        .map(|&subject| presentation.make_subscriber::<Integer64>(subject, None).unwrap())
        .collect();

    let synchronizer =
        MonotonicClusteringSynchronizer::new(subscribers, local_reception_timestamp, 0.5);
    assert!((synchronizer.tolerance() - 0.5).abs() < f64::EPSILON);

    // All three subjects within a fraction of the tolerance: one group.
    for (publisher, value) in publishers.iter().zip([10, 11, 12]) {
        assert!(publisher.publish(&Integer64 { value }).await.unwrap());
    }
    let group = synchronizer.receive_for(Duration::from_secs(1)).await.unwrap();
    assert_eq!(values(&group), [10, 11, 12]);

    // Only two subjects: no group may be emitted.
    assert!(publishers[0].publish(&Integer64 { value: 20 }).await.unwrap());
    assert!(publishers[1].publish(&Integer64 { value: 21 }).await.unwrap());
    assert_eq!(synchronizer.receive_for(Duration::from_millis(300)).await, None);

    // The third subject arrives within the tolerance window: the group
    // completes.
    assert!(publishers[2].publish(&Integer64 { value: 22 }).await.unwrap());
    let group = synchronizer.receive_for(Duration::from_secs(1)).await.unwrap();
    assert_eq!(values(&group), [20, 21, 22]);
}

#[tokio::test]
async fn monotonic_tolerance_is_adjustable_at_runtime() {
    let presentation = Presentation::new(LoopbackTransport::new(Some(1)));
    let subscribers = SUBJECTS
        .iter()
        .map(|&subject| presentation.make_subscriber::<Integer64>(subject, None).unwrap())
        .collect();
    let synchronizer =
        MonotonicClusteringSynchronizer::new(subscribers, local_reception_timestamp, 0.1);
    synchronizer.set_tolerance(0.75);
    assert!((synchronizer.tolerance() - 0.75).abs() < f64::EPSILON);
}

#[tokio::test]
async fn transfer_id_synchronizer_groups_by_source_and_id() {
    let presentation = Presentation::new(LoopbackTransport::new(Some(1234)));
    let publishers: Vec<_> = SUBJECTS
        .iter()
        .map(|&subject| presentation.make_publisher::<Integer64>(subject).unwrap())
        .collect();
    let subscribers = SUBJECTS
        .iter()
        .map(|&subject| presentation.make_subscriber::<Integer64>(subject, None).unwrap())
        .collect();
    let synchronizer = TransferIdSynchronizer::new(subscribers);

    // Every publisher's first message carries transfer-ID 0: one group.
    for (publisher, value) in publishers.iter().zip([1, 2, 3]) {
        assert!(publisher.publish(&Integer64 { value }).await.unwrap());
    }
    let group = synchronizer.receive_for(Duration::from_secs(1)).await.unwrap();
    assert_eq!(values(&group), [1, 2, 3]);
    for (_, transfer) in &group {
        assert_eq!(transfer.transfer_id, 0);
        assert_eq!(transfer.source_node_id, Some(1234));
    }

    // An incomplete round produces no output.
    assert!(publishers[0].publish(&Integer64 { value: 4 }).await.unwrap());
    assert!(publishers[1].publish(&Integer64 { value: 5 }).await.unwrap());
    assert_eq!(synchronizer.receive_for(Duration::from_millis(300)).await, None);
}
